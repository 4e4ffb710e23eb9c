use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{get_row, map_db_error},
    schemas::{value_i64, value_str},
    services::{
        late_fees::format_cents,
        messaging::{queue_message, OutboundMessage},
        notification_center::{emit_event, EmitNotificationEventInput},
    },
    state::AppState,
};

/// Lifecycle of a gateway payment, ordered by precedence. A stored payment
/// only moves to a status of higher rank, so late deliveries cannot regress it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Failed,
    Canceled,
    Succeeded,
    Refunded,
}

impl PaymentStatus {
    pub fn rank(self) -> i32 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Failed => 2,
            Self::Canceled => 3,
            Self::Succeeded => 4,
            Self::Refunded => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Succeeded => "succeeded",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "succeeded" => Some(Self::Succeeded),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

/// Payment row derived from one gateway event, keyed by PaymentIntent id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentUpsert {
    pub stripe_payment_intent_id: String,
    pub organization_id: String,
    pub lease_id: String,
    pub unit_id: Option<String>,
    pub tenant_id: Option<String>,
    /// Amount applied to the ledger, net of the processing fee.
    pub amount_cents: i64,
    pub fee_cents: i64,
    pub gross_amount_cents: i64,
    pub refunded_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub method: Option<String>,
    pub autopay: bool,
    pub failure_reason: Option<String>,
    pub event_id: String,
    pub event_created_at: DateTime<Utc>,
}

/// Map a Stripe event to the payment record it implies. Event types that do
/// not touch payments yield `None`.
pub fn build_payment_upsert(event: &Value) -> AppResult<Option<PaymentUpsert>> {
    let event_type = value_str(event, "type");
    let object = event
        .get("data")
        .and_then(|data| data.get("object"))
        .cloned()
        .unwrap_or(Value::Null);

    let (status, payment_intent_id, gross_amount_cents) = match event_type.as_str() {
        "payment_intent.processing" => (
            PaymentStatus::Processing,
            value_str(&object, "id"),
            value_i64(&object, "amount").unwrap_or(0),
        ),
        "payment_intent.succeeded" => (
            PaymentStatus::Succeeded,
            value_str(&object, "id"),
            value_i64(&object, "amount_received")
                .filter(|amount| *amount > 0)
                .or_else(|| value_i64(&object, "amount"))
                .unwrap_or(0),
        ),
        "payment_intent.payment_failed" => (
            PaymentStatus::Failed,
            value_str(&object, "id"),
            value_i64(&object, "amount").unwrap_or(0),
        ),
        "payment_intent.canceled" => (
            PaymentStatus::Canceled,
            value_str(&object, "id"),
            value_i64(&object, "amount").unwrap_or(0),
        ),
        "charge.refunded" => {
            let fully_refunded = object
                .get("refunded")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let status = if fully_refunded {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::Succeeded
            };
            (
                status,
                value_str(&object, "payment_intent"),
                value_i64(&object, "amount_captured")
                    .filter(|amount| *amount > 0)
                    .or_else(|| value_i64(&object, "amount"))
                    .unwrap_or(0),
            )
        }
        _ => return Ok(None),
    };

    let event_id = value_str(event, "id");
    if event_id.is_empty() {
        return Err(AppError::BadRequest("Webhook event has no id.".to_string()));
    }
    if payment_intent_id.is_empty() {
        return Err(AppError::BadRequest(format!(
            "{event_type} event {event_id} has no PaymentIntent id."
        )));
    }
    let event_created_at = value_i64(event, "created")
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .ok_or_else(|| {
            AppError::BadRequest(format!("Event {event_id} has no valid created timestamp."))
        })?;

    let metadata = object.get("metadata").cloned().unwrap_or(Value::Null);
    let organization_id = value_str(&metadata, "organization_id");
    let lease_id = value_str(&metadata, "lease_id");
    if organization_id.is_empty() || lease_id.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Event {event_id} is missing organization_id/lease_id metadata."
        )));
    }

    let fee_cents = value_i64(&metadata, "fee_cents")
        .unwrap_or(0)
        .clamp(0, gross_amount_cents.max(0));
    let refunded_cents = if event_type == "charge.refunded" {
        value_i64(&object, "amount_refunded").unwrap_or(0).max(0)
    } else {
        0
    };

    let failure_reason = match status {
        PaymentStatus::Failed => object
            .get("last_payment_error")
            .map(|error| value_str(error, "message"))
            .filter(|message| !message.is_empty())
            .or_else(|| Some("Payment failed.".to_string())),
        PaymentStatus::Canceled => Some(value_str(&object, "cancellation_reason"))
            .filter(|reason| !reason.is_empty()),
        _ => None,
    };

    let method = object
        .get("payment_method_types")
        .and_then(Value::as_array)
        .and_then(|types| types.first())
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .or_else(|| {
            object
                .get("payment_method_details")
                .map(|details| value_str(details, "type"))
                .filter(|kind| !kind.is_empty())
        });

    Ok(Some(PaymentUpsert {
        stripe_payment_intent_id: payment_intent_id,
        organization_id,
        lease_id,
        unit_id: Some(value_str(&metadata, "unit_id")).filter(|id| !id.is_empty()),
        tenant_id: Some(value_str(&metadata, "tenant_id")).filter(|id| !id.is_empty()),
        amount_cents: gross_amount_cents - fee_cents,
        fee_cents,
        gross_amount_cents,
        refunded_cents: refunded_cents.min(gross_amount_cents - fee_cents).max(0),
        currency: Some(value_str(&object, "currency"))
            .filter(|currency| !currency.is_empty())
            .unwrap_or_else(|| "usd".to_string()),
        status,
        method,
        autopay: value_str(&metadata, "autopay") == "true",
        failure_reason,
        event_id,
        event_created_at,
    }))
}

/// Whether an incoming event may overwrite the stored payment state.
pub fn should_apply_transition(
    current: Option<(PaymentStatus, DateTime<Utc>)>,
    incoming: PaymentStatus,
    incoming_created_at: DateTime<Utc>,
) -> bool {
    match current {
        None => true,
        Some((status, created_at)) => {
            incoming.rank() > status.rank()
                || (incoming.rank() == status.rank() && incoming_created_at > created_at)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Event id already processed.
    Duplicate,
    /// Event type does not affect payments.
    Ignored,
    /// Stored payment already reflects an equal or later state.
    Stale,
    Applied { payment: Value },
}

/// The `WHERE` on the conflict branch is `should_apply_transition` in SQL:
/// the row is locked and checked first, and the predicate still guards the
/// insert race where two events create the same payment.
const UPSERT_PAYMENT_SQL: &str = "
    INSERT INTO payments (
        organization_id, lease_id, unit_id, tenant_id, amount_cents, fee_cents,
        gross_amount_cents, refunded_cents, currency, status, status_rank, method,
        source, autopay, failure_reason, stripe_payment_intent_id,
        stripe_event_id, stripe_event_created_at, paid_at
    )
    VALUES (
        $1::uuid, $2::uuid, $3::uuid, $4, $5, $6, $7, $8, $9, $10, $11, $12,
        'stripe', $13, $14, $15, $16, $17,
        CASE WHEN $10 = 'succeeded' THEN $17 ELSE NULL END
    )
    ON CONFLICT (stripe_payment_intent_id) DO UPDATE SET
        amount_cents = EXCLUDED.amount_cents,
        fee_cents = EXCLUDED.fee_cents,
        gross_amount_cents = EXCLUDED.gross_amount_cents,
        refunded_cents = EXCLUDED.refunded_cents,
        status = EXCLUDED.status,
        status_rank = EXCLUDED.status_rank,
        method = COALESCE(EXCLUDED.method, payments.method),
        failure_reason = EXCLUDED.failure_reason,
        stripe_event_id = EXCLUDED.stripe_event_id,
        stripe_event_created_at = EXCLUDED.stripe_event_created_at,
        paid_at = COALESCE(payments.paid_at, EXCLUDED.paid_at),
        updated_at = now()
    WHERE payments.status_rank < EXCLUDED.status_rank
       OR (payments.status_rank = EXCLUDED.status_rank
           AND COALESCE(payments.stripe_event_created_at, '-infinity'::timestamptz)
               < EXCLUDED.stripe_event_created_at)
    RETURNING row_to_json(payments.*) AS row";

/// Apply one verified gateway event. The event id and the payment upsert
/// commit together, so a redelivery is acknowledged without side effects.
pub async fn apply_webhook_event(state: &AppState, event: &Value) -> AppResult<WebhookOutcome> {
    let pool = state.pool()?;
    let event_id = value_str(event, "id");
    let event_type = value_str(event, "type");
    if event_id.is_empty() {
        return Err(AppError::BadRequest("Webhook event has no id.".to_string()));
    }

    let upsert = build_payment_upsert(event)?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let recorded = sqlx::query(
        "INSERT INTO stripe_webhook_events (id, event_type)
         VALUES ($1, $2)
         ON CONFLICT (id) DO NOTHING
         RETURNING id",
    )
    .bind(&event_id)
    .bind(&event_type)
    .fetch_optional(&mut *tx)
    .await
    .map_err(map_db_error)?;
    if recorded.is_none() {
        tx.rollback().await.map_err(map_db_error)?;
        tracing::info!(event_id = %event_id, "Duplicate Stripe event ignored");
        return Ok(WebhookOutcome::Duplicate);
    }

    let Some(upsert) = upsert else {
        tx.commit().await.map_err(map_db_error)?;
        return Ok(WebhookOutcome::Ignored);
    };

    let stored = sqlx::query(
        "SELECT status, stripe_event_created_at FROM payments
         WHERE stripe_payment_intent_id = $1 FOR UPDATE",
    )
    .bind(&upsert.stripe_payment_intent_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(map_db_error)?
    .and_then(|row| {
        let status = PaymentStatus::parse(&row.try_get::<String, _>("status").ok()?)?;
        let created_at = row
            .try_get::<Option<DateTime<Utc>>, _>("stripe_event_created_at")
            .ok()
            .flatten()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Some((status, created_at))
    });
    let prior_status = stored.map(|(status, _)| status);

    if !should_apply_transition(stored, upsert.status, upsert.event_created_at) {
        tx.commit().await.map_err(map_db_error)?;
        tracing::info!(
            event_id = %event_id,
            payment_intent = %upsert.stripe_payment_intent_id,
            status = upsert.status.as_str(),
            "Stale Stripe event skipped"
        );
        return Ok(WebhookOutcome::Stale);
    }

    let row = sqlx::query(UPSERT_PAYMENT_SQL)
        .bind(&upsert.organization_id)
        .bind(&upsert.lease_id)
        .bind(upsert.unit_id.as_deref())
        .bind(upsert.tenant_id.as_deref())
        .bind(upsert.amount_cents)
        .bind(upsert.fee_cents)
        .bind(upsert.gross_amount_cents)
        .bind(upsert.refunded_cents)
        .bind(&upsert.currency)
        .bind(upsert.status.as_str())
        .bind(upsert.status.rank())
        .bind(upsert.method.as_deref())
        .bind(upsert.autopay)
        .bind(upsert.failure_reason.as_deref())
        .bind(&upsert.stripe_payment_intent_id)
        .bind(&upsert.event_id)
        .bind(upsert.event_created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?;
    tx.commit().await.map_err(map_db_error)?;

    let Some(payment) = row.and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten())
    else {
        tracing::info!(
            event_id = %event_id,
            payment_intent = %upsert.stripe_payment_intent_id,
            status = upsert.status.as_str(),
            "Stale Stripe event skipped"
        );
        return Ok(WebhookOutcome::Stale);
    };

    tracing::info!(
        event_id = %event_id,
        payment_intent = %upsert.stripe_payment_intent_id,
        status = upsert.status.as_str(),
        "Payment updated from Stripe event"
    );

    if prior_status != Some(upsert.status) {
        match upsert.status {
            PaymentStatus::Succeeded => announce_payment_succeeded(state, &upsert, &payment).await,
            PaymentStatus::Failed => announce_payment_failed(state, &upsert, &payment).await,
            _ => {}
        }
    }

    Ok(WebhookOutcome::Applied { payment })
}

async fn announce_payment_succeeded(state: &AppState, upsert: &PaymentUpsert, payment: &Value) {
    let Some(pool) = state.db_pool.as_ref() else {
        return;
    };
    let payment_id = value_str(payment, "id");
    let amount = format_cents(upsert.amount_cents);

    let _ = emit_event(
        pool,
        EmitNotificationEventInput {
            organization_id: upsert.organization_id.clone(),
            event_type: "payment_succeeded".to_string(),
            category: "payments".to_string(),
            severity: "info".to_string(),
            title: "Payment received".to_string(),
            body: format!(
                "{} payment of {amount} received.",
                if upsert.autopay { "Autopay" } else { "Online" }
            ),
            link_path: Some(format!("/leases/{}", upsert.lease_id)),
            source_table: Some("payments".to_string()),
            source_id: Some(payment_id.clone()),
            actor_user_id: None,
            payload: Map::from_iter([
                ("lease_id".to_string(), json!(upsert.lease_id)),
                ("amount_cents".to_string(), json!(upsert.amount_cents)),
            ]),
            dedupe_key: Some(format!("payment_succeeded:{}", upsert.stripe_payment_intent_id)),
            fallback_roles: Vec::new(),
        },
    )
    .await;

    let Ok(lease) = get_row(pool, "leases", &upsert.lease_id, "id").await else {
        return;
    };
    let tenant_email = value_str(&lease, "tenant_email");
    if tenant_email.is_empty() {
        return;
    }
    let mut body = format!(
        "We received your payment of {amount}. Reference: {}.",
        upsert.stripe_payment_intent_id
    );
    if upsert.fee_cents > 0 {
        body.push_str(&format!(
            "\nProcessing fee: {}. Total charged: {}.",
            format_cents(upsert.fee_cents),
            format_cents(upsert.gross_amount_cents)
        ));
    }
    let receipt = OutboundMessage {
        organization_id: upsert.organization_id.clone(),
        channel: "email".to_string(),
        recipient: tenant_email,
        subject: Some("Payment receipt".to_string()),
        body,
        kind: "payment_receipt".to_string(),
        related_id: Some(payment_id),
    };
    if let Err(error) = queue_message(pool, &receipt).await {
        tracing::warn!(lease_id = %upsert.lease_id, error = %error, "Failed to queue payment receipt");
    }
}

async fn announce_payment_failed(state: &AppState, upsert: &PaymentUpsert, payment: &Value) {
    let Some(pool) = state.db_pool.as_ref() else {
        return;
    };
    let _ = emit_event(
        pool,
        EmitNotificationEventInput {
            organization_id: upsert.organization_id.clone(),
            event_type: "payment_failed".to_string(),
            category: "payments".to_string(),
            severity: "warning".to_string(),
            title: "Payment failed".to_string(),
            body: format!(
                "A payment of {} failed: {}",
                format_cents(upsert.amount_cents),
                upsert.failure_reason.as_deref().unwrap_or("unknown reason")
            ),
            link_path: Some(format!("/leases/{}", upsert.lease_id)),
            source_table: Some("payments".to_string()),
            source_id: Some(value_str(payment, "id")),
            actor_user_id: None,
            payload: Map::from_iter([("lease_id".to_string(), json!(upsert.lease_id))]),
            dedupe_key: Some(format!("payment_failed:{}", upsert.event_id)),
            fallback_roles: Vec::new(),
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use serde_json::{json, Value};

    use super::{build_payment_upsert, should_apply_transition, PaymentStatus};

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).expect("valid timestamp")
    }

    fn intent_event(event_type: &str, created: i64, object: Value) -> Value {
        json!({
            "id": format!("evt_{created}"),
            "type": event_type,
            "created": created,
            "data": { "object": object },
        })
    }

    fn intent(extra: Value) -> Value {
        let mut object = json!({
            "id": "pi_123",
            "amount": 154_500,
            "amount_received": 154_500,
            "currency": "usd",
            "payment_method_types": ["card"],
            "metadata": {
                "organization_id": "org-1",
                "lease_id": "lease-1",
                "unit_id": "unit-1",
                "tenant_id": "user-1",
                "autopay": "true",
                "fee_cents": "4500"
            }
        });
        if let (Some(base), Some(extra)) = (object.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        object
    }

    #[test]
    fn ranks_follow_status_precedence() {
        let ordered = [
            PaymentStatus::Pending,
            PaymentStatus::Processing,
            PaymentStatus::Failed,
            PaymentStatus::Canceled,
            PaymentStatus::Succeeded,
            PaymentStatus::Refunded,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
            assert_eq!(PaymentStatus::parse(pair[1].as_str()), Some(pair[1]));
        }
    }

    #[test]
    fn succeeded_intent_maps_to_net_amount() {
        let event = intent_event("payment_intent.succeeded", 1_700_000_000, intent(json!({})));
        let upsert = build_payment_upsert(&event)
            .expect("valid event")
            .expect("payment event");

        assert_eq!(upsert.stripe_payment_intent_id, "pi_123");
        assert_eq!(upsert.status, PaymentStatus::Succeeded);
        assert_eq!(upsert.gross_amount_cents, 154_500);
        assert_eq!(upsert.fee_cents, 4_500);
        assert_eq!(upsert.amount_cents, 150_000);
        assert!(upsert.autopay);
        assert_eq!(upsert.method.as_deref(), Some("card"));
        assert_eq!(upsert.tenant_id.as_deref(), Some("user-1"));
        assert_eq!(upsert.event_created_at, at(1_700_000_000));
    }

    #[test]
    fn failed_intent_carries_failure_reason() {
        let object = intent(json!({
            "last_payment_error": { "message": "Your card was declined." }
        }));
        let event = intent_event("payment_intent.payment_failed", 1_700_000_100, object);
        let upsert = build_payment_upsert(&event).expect("valid").expect("payment");
        assert_eq!(upsert.status, PaymentStatus::Failed);
        assert_eq!(upsert.failure_reason.as_deref(), Some("Your card was declined."));
    }

    #[test]
    fn refund_events_key_on_the_payment_intent() {
        let charge = json!({
            "id": "ch_1",
            "object": "charge",
            "payment_intent": "pi_123",
            "amount": 154_500,
            "amount_captured": 154_500,
            "amount_refunded": 50_000,
            "refunded": false,
            "currency": "usd",
            "payment_method_details": { "type": "us_bank_account" },
            "metadata": { "organization_id": "org-1", "lease_id": "lease-1", "fee_cents": "4500" }
        });
        let partial = build_payment_upsert(&intent_event("charge.refunded", 1_700_000_200, charge.clone()))
            .expect("valid")
            .expect("payment");
        assert_eq!(partial.stripe_payment_intent_id, "pi_123");
        assert_eq!(partial.status, PaymentStatus::Succeeded);
        assert_eq!(partial.refunded_cents, 50_000);
        assert_eq!(partial.method.as_deref(), Some("us_bank_account"));

        let mut full = charge;
        full["refunded"] = json!(true);
        full["amount_refunded"] = json!(154_500);
        let full = build_payment_upsert(&intent_event("charge.refunded", 1_700_000_300, full))
            .expect("valid")
            .expect("payment");
        assert_eq!(full.status, PaymentStatus::Refunded);
        assert_eq!(full.refunded_cents, 150_000);
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let event = intent_event("customer.created", 1_700_000_000, json!({ "id": "cus_1" }));
        assert!(build_payment_upsert(&event).expect("valid").is_none());
    }

    #[test]
    fn missing_metadata_is_rejected() {
        let event = intent_event(
            "payment_intent.succeeded",
            1_700_000_000,
            json!({ "id": "pi_1", "amount": 100, "metadata": { "lease_id": "lease-1" } }),
        );
        assert!(build_payment_upsert(&event).is_err());

        let no_created = json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": intent(json!({})) }
        });
        assert!(build_payment_upsert(&no_created).is_err());
    }

    #[test]
    fn transitions_never_regress() {
        let stored = Some((PaymentStatus::Succeeded, at(200)));
        // processing delivered after succeeded
        assert!(!should_apply_transition(stored, PaymentStatus::Processing, at(300)));
        assert!(should_apply_transition(stored, PaymentStatus::Refunded, at(100)));
        assert!(should_apply_transition(None, PaymentStatus::Pending, at(1)));
    }

    #[test]
    fn equal_rank_prefers_newer_event() {
        let stored = Some((PaymentStatus::Succeeded, at(200)));
        assert!(should_apply_transition(stored, PaymentStatus::Succeeded, at(201)));
        assert!(!should_apply_transition(stored, PaymentStatus::Succeeded, at(200)));
        assert!(!should_apply_transition(stored, PaymentStatus::Succeeded, at(199)));
    }

    #[test]
    fn manual_row_without_event_time_takes_equal_rank_update() {
        // Rows written outside webhooks have no event time; the upsert treats
        // that as -infinity, so the decision uses the earliest timestamp.
        let stored = Some((PaymentStatus::Processing, DateTime::<Utc>::MIN_UTC));
        assert!(should_apply_transition(stored, PaymentStatus::Processing, at(1)));
        assert!(!should_apply_transition(stored, PaymentStatus::Pending, at(1)));
    }
}
