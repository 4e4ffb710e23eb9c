use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::list_rows,
    schemas::{
        clamp_limit_in_range, non_empty_opt, validate_input, CreatePaymentInput, LeasePath,
        PaymentsQuery,
    },
    services::{
        autopay::DEFAULT_CURRENCY,
        ledger::{get_lease_totals, LeaseTerms},
        payments::{create_payment_intent, verify_stripe_signature, PaymentIntentRequest},
        stripe_webhooks::apply_webhook_event,
    },
    state::AppState,
    tenancy::{load_lease_for_user, LeaseAccess},
};

/// Stripe refuses charges below 50 cents.
const MIN_PAYMENT_CENTS: i64 = 50;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/leases/{lease_id}/payments",
            axum::routing::get(list_lease_payments).post(create_lease_payment),
        )
        .route("/webhooks/stripe", axum::routing::post(stripe_webhook))
}

async fn list_lease_payments(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    Query(query): Query<PaymentsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    load_lease_for_user(&state, &user_id, &path.lease_id).await?;

    let mut filters = Map::new();
    filters.insert("lease_id".to_string(), json!(path.lease_id));
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }

    let rows = list_rows(
        state.pool()?,
        "payments",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

/// One-off card/ACH payment by the tenant. The client confirms the returned
/// PaymentIntent; the ledger row is written when the webhook arrives.
async fn create_lease_payment(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<CreatePaymentInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let (lease_row, access) = load_lease_for_user(&state, &user_id, &path.lease_id).await?;
    if access != LeaseAccess::Tenant {
        return Err(AppError::Forbidden(
            "Forbidden: only the lease tenant can pay online.".to_string(),
        ));
    }
    let lease = LeaseTerms::from_row(&lease_row)
        .ok_or_else(|| AppError::Internal("Lease record is incomplete.".to_string()))?;

    let totals = get_lease_totals(state.pool()?, &lease.id).await?;
    if totals.has_pending_payment() {
        return Err(AppError::Conflict(
            "A payment for this lease is already in progress.".to_string(),
        ));
    }
    let amount_cents = payload.amount_cents.unwrap_or_else(|| totals.balance_cents());
    if amount_cents < MIN_PAYMENT_CENTS {
        return Err(AppError::UnprocessableEntity(
            "Nothing to pay: the balance is below the minimum payment.".to_string(),
        ));
    }

    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| non_empty_opt(Some(value)))
        .map(|key| format!("payment:{}:{key}", lease.id));

    let request = PaymentIntentRequest {
        amount_cents,
        currency: DEFAULT_CURRENCY.to_string(),
        customer_id: None,
        payment_method_id: None,
        off_session: false,
        description: format!("Rent payment for lease {}", lease.id),
        metadata: vec![
            ("organization_id".to_string(), lease.organization_id.clone()),
            ("lease_id".to_string(), lease.id.clone()),
            ("unit_id".to_string(), lease.unit_id.clone()),
            ("tenant_id".to_string(), user_id.clone()),
            ("autopay".to_string(), "false".to_string()),
            ("fee_cents".to_string(), "0".to_string()),
        ],
        idempotency_key,
    };
    let intent = create_payment_intent(&state.http_client, &state.config, &request).await?;

    let payment_intent_id = intent.get("id").and_then(Value::as_str).unwrap_or_default();
    tracing::info!(
        lease_id = %lease.id,
        amount_cents,
        payment_intent_id,
        "PaymentIntent created"
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "payment_intent_id": intent.get("id").cloned().unwrap_or(Value::Null),
            "client_secret": intent.get("client_secret").cloned().unwrap_or(Value::Null),
            "amount_cents": amount_cents,
            "currency": DEFAULT_CURRENCY,
        })),
    ))
}

/// Raw body is required: the signature covers the exact bytes Stripe sent.
async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<Json<Value>> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::ServiceUnavailable("STRIPE_WEBHOOK_SECRET not configured".to_string())
        })?;
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !verify_stripe_signature(&body, signature, secret) {
        tracing::warn!("Rejected Stripe webhook with invalid signature");
        return Err(AppError::BadRequest("Invalid webhook signature.".to_string()));
    }

    let event: Value = serde_json::from_str(&body)
        .map_err(|_| AppError::BadRequest("Webhook body is not valid JSON.".to_string()))?;
    let outcome = apply_webhook_event(&state, &event).await?;

    let event_id = event.get("id").and_then(Value::as_str).unwrap_or_default();
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
    tracing::info!(
        event_id,
        event_type,
        outcome = ?outcome,
        "Stripe webhook processed"
    );
    Ok(Json(json!(outcome)))
}
