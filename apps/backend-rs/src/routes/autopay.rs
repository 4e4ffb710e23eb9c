use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::{
    auth::require_user,
    error::{AppError, AppResult},
    repository::table_service::{list_rows, map_db_error},
    schemas::{validate_input, value_str, AutopayEnrollInput, AutopayQuoteQuery, LeasePath},
    services::{
        audit::write_audit_log,
        autopay::{quote, AutopayFees, PaymentMethodKind},
        ledger::{get_lease_totals, LeaseTerms},
        payments::{create_customer, create_setup_intent, retrieve_payment_method},
    },
    state::AppState,
    tenancy::{load_lease_for_user, LeaseAccess},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/leases/{lease_id}/autopay",
            axum::routing::get(get_enrollment)
                .post(enroll)
                .delete(cancel_enrollment),
        )
        .route(
            "/leases/{lease_id}/autopay/setup-intent",
            axum::routing::post(start_setup),
        )
        .route(
            "/leases/{lease_id}/autopay/quote",
            axum::routing::get(autopay_quote),
        )
}

async fn load_tenant_lease(
    state: &AppState,
    user_id: &str,
    lease_id: &str,
) -> AppResult<LeaseTerms> {
    let (lease_row, access) = load_lease_for_user(state, user_id, lease_id).await?;
    if access != LeaseAccess::Tenant {
        return Err(AppError::Forbidden(
            "Forbidden: only the lease tenant can manage autopay.".to_string(),
        ));
    }
    let lease = LeaseTerms::from_row(&lease_row)
        .ok_or_else(|| AppError::Internal("Lease record is incomplete.".to_string()))?;
    if lease.status != "active" {
        return Err(AppError::Conflict("Lease is not active.".to_string()));
    }
    Ok(lease)
}

async fn find_enrollment(state: &AppState, lease_id: &str) -> AppResult<Option<Value>> {
    let mut filters = Map::new();
    filters.insert("lease_id".to_string(), json!(lease_id));
    let rows = list_rows(
        state.pool()?,
        "autopay_enrollments",
        Some(&filters),
        1,
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(rows.into_iter().next())
}

/// SetupIntent for saving a card or bank account. Reuses the Stripe customer
/// from an earlier enrollment on this lease.
async fn start_setup(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let lease = load_tenant_lease(&state, &user.id, &path.lease_id).await?;

    let existing_customer = find_enrollment(&state, &lease.id)
        .await?
        .filter(|row| value_str(row, "tenant_id") == user.id)
        .map(|row| value_str(&row, "stripe_customer_id"))
        .filter(|id| !id.is_empty());
    let customer_id = match existing_customer {
        Some(id) => id,
        None => {
            let customer = create_customer(
                &state.http_client,
                &state.config,
                user.email.as_deref(),
                &lease.organization_id,
                &user.id,
            )
            .await?;
            value_str(&customer, "id")
        }
    };

    let intent = create_setup_intent(&state.http_client, &state.config, &customer_id, &lease.id).await?;
    Ok(Json(json!({
        "customer_id": customer_id,
        "setup_intent_id": intent.get("id").cloned().unwrap_or(Value::Null),
        "client_secret": intent.get("client_secret").cloned().unwrap_or(Value::Null),
    })))
}

async fn enroll(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<AutopayEnrollInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    validate_input(&payload)?;
    let user = require_user(&state, &headers).await?;
    let lease = load_tenant_lease(&state, &user.id, &path.lease_id).await?;

    let payment_method =
        retrieve_payment_method(&state.http_client, &state.config, payload.payment_method_id.trim()).await?;
    let method = payment_method_kind(&payment_method, payload.stripe_customer_id.trim())?;

    let row = sqlx::query(
        "INSERT INTO autopay_enrollments (
            organization_id, lease_id, tenant_id, stripe_customer_id,
            stripe_payment_method_id, payment_method_type, charge_day, status
         )
         VALUES ($1::uuid, $2::uuid, $3, $4, $5, $6, $7, 'active')
         ON CONFLICT (lease_id) DO UPDATE SET
            tenant_id = EXCLUDED.tenant_id,
            stripe_customer_id = EXCLUDED.stripe_customer_id,
            stripe_payment_method_id = EXCLUDED.stripe_payment_method_id,
            payment_method_type = EXCLUDED.payment_method_type,
            charge_day = EXCLUDED.charge_day,
            status = 'active',
            last_error = NULL,
            canceled_at = NULL,
            updated_at = now()
         RETURNING row_to_json(autopay_enrollments.*) AS row",
    )
    .bind(&lease.organization_id)
    .bind(&lease.id)
    .bind(&user.id)
    .bind(payload.stripe_customer_id.trim())
    .bind(payload.payment_method_id.trim())
    .bind(method.as_str())
    .bind(payload.charge_day)
    .fetch_one(state.pool()?)
    .await
    .map_err(map_db_error)?;
    let enrollment = row
        .try_get::<Option<Value>, _>("row")
        .ok()
        .flatten()
        .ok_or_else(|| AppError::Internal("Could not save autopay enrollment.".to_string()))?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&lease.organization_id),
        Some(&user.id),
        "enroll",
        "autopay_enrollments",
        enrollment.get("id").and_then(Value::as_str),
        None,
        Some(enrollment.clone()),
    )
    .await;

    Ok((StatusCode::CREATED, Json(enrollment)))
}

/// The saved method must be attached to the customer the tenant set up, and
/// be a type autopay can charge off-session.
fn payment_method_kind(payment_method: &Value, customer_id: &str) -> AppResult<PaymentMethodKind> {
    if value_str(payment_method, "customer") != customer_id {
        return Err(AppError::UnprocessableEntity(
            "Payment method is not attached to this customer.".to_string(),
        ));
    }
    PaymentMethodKind::parse(&value_str(payment_method, "type")).ok_or_else(|| {
        AppError::UnprocessableEntity(
            "Autopay supports cards and US bank accounts only.".to_string(),
        )
    })
}

async fn get_enrollment(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    load_lease_for_user(&state, &user.id, &path.lease_id).await?;
    let enrollment = find_enrollment(&state, &path.lease_id).await?;
    Ok(Json(json!({ "enrollment": enrollment })))
}

/// Tenant or staff may stop autopay.
async fn cancel_enrollment(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let (lease_row, _) = load_lease_for_user(&state, &user.id, &path.lease_id).await?;

    let row = sqlx::query(
        "UPDATE autopay_enrollments SET status = 'canceled', canceled_at = now(), updated_at = now()
         WHERE lease_id = $1::uuid AND status = 'active'
         RETURNING row_to_json(autopay_enrollments.*) AS row",
    )
    .bind(&path.lease_id)
    .fetch_optional(state.pool()?)
    .await
    .map_err(map_db_error)?;
    let canceled = row
        .and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound("No active autopay enrollment.".to_string()))?;

    write_audit_log(
        state.db_pool.as_ref(),
        lease_row.get("organization_id").and_then(Value::as_str),
        Some(&user.id),
        "cancel",
        "autopay_enrollments",
        canceled.get("id").and_then(Value::as_str),
        None,
        Some(canceled.clone()),
    )
    .await;

    Ok(Json(canceled))
}

/// Fee preview. Without an amount, quotes the lease's current balance.
async fn autopay_quote(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    Query(query): Query<AutopayQuoteQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    load_lease_for_user(&state, &user.id, &path.lease_id).await?;

    let amount_cents = match query.amount_cents {
        Some(amount) => amount,
        None => get_lease_totals(state.pool()?, &path.lease_id)
            .await?
            .balance_cents(),
    };
    if amount_cents <= 0 {
        return Err(AppError::UnprocessableEntity(
            "Nothing to quote: amount must be positive.".to_string(),
        ));
    }

    let fees = AutopayFees::from_config(&state.config);
    Ok(Json(json!(quote(amount_cents, query.method, &fees))))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::payment_method_kind;
    use crate::services::autopay::PaymentMethodKind;

    #[test]
    fn accepts_attached_card_and_bank_account() {
        let card = json!({ "id": "pm_1", "type": "card", "customer": "cus_1" });
        let bank = json!({ "id": "pm_2", "type": "us_bank_account", "customer": "cus_1" });
        assert_eq!(
            payment_method_kind(&card, "cus_1").expect("card"),
            PaymentMethodKind::Card
        );
        assert_eq!(
            payment_method_kind(&bank, "cus_1").expect("bank"),
            PaymentMethodKind::UsBankAccount
        );
    }

    #[test]
    fn rejects_foreign_customer_and_unsupported_types() {
        let card = json!({ "id": "pm_1", "type": "card", "customer": "cus_other" });
        assert!(payment_method_kind(&card, "cus_1").is_err());

        let unattached = json!({ "id": "pm_1", "type": "card", "customer": null });
        assert!(payment_method_kind(&unattached, "cus_1").is_err());

        let sepa = json!({ "id": "pm_3", "type": "sepa_debit", "customer": "cus_1" });
        assert!(payment_method_kind(&sepa, "cus_1").is_err());
    }
}
