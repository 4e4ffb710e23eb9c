use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_rows},
    schemas::{
        clamp_limit_in_range, non_empty_opt, validate_input, value_str, ChargePath,
        ChargesQuery, CreateChargeInput, LeasePath, ManualPaymentInput, TenantBalanceQuery,
    },
    services::{
        audit::write_audit_log,
        ledger::{
            get_lease_totals, get_tenant_balance, post_charge, record_manual_payment,
            void_charge, LeaseTerms, NewCharge,
        },
    },
    state::AppState,
    tenancy::{
        assert_org_member, assert_org_role, load_lease_for_staff, load_lease_for_user,
        LeaseAccess, FINANCE_ROLES, STAFF_ROLES, TENANT_ROLE,
    },
};

const MANUAL_PAYMENT_METHODS: &[&str] = &["cash", "check", "money_order", "bank_transfer", "other"];
const MAX_CHARGE_CENTS: i64 = 10_000_000;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/balances", axum::routing::get(tenant_unit_balance))
        .route(
            "/leases/{lease_id}/balance",
            axum::routing::get(lease_balance),
        )
        .route(
            "/leases/{lease_id}/charges",
            axum::routing::get(list_lease_charges).post(create_lease_charge),
        )
        .route(
            "/charges/{charge_id}/void",
            axum::routing::post(void_lease_charge),
        )
        .route(
            "/leases/{lease_id}/manual-payments",
            axum::routing::post(create_manual_payment),
        )
}

/// Balance for a tenant-unit pair. Tenants may only read their own.
async fn tenant_unit_balance(
    State(state): State<AppState>,
    Query(query): Query<TenantBalanceQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let membership = assert_org_member(&state, &user_id, &query.org_id).await?;
    let role = value_str(&membership, "role");
    if role == TENANT_ROLE {
        if query.tenant_id != user_id {
            return Err(AppError::Forbidden(
                "Forbidden: tenants can only view their own balance.".to_string(),
            ));
        }
    } else if !STAFF_ROLES.contains(&role.as_str()) {
        return Err(AppError::Forbidden(
            "Forbidden: no access to balances.".to_string(),
        ));
    }

    let balance = get_tenant_balance(
        state.pool()?,
        &query.org_id,
        &query.tenant_id,
        &query.unit_id,
    )
    .await?;
    Ok(Json(json!(balance)))
}

async fn lease_balance(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    load_lease_for_user(&state, &user_id, &path.lease_id).await?;

    let totals = get_lease_totals(state.pool()?, &path.lease_id).await?;
    Ok(Json(json!({
        "lease_id": path.lease_id,
        "charges_cents": totals.charges_cents,
        "payments_cents": totals.payments_cents,
        "pending_cents": totals.pending_cents,
        "balance_cents": totals.balance_cents(),
        "has_pending_payment": totals.has_pending_payment(),
    })))
}

async fn list_lease_charges(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    Query(query): Query<ChargesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let (_, access) = load_lease_for_user(&state, &user_id, &path.lease_id).await?;

    let mut filters = Map::new();
    filters.insert("lease_id".to_string(), json!(path.lease_id));
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    } else if access == LeaseAccess::Tenant {
        filters.insert("status".to_string(), json!("posted"));
    }
    if let Some(charge_type) = non_empty_opt(query.charge_type.as_deref()) {
        filters.insert("charge_type".to_string(), Value::String(charge_type));
    }

    let rows = list_rows(
        state.pool()?,
        "charges",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "due_date",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_lease_charge(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<CreateChargeInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    validate_input(&payload)?;
    if payload.amount_cents == 0 || payload.amount_cents.abs() > MAX_CHARGE_CENTS {
        return Err(AppError::UnprocessableEntity(
            "amount_cents must be non-zero and within limits.".to_string(),
        ));
    }
    let user_id = require_user_id(&state, &headers).await?;
    let lease_row = load_lease_for_staff(&state, &user_id, &path.lease_id, FINANCE_ROLES).await?;
    let lease = LeaseTerms::from_row(&lease_row)
        .ok_or_else(|| AppError::Internal("Lease record is incomplete.".to_string()))?;

    let charge = NewCharge {
        organization_id: lease.organization_id.clone(),
        lease_id: lease.id.clone(),
        unit_id: lease.unit_id.clone(),
        charge_type: payload.charge_type,
        amount_cents: payload.amount_cents,
        due_date: payload.due_date,
        period: payload.period.clone(),
        description: payload.description.trim().to_string(),
        idempotency_key: non_empty_opt(payload.idempotency_key.as_deref()),
        created_by_user_id: Some(user_id.clone()),
    };
    let Some(created) = post_charge(state.pool()?, &charge).await? else {
        return Err(AppError::Conflict(
            "A charge with this idempotency key was already posted.".to_string(),
        ));
    };

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&lease.organization_id),
        Some(&user_id),
        "create",
        "charges",
        created.get("id").and_then(Value::as_str),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((StatusCode::CREATED, Json(created)))
}

async fn void_lease_charge(
    State(state): State<AppState>,
    Path(path): Path<ChargePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = state.pool()?;
    let existing = get_row(pool, "charges", &path.charge_id, "id").await?;
    let org_id = value_str(&existing, "organization_id");
    assert_org_role(&state, &user_id, &org_id, FINANCE_ROLES).await?;

    let voided = void_charge(pool, &path.charge_id, &user_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "void",
        "charges",
        Some(&path.charge_id),
        Some(existing),
        Some(voided.clone()),
    )
    .await;

    Ok(Json(voided))
}

async fn create_manual_payment(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<ManualPaymentInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    validate_input(&payload)?;
    let method = payload.method.trim().to_ascii_lowercase();
    if !MANUAL_PAYMENT_METHODS.contains(&method.as_str()) {
        return Err(AppError::UnprocessableEntity(format!(
            "method must be one of: {}.",
            MANUAL_PAYMENT_METHODS.join(", ")
        )));
    }

    let user_id = require_user_id(&state, &headers).await?;
    let lease_row = load_lease_for_staff(&state, &user_id, &path.lease_id, STAFF_ROLES).await?;
    let lease = LeaseTerms::from_row(&lease_row)
        .ok_or_else(|| AppError::Internal("Lease record is incomplete.".to_string()))?;

    let payment = record_manual_payment(
        state.pool()?,
        &lease,
        payload.amount_cents,
        &method,
        non_empty_opt(payload.reference.as_deref()).as_deref(),
        &user_id,
    )
    .await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&lease.organization_id),
        Some(&user_id),
        "create",
        "payments",
        payment.get("id").and_then(Value::as_str),
        None,
        Some(payment.clone()),
    )
    .await;

    Ok((StatusCode::CREATED, Json(payment)))
}
