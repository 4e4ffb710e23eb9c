use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{NaiveDate, Utc};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows, map_db_error, update_row},
    schemas::{
        clamp_limit_in_range, non_empty_opt, validate_input, value_str, CreateLeaseInput,
        EndLeaseInput, LeasePath, LeasesQuery, ProrationPreviewQuery,
    },
    services::{
        audit::write_audit_log,
        ledger::{
            move_out_idempotency_key, period_rent_billed, post_charge, void_move_out_settlements,
            BillingPeriod, ChargeType, LeaseTerms, NewCharge,
        },
        proration::{calculate_prorated_rent, final_month_rent, needs_proration, quote, ProrationKind},
    },
    state::AppState,
    tenancy::{assert_org_role, load_lease_for_staff, load_lease_for_user, STAFF_ROLES},
};

const LEASE_EDIT_ROLES: &[&str] = &["owner_admin", "manager"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/leases",
            axum::routing::get(list_leases).post(create_lease),
        )
        .route(
            "/leases/proration-preview",
            axum::routing::get(proration_preview),
        )
        .route("/me/leases", axum::routing::get(list_my_leases))
        .route("/leases/{lease_id}", axum::routing::get(get_lease))
        .route("/leases/{lease_id}/end", axum::routing::post(end_lease))
}

async fn list_leases(
    State(state): State<AppState>,
    Query(query): Query<LeasesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &query.org_id, STAFF_ROLES).await?;

    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(query.org_id.clone()),
    );
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(property_id) = non_empty_opt(query.property_id.as_deref()) {
        filters.insert("property_id".to_string(), Value::String(property_id));
    }

    let rows = list_rows(
        state.pool()?,
        "leases",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn list_my_leases(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;

    let mut filters = Map::new();
    filters.insert("tenant_id".to_string(), Value::String(user_id));
    let rows = list_rows(
        state.pool()?,
        "leases",
        Some(&filters),
        100,
        0,
        "start_date",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let (lease, _) = load_lease_for_user(&state, &user_id, &path.lease_id).await?;
    Ok(Json(lease))
}

async fn create_lease(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateLeaseInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    validate_input(&payload)?;
    if let Some(end_date) = payload.end_date {
        if end_date < payload.start_date {
            return Err(AppError::UnprocessableEntity(
                "end_date must be on or after start_date.".to_string(),
            ));
        }
        if BillingPeriod::containing(end_date) == BillingPeriod::containing(payload.start_date) {
            return Err(AppError::UnprocessableEntity(
                "A lease must run past its first month.".to_string(),
            ));
        }
    }

    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, LEASE_EDIT_ROLES).await?;
    let pool = state.pool()?;

    let unit = get_row(pool, "units", &payload.unit_id, "id").await?;
    if value_str(&unit, "organization_id") != payload.organization_id
        || value_str(&unit, "property_id") != payload.property_id
    {
        return Err(AppError::UnprocessableEntity(
            "unit_id does not belong to this property.".to_string(),
        ));
    }

    let mut record = Map::new();
    record.insert(
        "organization_id".to_string(),
        json!(payload.organization_id),
    );
    record.insert("property_id".to_string(), json!(payload.property_id));
    record.insert("unit_id".to_string(), json!(payload.unit_id));
    record.insert("status".to_string(), json!("active"));
    record.insert(
        "monthly_rent_cents".to_string(),
        json!(payload.monthly_rent_cents),
    );
    record.insert("rent_due_day".to_string(), json!(payload.rent_due_day));
    record.insert("start_date".to_string(), json!(payload.start_date));
    record.insert("created_by_user_id".to_string(), json!(user_id));
    if let Some(end_date) = payload.end_date {
        record.insert("end_date".to_string(), json!(end_date));
    }
    for (key, value) in [
        ("tenant_name", payload.tenant_name.as_deref()),
        ("tenant_email", payload.tenant_email.as_deref()),
        ("tenant_phone_e164", payload.tenant_phone_e164.as_deref()),
    ] {
        if let Some(text) = non_empty_opt(value) {
            record.insert(key.to_string(), Value::String(text));
        }
    }
    if let Some(deposit) = payload.security_deposit_cents {
        record.insert("security_deposit_cents".to_string(), json!(deposit));
    }

    let created = create_row(pool, "leases", &record).await?;
    let lease = LeaseTerms::from_row(&created)
        .ok_or_else(|| AppError::Internal("Lease record is incomplete.".to_string()))?;

    let mut opening_charges = Vec::new();
    if needs_proration(lease.start_date, ProrationKind::MoveIn) {
        let amount_cents =
            calculate_prorated_rent(lease.monthly_rent_cents, lease.start_date, ProrationKind::MoveIn);
        let period = BillingPeriod::containing(lease.start_date);
        opening_charges.push(NewCharge {
            organization_id: lease.organization_id.clone(),
            lease_id: lease.id.clone(),
            unit_id: lease.unit_id.clone(),
            charge_type: ChargeType::Proration,
            amount_cents,
            due_date: lease.start_date,
            period: Some(period.key()),
            description: format!("Prorated rent from {} ({})", lease.start_date, period.key()),
            idempotency_key: Some(format!("proration:move_in:{}", lease.id)),
            created_by_user_id: Some(user_id.clone()),
        });
    }
    if let Some(deposit) = payload.security_deposit_cents.filter(|amount| *amount > 0) {
        opening_charges.push(NewCharge {
            organization_id: lease.organization_id.clone(),
            lease_id: lease.id.clone(),
            unit_id: lease.unit_id.clone(),
            charge_type: ChargeType::Deposit,
            amount_cents: deposit,
            due_date: lease.start_date,
            period: None,
            description: "Security deposit".to_string(),
            idempotency_key: Some(format!("deposit:{}", lease.id)),
            created_by_user_id: Some(user_id.clone()),
        });
    }

    let mut posted = Vec::new();
    for charge in &opening_charges {
        if let Some(row) = post_charge(pool, charge).await? {
            posted.push(row);
        }
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&lease.organization_id),
        Some(&user_id),
        "create",
        "leases",
        Some(&lease.id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "lease": created, "charges": posted })),
    ))
}

async fn end_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<EndLeaseInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let lease_row = load_lease_for_staff(&state, &user_id, &path.lease_id, LEASE_EDIT_ROLES).await?;
    let lease = LeaseTerms::from_row(&lease_row)
        .ok_or_else(|| AppError::Internal("Lease record is incomplete.".to_string()))?;

    if lease.status != "active" {
        return Err(AppError::Conflict("Lease is not active.".to_string()));
    }
    let end_date = payload.end_date;
    if end_date < lease.start_date {
        return Err(AppError::UnprocessableEntity(
            "end_date must be on or after the lease start date.".to_string(),
        ));
    }
    let today = Utc::now().date_naive();
    if end_date < BillingPeriod::containing(today).first_day() {
        return Err(AppError::UnprocessableEntity(
            "end_date cannot fall in a closed billing month.".to_string(),
        ));
    }

    let pool = state.pool()?;
    // A rescheduled end replaces the earlier settlement instead of stacking on it.
    let (voided, revision) = void_move_out_settlements(pool, &lease.id, &user_id).await?;
    if !voided.is_empty() {
        tracing::info!(lease_id = %lease.id, voided = voided.len(), "Replaced earlier move-out settlement");
    }
    let period = BillingPeriod::containing(end_date);
    let billed = period_rent_billed(pool, &lease.id, period).await?;
    let settlement = match final_month_settlement(&lease, end_date, billed) {
        Some((charge_type, amount_cents)) => {
            let description = match charge_type {
                ChargeType::Credit => format!("Move-out credit for {}", period.key()),
                _ => format!("Prorated rent through {end_date}"),
            };
            let charge = NewCharge {
                organization_id: lease.organization_id.clone(),
                lease_id: lease.id.clone(),
                unit_id: lease.unit_id.clone(),
                charge_type,
                amount_cents,
                due_date: end_date.min(lease.due_date_for(period)),
                period: Some(period.key()),
                description,
                idempotency_key: Some(move_out_idempotency_key(&lease.id, end_date, revision)),
                created_by_user_id: Some(user_id.clone()),
            };
            post_charge(pool, &charge).await?
        }
        None => None,
    };

    let mut patch = Map::new();
    patch.insert("end_date".to_string(), json!(end_date));
    if end_date <= today {
        patch.insert("status".to_string(), json!("ended"));
    }
    let updated = update_row(pool, "leases", &lease.id, &patch, "id").await?;

    sqlx::query(
        "UPDATE autopay_enrollments SET status = 'canceled', canceled_at = now()
         WHERE lease_id = $1::uuid AND status = 'active'",
    )
    .bind(&lease.id)
    .execute(pool)
    .await
    .map_err(map_db_error)?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&lease.organization_id),
        Some(&user_id),
        "end",
        "leases",
        Some(&lease.id),
        Some(lease_row),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(json!({
        "lease": updated,
        "settlement": settlement,
        "voided_settlements": voided,
    })))
}

/// Charge or credit that brings the final month's rent in line with the days
/// actually occupied. `None` when the month is already billed correctly or
/// when a full final month will be posted by the monthly rent run.
fn final_month_settlement(
    lease: &LeaseTerms,
    end_date: NaiveDate,
    billed_cents: i64,
) -> Option<(ChargeType, i64)> {
    let period = BillingPeriod::containing(end_date);
    if end_date == period.last_day() && lease.start_date <= period.first_day() && billed_cents == 0 {
        return None;
    }
    let owed = final_month_rent(lease.monthly_rent_cents, lease.start_date, end_date);
    match owed - billed_cents {
        0 => None,
        diff if diff > 0 => Some((ChargeType::Proration, diff)),
        diff => Some((ChargeType::Credit, diff)),
    }
}

async fn proration_preview(
    State(state): State<AppState>,
    Query(query): Query<ProrationPreviewQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    if query.monthly_rent_cents <= 0 {
        return Err(AppError::UnprocessableEntity(
            "monthly_rent_cents must be positive.".to_string(),
        ));
    }
    Ok(Json(json!(quote(
        query.monthly_rent_cents,
        query.date,
        query.kind
    ))))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::final_month_settlement;
    use crate::services::ledger::{move_out_idempotency_key, ChargeType, LeaseTerms};

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    fn lease(start: &str) -> LeaseTerms {
        LeaseTerms {
            id: "lease-1".to_string(),
            organization_id: "org-1".to_string(),
            property_id: "prop-1".to_string(),
            unit_id: "unit-1".to_string(),
            tenant_id: Some("tenant-1".to_string()),
            monthly_rent_cents: 93_000,
            rent_due_day: 1,
            start_date: date(start),
            end_date: None,
            status: "active".to_string(),
        }
    }

    #[test]
    fn unbilled_mid_month_end_posts_proration() {
        // 10 of 31 days of 930.00
        assert_eq!(
            final_month_settlement(&lease("2025-01-01"), date("2026-01-10"), 0),
            Some((ChargeType::Proration, 30_000))
        );
    }

    #[test]
    fn already_billed_month_gets_a_credit() {
        assert_eq!(
            final_month_settlement(&lease("2025-01-01"), date("2026-01-10"), 93_000),
            Some((ChargeType::Credit, -63_000))
        );
    }

    #[test]
    fn full_final_month_is_left_to_rent_posting() {
        assert_eq!(
            final_month_settlement(&lease("2025-01-01"), date("2026-01-31"), 0),
            None
        );
        assert_eq!(
            final_month_settlement(&lease("2025-01-01"), date("2026-01-31"), 93_000),
            None
        );
    }

    #[test]
    fn ending_in_the_move_in_month_trims_the_proration() {
        // move-in on Jan 11 billed 21 days (63_000); ending Jan 20 keeps 10 days
        assert_eq!(
            final_month_settlement(&lease("2026-01-11"), date("2026-01-20"), 63_000),
            Some((ChargeType::Credit, -33_000))
        );
    }

    #[test]
    fn rescheduled_end_settles_against_rent_alone() {
        let lease = lease("2025-01-01");
        let first = final_month_settlement(&lease, date("2026-01-10"), 93_000);
        assert_eq!(first, Some((ChargeType::Credit, -63_000)));

        // With the first credit voided the month is back to full rent, so an
        // end on Jan 20 credits the 11 unused days.
        assert_eq!(
            final_month_settlement(&lease, date("2026-01-20"), 93_000),
            Some((ChargeType::Credit, -33_000))
        );
        // Settling on top of the live credit would charge 10 days back instead.
        assert_ne!(
            final_month_settlement(&lease, date("2026-01-20"), 93_000 - 63_000),
            final_month_settlement(&lease, date("2026-01-20"), 93_000)
        );
    }

    #[test]
    fn each_settlement_revision_gets_its_own_key() {
        let end = date("2026-01-10");
        assert_eq!(move_out_idempotency_key("lease-1", end, 0), "move_out:lease-1:2026-01-10:0");
        assert_ne!(
            move_out_idempotency_key("lease-1", end, 0),
            move_out_idempotency_key("lease-1", end, 1)
        );
    }
}
