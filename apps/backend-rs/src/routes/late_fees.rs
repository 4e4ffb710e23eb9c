use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows, update_row},
    schemas::{
        validate_input, value_str, LateFeePreviewQuery, LateFeeRuleInput, PropertyPath,
        RunLateFeesInput,
    },
    services::{
        audit::write_audit_log,
        late_fees::{calculate_late_fee, load_rule, run_late_fee_assessment, LateFeeType},
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const RULE_EDIT_ROLES: &[&str] = &["owner_admin", "manager"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/properties/{property_id}/late-fee-rule",
            axum::routing::get(get_late_fee_rule).put(put_late_fee_rule),
        )
        .route(
            "/properties/{property_id}/late-fee-rule/preview",
            axum::routing::get(preview_late_fee),
        )
        .route("/late-fees/run", axum::routing::post(run_late_fees))
}

async fn get_late_fee_rule(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let property = get_row(state.pool()?, "properties", &path.property_id, "id").await?;
    assert_org_member(&state, &user_id, &value_str(&property, "organization_id")).await?;

    let rule = find_rule_row(&state, &path.property_id).await?;
    Ok(Json(json!({
        "property_id": path.property_id,
        "rule": rule,
    })))
}

async fn put_late_fee_rule(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
    Json(payload): Json<LateFeeRuleInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    if payload.fee_type == LateFeeType::Flat && payload.fee_amount_cents <= 0 && payload.enabled {
        return Err(AppError::UnprocessableEntity(
            "fee_amount_cents must be positive for flat fees.".to_string(),
        ));
    }
    if payload.fee_type == LateFeeType::Percentage && payload.fee_percent <= 0.0 && payload.enabled {
        return Err(AppError::UnprocessableEntity(
            "fee_percent must be positive for percentage fees.".to_string(),
        ));
    }

    let user_id = require_user_id(&state, &headers).await?;
    let pool = state.pool()?;
    let property = get_row(pool, "properties", &path.property_id, "id").await?;
    let org_id = value_str(&property, "organization_id");
    assert_org_role(&state, &user_id, &org_id, RULE_EDIT_ROLES).await?;

    let mut record = Map::new();
    record.insert("enabled".to_string(), json!(payload.enabled));
    record.insert(
        "grace_period_days".to_string(),
        json!(payload.grace_period_days),
    );
    record.insert(
        "fee_type".to_string(),
        json!(match payload.fee_type {
            LateFeeType::Flat => "flat",
            LateFeeType::Percentage => "percentage",
        }),
    );
    record.insert(
        "fee_amount_cents".to_string(),
        json!(payload.fee_amount_cents),
    );
    record.insert("fee_percent".to_string(), json!(payload.fee_percent));
    record.insert("max_fee_cents".to_string(), json!(payload.max_fee_cents));

    let existing = find_rule_row(&state, &path.property_id).await?;
    let saved = match &existing {
        Some(row) => update_row(pool, "late_fee_rules", &value_str(row, "id"), &record, "id").await?,
        None => {
            record.insert("organization_id".to_string(), json!(org_id));
            record.insert("property_id".to_string(), json!(path.property_id));
            create_row(pool, "late_fee_rules", &record).await?
        }
    };

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        if existing.is_some() { "update" } else { "create" },
        "late_fee_rules",
        saved.get("id").and_then(Value::as_str),
        existing,
        Some(saved.clone()),
    )
    .await;

    Ok(Json(saved))
}

async fn preview_late_fee(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    Query(query): Query<LateFeePreviewQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let property = get_row(state.pool()?, "properties", &path.property_id, "id").await?;
    assert_org_member(&state, &user_id, &value_str(&property, "organization_id")).await?;

    let rule = load_rule(state.pool()?, &path.property_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound("No late fee rule configured for this property.".to_string())
        })?;

    Ok(Json(json!({
        "monthly_rent_cents": query.monthly_rent_cents,
        "fee_cents": calculate_late_fee(&rule, query.monthly_rent_cents),
        "grace_period_days": rule.grace_period_days,
        "enabled": rule.enabled,
    })))
}

async fn run_late_fees(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RunLateFeesInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.org_id, RULE_EDIT_ROLES).await?;

    let result = run_late_fee_assessment(&state, Some(&payload.org_id), payload.as_of).await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.org_id),
        Some(&user_id),
        "run",
        "late_fee_assessment",
        None,
        None,
        Some(json!(result)),
    )
    .await;

    Ok(Json(json!(result)))
}

async fn find_rule_row(state: &AppState, property_id: &str) -> AppResult<Option<Value>> {
    let mut filters = Map::new();
    filters.insert("property_id".to_string(), json!(property_id));
    let rows = list_rows(
        state.pool()?,
        "late_fee_rules",
        Some(&filters),
        1,
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(rows.into_iter().next())
}
