use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{list_rows, map_db_error},
    schemas::{
        clamp_limit_in_range, non_empty_opt, validate_input, AdminJobPath, AdminListQuery,
        RunJobInput,
    },
    services::{
        audit::write_audit_log,
        autopay::run_autopay_charges,
        late_fees::run_late_fee_assessment,
        ledger::{post_monthly_rent_charges, BillingPeriod},
        messaging::process_queued_messages,
    },
    state::AppState,
    tenancy::require_platform_admin,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/admin/organizations",
            axum::routing::get(list_organizations),
        )
        .route("/admin/audit-logs", axum::routing::get(list_audit_logs))
        .route("/admin/jobs/{job}", axum::routing::post(run_job))
}

/// Back-office jobs that normally run from the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminJob {
    RentPosting,
    LateFees,
    Autopay,
    Messages,
}

impl AdminJob {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "rent-posting" => Some(Self::RentPosting),
            "late-fees" => Some(Self::LateFees),
            "autopay" => Some(Self::Autopay),
            "messages" => Some(Self::Messages),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::RentPosting => "rent_posting",
            Self::LateFees => "late_fees",
            Self::Autopay => "autopay",
            Self::Messages => "messages",
        }
    }
}

async fn list_organizations(
    State(state): State<AppState>,
    Query(query): Query<AdminListQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    require_platform_admin(&state, &user_id).await?;

    let rows = sqlx::query(
        "SELECT row_to_json(o) AS org,
                (SELECT COUNT(*) FROM organization_members m WHERE m.organization_id = o.id)::bigint AS member_count,
                (SELECT COUNT(*) FROM leases l WHERE l.organization_id = o.id AND l.status = 'active')::bigint AS active_lease_count
         FROM organizations o
         ORDER BY o.created_at DESC
         LIMIT $1 OFFSET $2",
    )
    .bind(clamp_limit_in_range(query.limit, 1, 500))
    .bind(query.offset.max(0))
    .fetch_all(state.pool()?)
    .await
    .map_err(map_db_error)?;

    let data: Vec<Value> = rows
        .iter()
        .filter_map(|row| {
            let mut org = row.try_get::<Option<Value>, _>("org").ok().flatten()?;
            if let Some(obj) = org.as_object_mut() {
                obj.insert(
                    "member_count".to_string(),
                    json!(row.try_get::<i64, _>("member_count").unwrap_or(0)),
                );
                obj.insert(
                    "active_lease_count".to_string(),
                    json!(row.try_get::<i64, _>("active_lease_count").unwrap_or(0)),
                );
            }
            Some(org)
        })
        .collect();

    Ok(Json(json!({ "data": data })))
}

async fn list_audit_logs(
    State(state): State<AppState>,
    Query(query): Query<AdminListQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    require_platform_admin(&state, &user_id).await?;

    let mut filters = Map::new();
    if let Some(org_id) = non_empty_opt(query.org_id.as_deref()) {
        filters.insert("organization_id".to_string(), Value::String(org_id));
    }
    let rows = list_rows(
        state.pool()?,
        "audit_logs",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        query.offset,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn run_job(
    State(state): State<AppState>,
    Path(path): Path<AdminJobPath>,
    headers: HeaderMap,
    payload: Option<Json<RunJobInput>>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    require_platform_admin(&state, &user_id).await?;

    let job = AdminJob::parse(&path.job)
        .ok_or_else(|| AppError::NotFound(format!("Unknown job '{}'.", path.job)))?;
    let input = payload.map(|Json(input)| input).unwrap_or_default();
    validate_input(&input)?;
    let org_id = non_empty_opt(input.org_id.as_deref());
    let today = input.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let pool = state.pool()?;

    tracing::info!(job = job.name(), org_id = org_id.as_deref().unwrap_or("*"), "Admin job triggered");
    let result = match job {
        AdminJob::RentPosting => {
            let period = input
                .period
                .as_deref()
                .and_then(BillingPeriod::parse)
                .unwrap_or_else(|| BillingPeriod::containing(today));
            json!(post_monthly_rent_charges(pool, org_id.as_deref(), period).await)
        }
        AdminJob::LateFees => {
            json!(run_late_fee_assessment(&state, org_id.as_deref(), input.as_of).await)
        }
        AdminJob::Autopay => json!(run_autopay_charges(&state, today).await),
        AdminJob::Messages => {
            json!(process_queued_messages(pool, &state.http_client, &state.config).await)
        }
    };

    write_audit_log(
        state.db_pool.as_ref(),
        org_id.as_deref(),
        Some(&user_id),
        "run",
        "admin_jobs",
        Some(job.name()),
        None,
        Some(result.clone()),
    )
    .await;

    Ok(Json(json!({ "job": job.name(), "result": result })))
}

#[cfg(test)]
mod tests {
    use super::AdminJob;

    #[test]
    fn parses_known_jobs_only() {
        assert_eq!(AdminJob::parse("rent-posting"), Some(AdminJob::RentPosting));
        assert_eq!(AdminJob::parse("late-fees"), Some(AdminJob::LateFees));
        assert_eq!(AdminJob::parse("autopay"), Some(AdminJob::Autopay));
        assert_eq!(AdminJob::parse(" messages "), Some(AdminJob::Messages));
        assert_eq!(AdminJob::parse("drop-tables"), None);
        assert_eq!(AdminJob::Messages.name(), "messages");
    }
}
