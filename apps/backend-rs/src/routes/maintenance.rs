use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, non_empty_opt, validate_input, value_str, value_str_opt,
        CreateMaintenanceInput, LeasePath, MaintenancePath, MaintenanceQuery,
        UpdateMaintenanceInput,
    },
    services::{
        audit::write_audit_log,
        messaging::{queue_message, OutboundMessage},
        notification_center::{emit_event, EmitNotificationEventInput},
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, load_lease_for_user, STAFF_ROLES, TENANT_ROLE},
};

const MAINTENANCE_EDIT_ROLES: &[&str] = &["owner_admin", "manager"];
const URGENCIES: &[&str] = &["low", "normal", "high", "emergency"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/maintenance-requests",
            axum::routing::get(list_maintenance_requests),
        )
        .route(
            "/leases/{lease_id}/maintenance-requests",
            axum::routing::post(create_maintenance_request),
        )
        .route(
            "/maintenance-requests/{request_id}",
            axum::routing::get(get_maintenance_request).patch(update_maintenance_request),
        )
}

/// Ticket lifecycle: open → acknowledged → scheduled → in_progress →
/// completed → closed. Cancelled and closed are terminal; a completed ticket
/// may be reopened into in_progress.
pub fn can_transition(from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }
    let allowed: &[&str] = match from {
        "open" => &["acknowledged", "scheduled", "in_progress", "cancelled", "closed"],
        "acknowledged" => &["scheduled", "in_progress", "completed", "cancelled", "closed"],
        "scheduled" => &["in_progress", "completed", "cancelled", "closed"],
        "in_progress" => &["scheduled", "completed", "cancelled", "closed"],
        "completed" => &["closed", "in_progress"],
        _ => &[],
    };
    allowed.contains(&to)
}

async fn create_maintenance_request(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<CreateMaintenanceInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    validate_input(&payload)?;
    let urgency = non_empty_opt(payload.urgency.as_deref())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_else(|| "normal".to_string());
    if !URGENCIES.contains(&urgency.as_str()) {
        return Err(AppError::UnprocessableEntity(format!(
            "urgency must be one of: {}.",
            URGENCIES.join(", ")
        )));
    }

    let user_id = require_user_id(&state, &headers).await?;
    let (lease, _) = load_lease_for_user(&state, &user_id, &path.lease_id).await?;
    let org_id = value_str(&lease, "organization_id");

    let mut record = Map::new();
    for key in ["organization_id", "property_id", "unit_id", "tenant_id"] {
        if let Some(value) = value_str_opt(&lease, key) {
            record.insert(key.to_string(), Value::String(value));
        }
    }
    record.insert("lease_id".to_string(), json!(path.lease_id));
    record.insert("submitted_by_user_id".to_string(), json!(user_id));
    record.insert("title".to_string(), json!(payload.title.trim()));
    if let Some(description) = non_empty_opt(payload.description.as_deref()) {
        record.insert("description".to_string(), Value::String(description));
    }
    if let Some(category) = non_empty_opt(payload.category.as_deref()) {
        record.insert("category".to_string(), Value::String(category));
    }
    record.insert("urgency".to_string(), json!(urgency));
    record.insert(
        "permission_to_enter".to_string(),
        json!(payload.permission_to_enter),
    );
    record.insert("status".to_string(), json!("open"));

    let pool = state.pool()?;
    let created = create_row(pool, "maintenance_requests", &record).await?;
    let request_id = value_str(&created, "id");

    let _ = emit_event(
        pool,
        EmitNotificationEventInput {
            organization_id: org_id.clone(),
            event_type: "maintenance_submitted".to_string(),
            category: "maintenance".to_string(),
            severity: (if urgency == "emergency" { "critical" } else { "info" }).to_string(),
            title: "New maintenance request".to_string(),
            body: payload.title.trim().to_string(),
            link_path: Some(format!("/maintenance-requests/{request_id}")),
            source_table: Some("maintenance_requests".to_string()),
            source_id: Some(request_id.clone()),
            actor_user_id: Some(user_id.clone()),
            payload: Map::from_iter([("lease_id".to_string(), json!(path.lease_id))]),
            dedupe_key: Some(format!("maintenance_submitted:{request_id}")),
            fallback_roles: vec!["owner_admin".to_string(), "manager".to_string()],
        },
    )
    .await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "create",
        "maintenance_requests",
        Some(&request_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((StatusCode::CREATED, Json(created)))
}

/// Staff see the organization's tickets; tenants see only their own.
async fn list_maintenance_requests(
    State(state): State<AppState>,
    Query(query): Query<MaintenanceQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let membership = assert_org_member(&state, &user_id, &query.org_id).await?;

    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(query.org_id.clone()),
    );
    if value_str(&membership, "role") == TENANT_ROLE {
        filters.insert("submitted_by_user_id".to_string(), json!(user_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(property_id) = non_empty_opt(query.property_id.as_deref()) {
        filters.insert("property_id".to_string(), Value::String(property_id));
    }

    let rows = list_rows(
        state.pool()?,
        "maintenance_requests",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_maintenance_request(
    State(state): State<AppState>,
    Path(path): Path<MaintenancePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let record = get_row(state.pool()?, "maintenance_requests", &path.request_id, "id").await?;
    let membership = assert_org_member(&state, &user_id, &value_str(&record, "organization_id")).await?;

    let role = value_str(&membership, "role");
    let is_submitter = value_str(&record, "submitted_by_user_id") == user_id;
    if !STAFF_ROLES.contains(&role.as_str()) && !is_submitter {
        return Err(AppError::Forbidden(
            "Forbidden: no access to this maintenance request.".to_string(),
        ));
    }
    Ok(Json(record))
}

async fn update_maintenance_request(
    State(state): State<AppState>,
    Path(path): Path<MaintenancePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateMaintenanceInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let pool = state.pool()?;

    let existing = get_row(pool, "maintenance_requests", &path.request_id, "id").await?;
    let org_id = value_str(&existing, "organization_id");
    assert_org_role(&state, &user_id, &org_id, MAINTENANCE_EDIT_ROLES).await?;

    let current_status = value_str(&existing, "status");
    let next_status = non_empty_opt(payload.status.as_deref()).map(|value| value.to_ascii_lowercase());
    let now = Utc::now().to_rfc3339();

    let mut patch = Map::new();
    if let Some(status) = next_status.as_deref() {
        if !can_transition(&current_status, status) {
            return Err(AppError::UnprocessableEntity(format!(
                "Cannot move a maintenance request from '{current_status}' to '{status}'."
            )));
        }
        patch.insert("status".to_string(), json!(status));
        let stamp = match status {
            "acknowledged" => Some("acknowledged_at"),
            "completed" => Some("completed_at"),
            "closed" => Some("closed_at"),
            "cancelled" => Some("cancelled_at"),
            _ => None,
        };
        if let Some(column) = stamp.filter(|_| status != current_status) {
            patch.insert(column.to_string(), json!(now));
        }
    }
    if let Some(notes) = non_empty_opt(payload.resolution_notes.as_deref()) {
        patch.insert("resolution_notes".to_string(), Value::String(notes));
    }
    if let Some(assignee) = non_empty_opt(payload.assigned_user_id.as_deref()) {
        patch.insert("assigned_user_id".to_string(), Value::String(assignee));
    }
    if let Some(scheduled_for) = payload.scheduled_for {
        patch.insert("scheduled_for".to_string(), json!(scheduled_for));
    }

    if patch.is_empty() {
        return Ok(Json(existing));
    }

    let updated = update_row(pool, "maintenance_requests", &path.request_id, &patch, "id").await?;

    if let Some(status) = next_status.as_deref().filter(|status| *status != current_status) {
        notify_tenant_of_status(&state, &updated, status).await;
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "update",
        "maintenance_requests",
        Some(&path.request_id),
        Some(existing),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

fn status_message(title: &str, status: &str) -> Option<String> {
    match status {
        "acknowledged" => Some(format!(
            "Your maintenance request \"{title}\" was received and is being reviewed."
        )),
        "scheduled" => Some(format!(
            "Your maintenance request \"{title}\" has been scheduled."
        )),
        "in_progress" => Some(format!("Work on \"{title}\" has started.")),
        "completed" => Some(format!("Your maintenance request \"{title}\" is complete.")),
        "cancelled" => Some(format!("Your maintenance request \"{title}\" was cancelled.")),
        _ => None,
    }
}

/// In-app notice to the submitter plus an SMS when the lease has a phone.
async fn notify_tenant_of_status(state: &AppState, request: &Value, status: &str) {
    let Some(pool) = state.db_pool.as_ref() else {
        return;
    };
    let Some(body) = status_message(&value_str(request, "title"), status) else {
        return;
    };
    let org_id = value_str(request, "organization_id");
    let request_id = value_str(request, "id");

    if let Some(submitter) = value_str_opt(request, "submitted_by_user_id") {
        let _ = emit_event(
            pool,
            EmitNotificationEventInput {
                organization_id: org_id.clone(),
                event_type: "maintenance_status_changed".to_string(),
                category: "maintenance".to_string(),
                severity: "info".to_string(),
                title: "Maintenance update".to_string(),
                body: body.clone(),
                link_path: Some(format!("/maintenance-requests/{request_id}")),
                source_table: Some("maintenance_requests".to_string()),
                source_id: Some(request_id.clone()),
                actor_user_id: None,
                payload: Map::from_iter([
                    ("recipient_user_id".to_string(), json!(submitter)),
                    ("status".to_string(), json!(status)),
                ]),
                dedupe_key: Some(format!("maintenance_status:{request_id}:{status}")),
                fallback_roles: Vec::new(),
            },
        )
        .await;
    }

    let Some(lease_id) = value_str_opt(request, "lease_id") else {
        return;
    };
    let Ok(lease) = get_row(pool, "leases", &lease_id, "id").await else {
        return;
    };
    let Some(phone) = value_str_opt(&lease, "tenant_phone_e164") else {
        return;
    };
    let message = OutboundMessage {
        organization_id: org_id,
        channel: "sms".to_string(),
        recipient: phone,
        subject: None,
        body,
        kind: format!("maintenance_{status}"),
        related_id: Some(request_id),
    };
    if let Err(error) = queue_message(pool, &message).await {
        tracing::warn!(error = %error, "Failed to queue maintenance status SMS");
    }
}

#[cfg(test)]
mod tests {
    use super::{can_transition, status_message};

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(can_transition("open", "acknowledged"));
        assert!(can_transition("acknowledged", "scheduled"));
        assert!(can_transition("scheduled", "in_progress"));
        assert!(can_transition("in_progress", "completed"));
        assert!(can_transition("completed", "closed"));
        assert!(can_transition("open", "cancelled"));
    }

    #[test]
    fn terminal_and_backward_moves_are_rejected() {
        assert!(!can_transition("closed", "open"));
        assert!(!can_transition("cancelled", "in_progress"));
        assert!(!can_transition("scheduled", "open"));
        assert!(!can_transition("completed", "cancelled"));
        assert!(!can_transition("open", "reopened"));
    }

    #[test]
    fn reopen_and_no_op_are_allowed() {
        assert!(can_transition("completed", "in_progress"));
        assert!(can_transition("closed", "closed"));
    }

    #[test]
    fn only_tenant_visible_statuses_have_messages() {
        assert!(status_message("Leaky faucet", "scheduled")
            .is_some_and(|text| text.contains("Leaky faucet")));
        assert!(status_message("Leaky faucet", "closed").is_none());
        assert!(status_message("Leaky faucet", "open").is_none());
    }
}
