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
        CreateDocumentRequestInput, DocumentRequestPath, DocumentRequestsQuery,
        DocumentUploadInput, ReviewDocumentInput,
    },
    services::{
        audit::write_audit_log,
        messaging::{queue_message, OutboundMessage},
        notification_center::{emit_event, EmitNotificationEventInput},
        storage::{document_object_key, ObjectStorage},
    },
    state::AppState,
    tenancy::{
        assert_org_role, load_lease_for_staff, load_lease_for_user, LeaseAccess, STAFF_ROLES,
    },
};

const REVIEW_ROLES: &[&str] = &["owner_admin", "manager"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/document-requests",
            axum::routing::get(list_document_requests).post(create_document_request),
        )
        .route(
            "/document-requests/{document_request_id}",
            axum::routing::get(get_document_request),
        )
        .route(
            "/document-requests/{document_request_id}/upload-url",
            axum::routing::post(create_upload_url),
        )
        .route(
            "/document-requests/{document_request_id}/submit",
            axum::routing::post(submit_document),
        )
        .route(
            "/document-requests/{document_request_id}/review",
            axum::routing::post(review_document),
        )
        .route(
            "/document-requests/{document_request_id}/download-url",
            axum::routing::get(create_download_url),
        )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentAction {
    Upload,
    Submit,
    Approve,
    Reject,
}

/// requested → submitted → approved | rejected. A rejected request goes back
/// to the tenant for another upload; approved is final.
fn next_status(current: &str, action: DocumentAction) -> Option<&'static str> {
    match (current, action) {
        ("requested", DocumentAction::Upload) => Some("requested"),
        ("rejected", DocumentAction::Upload) => Some("rejected"),
        ("requested" | "rejected", DocumentAction::Submit) => Some("submitted"),
        ("submitted", DocumentAction::Approve) => Some("approved"),
        ("submitted", DocumentAction::Reject) => Some("rejected"),
        _ => None,
    }
}

fn require_storage(state: &AppState) -> AppResult<&ObjectStorage> {
    state.storage.as_ref().ok_or_else(|| {
        AppError::ServiceUnavailable("Document storage is not configured.".to_string())
    })
}

/// The request plus the caller's relation to its lease.
async fn load_document_request(
    state: &AppState,
    user_id: &str,
    request_id: &str,
) -> AppResult<(Value, LeaseAccess)> {
    let record = get_row(state.pool()?, "document_requests", request_id, "id").await?;
    let (_, access) = load_lease_for_user(state, user_id, &value_str(&record, "lease_id")).await?;
    Ok((record, access))
}

fn transition(record: &Value, action: DocumentAction) -> AppResult<&'static str> {
    let current = value_str(record, "status");
    next_status(&current, action).ok_or_else(|| {
        AppError::Conflict(format!(
            "Document request is '{current}' and cannot be {}.",
            match action {
                DocumentAction::Upload => "uploaded to",
                DocumentAction::Submit => "submitted",
                DocumentAction::Approve => "approved",
                DocumentAction::Reject => "rejected",
            }
        ))
    })
}

async fn create_document_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateDocumentRequestInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let lease = load_lease_for_staff(&state, &user_id, &payload.lease_id, STAFF_ROLES).await?;
    let org_id = value_str(&lease, "organization_id");

    let mut record = Map::new();
    record.insert("organization_id".to_string(), json!(org_id));
    record.insert("lease_id".to_string(), json!(payload.lease_id));
    if let Some(tenant_id) = value_str_opt(&lease, "tenant_id") {
        record.insert("tenant_id".to_string(), Value::String(tenant_id));
    }
    record.insert(
        "document_type".to_string(),
        json!(payload.document_type.trim()),
    );
    record.insert("title".to_string(), json!(payload.title.trim()));
    if let Some(notes) = non_empty_opt(payload.notes.as_deref()) {
        record.insert("notes".to_string(), Value::String(notes));
    }
    if let Some(due_date) = payload.due_date {
        record.insert("due_date".to_string(), json!(due_date));
    }
    record.insert("status".to_string(), json!("requested"));
    record.insert("requested_by_user_id".to_string(), json!(user_id));

    let pool = state.pool()?;
    let created = create_row(pool, "document_requests", &record).await?;
    let request_id = value_str(&created, "id");

    if let Some(tenant_id) = value_str_opt(&lease, "tenant_id") {
        let _ = emit_event(
            pool,
            EmitNotificationEventInput {
                organization_id: org_id.clone(),
                event_type: "document_requested".to_string(),
                category: "documents".to_string(),
                severity: "info".to_string(),
                title: "Document requested".to_string(),
                body: format!("Please upload: {}", payload.title.trim()),
                link_path: Some(format!("/document-requests/{request_id}")),
                source_table: Some("document_requests".to_string()),
                source_id: Some(request_id.clone()),
                actor_user_id: Some(user_id.clone()),
                payload: Map::from_iter([("recipient_user_id".to_string(), json!(tenant_id))]),
                dedupe_key: Some(format!("document_requested:{request_id}")),
                fallback_roles: Vec::new(),
            },
        )
        .await;
    }
    if let Some(email) = value_str_opt(&lease, "tenant_email") {
        let mut body = format!(
            "Your property manager has requested a document: {}.",
            payload.title.trim()
        );
        if let Some(due_date) = payload.due_date {
            body.push_str(&format!(" Please upload it by {due_date}."));
        }
        let message = OutboundMessage {
            organization_id: org_id.clone(),
            channel: "email".to_string(),
            recipient: email,
            subject: Some("Document requested".to_string()),
            body,
            kind: "document_requested".to_string(),
            related_id: Some(request_id.clone()),
        };
        if let Err(error) = queue_message(pool, &message).await {
            tracing::warn!(error = %error, "Failed to queue document request email");
        }
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "create",
        "document_requests",
        Some(&request_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_document_requests(
    State(state): State<AppState>,
    Query(query): Query<DocumentRequestsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;

    let mut filters = Map::new();
    if let Some(lease_id) = non_empty_opt(query.lease_id.as_deref()) {
        load_lease_for_user(&state, &user_id, &lease_id).await?;
        filters.insert("lease_id".to_string(), Value::String(lease_id));
    } else if let Some(org_id) = non_empty_opt(query.org_id.as_deref()) {
        assert_org_role(&state, &user_id, &org_id, STAFF_ROLES).await?;
        filters.insert("organization_id".to_string(), Value::String(org_id));
    } else {
        return Err(AppError::UnprocessableEntity(
            "Either lease_id or org_id is required.".to_string(),
        ));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }

    let rows = list_rows(
        state.pool()?,
        "document_requests",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_document_request(
    State(state): State<AppState>,
    Path(path): Path<DocumentRequestPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let (record, _) = load_document_request(&state, &user_id, &path.document_request_id).await?;
    Ok(Json(record))
}

/// Presigned PUT for the tenant's file. The object key is stored now so the
/// submit step knows what was uploaded.
async fn create_upload_url(
    State(state): State<AppState>,
    Path(path): Path<DocumentRequestPath>,
    headers: HeaderMap,
    Json(payload): Json<DocumentUploadInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let (record, access) =
        load_document_request(&state, &user_id, &path.document_request_id).await?;
    if access != LeaseAccess::Tenant {
        return Err(AppError::Forbidden(
            "Forbidden: only the lease tenant can upload documents.".to_string(),
        ));
    }
    transition(&record, DocumentAction::Upload)?;
    let storage = require_storage(&state)?;

    let object_key = document_object_key(
        &value_str(&record, "organization_id"),
        &path.document_request_id,
        &payload.file_name,
    );
    let presigned = storage
        .presign_upload(&object_key, payload.content_type.trim())
        .await?;

    let mut patch = Map::new();
    patch.insert("object_key".to_string(), json!(object_key));
    patch.insert("file_name".to_string(), json!(payload.file_name.trim()));
    patch.insert(
        "content_type".to_string(),
        json!(payload.content_type.trim()),
    );
    update_row(
        state.pool()?,
        "document_requests",
        &path.document_request_id,
        &patch,
        "id",
    )
    .await?;

    Ok(Json(json!(presigned)))
}

async fn submit_document(
    State(state): State<AppState>,
    Path(path): Path<DocumentRequestPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let (record, access) =
        load_document_request(&state, &user_id, &path.document_request_id).await?;
    if access != LeaseAccess::Tenant {
        return Err(AppError::Forbidden(
            "Forbidden: only the lease tenant can submit documents.".to_string(),
        ));
    }
    let status = transition(&record, DocumentAction::Submit)?;
    if value_str(&record, "object_key").is_empty() {
        return Err(AppError::UnprocessableEntity(
            "Upload the file before submitting.".to_string(),
        ));
    }

    let mut patch = Map::new();
    patch.insert("status".to_string(), json!(status));
    patch.insert("submitted_at".to_string(), json!(Utc::now().to_rfc3339()));
    let pool = state.pool()?;
    let updated = update_row(pool, "document_requests", &path.document_request_id, &patch, "id").await?;

    let org_id = value_str(&record, "organization_id");
    let _ = emit_event(
        pool,
        EmitNotificationEventInput {
            organization_id: org_id.clone(),
            event_type: "document_submitted".to_string(),
            category: "documents".to_string(),
            severity: "info".to_string(),
            title: "Document submitted".to_string(),
            body: format!("{} is ready for review.", value_str(&record, "title")),
            link_path: Some(format!("/document-requests/{}", path.document_request_id)),
            source_table: Some("document_requests".to_string()),
            source_id: Some(path.document_request_id.clone()),
            actor_user_id: Some(user_id.clone()),
            payload: Map::from_iter([(
                "recipient_user_id".to_string(),
                json!(value_str(&record, "requested_by_user_id")),
            )]),
            dedupe_key: Some(format!(
                "document_submitted:{}:{}",
                path.document_request_id,
                value_str(&updated, "submitted_at")
            )),
            fallback_roles: Vec::new(),
        },
    )
    .await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "submit",
        "document_requests",
        Some(&path.document_request_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn review_document(
    State(state): State<AppState>,
    Path(path): Path<DocumentRequestPath>,
    headers: HeaderMap,
    Json(payload): Json<ReviewDocumentInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let pool = state.pool()?;
    let record = get_row(pool, "document_requests", &path.document_request_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, REVIEW_ROLES).await?;

    let action = if payload.approve {
        DocumentAction::Approve
    } else {
        DocumentAction::Reject
    };
    let status = transition(&record, action)?;

    let mut patch = Map::new();
    patch.insert("status".to_string(), json!(status));
    patch.insert("reviewed_by_user_id".to_string(), json!(user_id));
    patch.insert("reviewed_at".to_string(), json!(Utc::now().to_rfc3339()));
    patch.insert(
        "review_notes".to_string(),
        non_empty_opt(payload.review_notes.as_deref()).map_or(Value::Null, Value::String),
    );
    let updated = update_row(pool, "document_requests", &path.document_request_id, &patch, "id").await?;

    if let Some(tenant_id) = value_str_opt(&record, "tenant_id") {
        let title = value_str(&record, "title");
        let body = match action {
            DocumentAction::Approve => format!("{title} was approved."),
            _ => format!("{title} needs another upload."),
        };
        let _ = emit_event(
            pool,
            EmitNotificationEventInput {
                organization_id: org_id.clone(),
                event_type: format!("document_{status}"),
                category: "documents".to_string(),
                severity: (if payload.approve { "info" } else { "warning" }).to_string(),
                title: "Document reviewed".to_string(),
                body,
                link_path: Some(format!("/document-requests/{}", path.document_request_id)),
                source_table: Some("document_requests".to_string()),
                source_id: Some(path.document_request_id.clone()),
                actor_user_id: Some(user_id.clone()),
                payload: Map::from_iter([("recipient_user_id".to_string(), json!(tenant_id))]),
                dedupe_key: None,
                fallback_roles: Vec::new(),
            },
        )
        .await;
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "review",
        "document_requests",
        Some(&path.document_request_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn create_download_url(
    State(state): State<AppState>,
    Path(path): Path<DocumentRequestPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let (record, _) = load_document_request(&state, &user_id, &path.document_request_id).await?;
    let object_key = value_str_opt(&record, "object_key")
        .ok_or_else(|| AppError::NotFound("No file has been uploaded.".to_string()))?;

    let presigned = require_storage(&state)?.presign_download(&object_key).await?;
    Ok(Json(json!(presigned)))
}

#[cfg(test)]
mod tests {
    use super::{next_status, DocumentAction};

    #[test]
    fn happy_path_reaches_approved() {
        assert_eq!(next_status("requested", DocumentAction::Upload), Some("requested"));
        assert_eq!(next_status("requested", DocumentAction::Submit), Some("submitted"));
        assert_eq!(next_status("submitted", DocumentAction::Approve), Some("approved"));
    }

    #[test]
    fn rejected_documents_can_be_resubmitted() {
        assert_eq!(next_status("submitted", DocumentAction::Reject), Some("rejected"));
        assert_eq!(next_status("rejected", DocumentAction::Upload), Some("rejected"));
        assert_eq!(next_status("rejected", DocumentAction::Submit), Some("submitted"));
    }

    #[test]
    fn approved_is_final_and_review_needs_a_submission() {
        assert_eq!(next_status("approved", DocumentAction::Upload), None);
        assert_eq!(next_status("approved", DocumentAction::Reject), None);
        assert_eq!(next_status("requested", DocumentAction::Approve), None);
        assert_eq!(next_status("submitted", DocumentAction::Submit), None);
    }
}
