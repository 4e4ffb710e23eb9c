use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::require_user_id,
    error::AppResult,
    schemas::{
        clamp_limit_in_range, NotificationPath, NotificationsQuery, OrgQuery,
        ReadAllNotificationsInput,
    },
    services::notification_center::{list_for_user, mark_all_read, mark_read, unread_count},
    state::AppState,
    tenancy::assert_org_member,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/notifications", axum::routing::get(list_notifications))
        .route(
            "/notifications/unread-count",
            axum::routing::get(get_unread_count),
        )
        .route(
            "/notifications/{notification_id}/read",
            axum::routing::post(mark_notification_read),
        )
        .route(
            "/notifications/read-all",
            axum::routing::post(mark_notifications_read_all),
        )
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &query.org_id).await?;

    let result = list_for_user(
        state.pool()?,
        &query.org_id,
        &user_id,
        query.unread_only,
        query.cursor.as_deref(),
        clamp_limit_in_range(query.limit, 1, 100),
    )
    .await?;

    Ok(Json(json!({
        "data": result.data,
        "next_cursor": result.next_cursor,
    })))
}

async fn get_unread_count(
    State(state): State<AppState>,
    Query(query): Query<OrgQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &query.org_id).await?;

    let total = unread_count(state.pool()?, &query.org_id, &user_id).await?;
    Ok(Json(json!({ "unread": total })))
}

/// Recipients can only mark their own notifications.
async fn mark_notification_read(
    State(state): State<AppState>,
    Path(path): Path<NotificationPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let updated = mark_read(state.pool()?, &user_id, &path.notification_id).await?;
    Ok(Json(updated))
}

async fn mark_notifications_read_all(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ReadAllNotificationsInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &payload.org_id).await?;

    let updated = mark_all_read(state.pool()?, &payload.org_id, &user_id).await?;
    Ok(Json(json!({ "updated": updated })))
}
