use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{create_row, list_rows, map_db_error},
    schemas::{non_empty_opt, value_str},
    tenancy::STAFF_ROLES,
};

#[derive(Debug, Clone)]
pub struct EmitNotificationEventInput {
    pub organization_id: String,
    pub event_type: String,
    pub category: String,
    pub severity: String,
    pub title: String,
    pub body: String,
    pub link_path: Option<String>,
    pub source_table: Option<String>,
    pub source_id: Option<String>,
    pub actor_user_id: Option<String>,
    /// `recipient_user_id` / `recipient_user_ids` here target specific users.
    pub payload: Map<String, Value>,
    pub dedupe_key: Option<String>,
    /// Roles notified when the payload names no recipients. Empty means staff.
    pub fallback_roles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationListResult {
    pub data: Vec<Value>,
    pub next_cursor: Option<String>,
}

/// Record an event and fan it out to recipients. Re-emitting with the same
/// dedupe key reuses the existing event and never double-delivers.
pub async fn emit_event(
    pool: &sqlx::PgPool,
    input: EmitNotificationEventInput,
) -> AppResult<Option<Value>> {
    let organization_id = input.organization_id.trim();
    let event_type = input.event_type.trim();
    if organization_id.is_empty() || event_type.is_empty() || input.title.trim().is_empty() {
        return Ok(None);
    }

    let dedupe_key = non_empty_opt(input.dedupe_key.as_deref());
    let existing = match dedupe_key.as_deref() {
        Some(key) => find_event_by_dedupe_key(pool, key).await?,
        None => None,
    };
    let event_row = match existing {
        Some(row) => row,
        None => insert_event_row(pool, &input, dedupe_key.as_deref()).await?,
    };

    let event_id = value_str(&event_row, "id");
    if event_id.is_empty() {
        return Ok(Some(event_row));
    }

    let recipients = resolve_recipients(pool, organization_id, &input).await?;
    for recipient_user_id in recipients {
        sqlx::query(
            "INSERT INTO user_notifications (organization_id, event_id, recipient_user_id)
             VALUES ($1::uuid, $2::uuid, $3)
             ON CONFLICT (event_id, recipient_user_id) DO NOTHING",
        )
        .bind(organization_id)
        .bind(&event_id)
        .bind(&recipient_user_id)
        .execute(pool)
        .await
        .map_err(map_db_error)?;
    }

    Ok(Some(event_row))
}

pub async fn list_for_user(
    pool: &sqlx::PgPool,
    organization_id: &str,
    user_id: &str,
    unread_only: bool,
    cursor: Option<&str>,
    limit: i64,
) -> AppResult<NotificationListResult> {
    let cursor = cursor
        .map(str::trim)
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc));

    let rows = sqlx::query(
        "SELECT
            un.id::text AS notification_id,
            un.read_at,
            un.created_at AS delivered_at,
            ne.event_type,
            ne.category,
            ne.severity,
            ne.title,
            ne.body,
            ne.link_path,
            ne.payload
         FROM user_notifications un
         JOIN notification_events ne ON ne.id = un.event_id
         WHERE un.organization_id = $1::uuid
           AND un.recipient_user_id = $2
           AND ($3::timestamptz IS NULL OR un.created_at < $3::timestamptz)
           AND (NOT $4 OR un.read_at IS NULL)
         ORDER BY un.created_at DESC
         LIMIT $5",
    )
    .bind(organization_id)
    .bind(user_id)
    .bind(cursor)
    .bind(unread_only)
    .bind(limit.clamp(1, 100))
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let data = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.try_get::<String, _>("notification_id").unwrap_or_default(),
                "event_type": row.try_get::<String, _>("event_type").unwrap_or_default(),
                "category": row.try_get::<String, _>("category").unwrap_or_default(),
                "severity": row.try_get::<String, _>("severity").unwrap_or_else(|_| "info".to_string()),
                "title": row.try_get::<String, _>("title").unwrap_or_default(),
                "body": row.try_get::<String, _>("body").unwrap_or_default(),
                "link_path": row.try_get::<Option<String>, _>("link_path").ok().flatten(),
                "payload": row.try_get::<Option<Value>, _>("payload").ok().flatten().unwrap_or_else(|| json!({})),
                "read_at": timestamp_column(row, "read_at"),
                "created_at": timestamp_column(row, "delivered_at"),
            })
        })
        .collect::<Vec<_>>();

    let next_cursor = rows
        .last()
        .and_then(|row| timestamp_column(row, "delivered_at"));

    Ok(NotificationListResult { data, next_cursor })
}

pub async fn unread_count(
    pool: &sqlx::PgPool,
    organization_id: &str,
    user_id: &str,
) -> AppResult<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*)::bigint AS total
         FROM user_notifications
         WHERE organization_id = $1::uuid
           AND recipient_user_id = $2
           AND read_at IS NULL",
    )
    .bind(organization_id)
    .bind(user_id)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

pub async fn mark_read(
    pool: &sqlx::PgPool,
    user_id: &str,
    notification_id: &str,
) -> AppResult<Value> {
    let row = sqlx::query(
        "UPDATE user_notifications
         SET read_at = COALESCE(read_at, now())
         WHERE id = $1::uuid AND recipient_user_id = $2
         RETURNING id::text AS id, read_at",
    )
    .bind(notification_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::NotFound("Notification not found.".to_string()))?;

    Ok(json!({
        "id": row.try_get::<String, _>("id").unwrap_or_default(),
        "read_at": timestamp_column(&row, "read_at"),
    }))
}

pub async fn mark_all_read(
    pool: &sqlx::PgPool,
    organization_id: &str,
    user_id: &str,
) -> AppResult<u64> {
    let result = sqlx::query(
        "UPDATE user_notifications
         SET read_at = now()
         WHERE organization_id = $1::uuid
           AND recipient_user_id = $2
           AND read_at IS NULL",
    )
    .bind(organization_id)
    .bind(user_id)
    .execute(pool)
    .await
    .map_err(map_db_error)?;

    Ok(result.rows_affected())
}

async fn insert_event_row(
    pool: &sqlx::PgPool,
    input: &EmitNotificationEventInput,
    dedupe_key: Option<&str>,
) -> AppResult<Value> {
    let mut record = Map::new();
    record.insert(
        "organization_id".to_string(),
        json!(input.organization_id.trim()),
    );
    record.insert("event_type".to_string(), json!(input.event_type.trim()));
    record.insert("category".to_string(), json!(input.category.trim()));
    record.insert("severity".to_string(), json!(input.severity.trim()));
    record.insert("title".to_string(), json!(input.title.trim()));
    record.insert("body".to_string(), json!(input.body.trim()));
    for (key, value) in [
        ("link_path", input.link_path.as_deref()),
        ("source_table", input.source_table.as_deref()),
        ("source_id", input.source_id.as_deref()),
        ("actor_user_id", input.actor_user_id.as_deref()),
        ("dedupe_key", dedupe_key),
    ] {
        if let Some(value) = non_empty_opt(value) {
            record.insert(key.to_string(), Value::String(value));
        }
    }
    record.insert("payload".to_string(), Value::Object(input.payload.clone()));
    record.insert("occurred_at".to_string(), json!(Utc::now().to_rfc3339()));

    match create_row(pool, "notification_events", &record).await {
        Ok(created) => Ok(created),
        // Lost a race on the dedupe key; the winner's row is the event.
        Err(AppError::Conflict(_)) if dedupe_key.is_some() => {
            find_event_by_dedupe_key(pool, dedupe_key.unwrap_or_default())
                .await?
                .ok_or_else(|| {
                    AppError::Conflict(
                        "Duplicate notification event rejected by dedupe key.".to_string(),
                    )
                })
        }
        Err(error) => Err(error),
    }
}

async fn find_event_by_dedupe_key(
    pool: &sqlx::PgPool,
    dedupe_key: &str,
) -> AppResult<Option<Value>> {
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM notification_events t
         WHERE dedupe_key = $1
         LIMIT 1",
    )
    .bind(dedupe_key)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    Ok(row.and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten()))
}

async fn resolve_recipients(
    pool: &sqlx::PgPool,
    organization_id: &str,
    input: &EmitNotificationEventInput,
) -> AppResult<Vec<String>> {
    let explicit = explicit_recipients(&input.payload);
    if !explicit.is_empty() {
        return Ok(explicit);
    }

    let roles = if input.fallback_roles.is_empty() {
        STAFF_ROLES.iter().map(|role| json!(role)).collect::<Vec<_>>()
    } else {
        input.fallback_roles.iter().map(|role| json!(role)).collect()
    };
    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(organization_id));
    filters.insert("role".to_string(), Value::Array(roles));

    let members = list_rows(
        pool,
        "organization_members",
        Some(&filters),
        500,
        0,
        "created_at",
        true,
    )
    .await?;

    Ok(members
        .iter()
        .map(|member| value_str(member, "user_id"))
        .filter(|user_id| !user_id.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect())
}

fn explicit_recipients(payload: &Map<String, Value>) -> Vec<String> {
    let mut recipients = BTreeSet::new();
    if let Some(user_id) = non_empty_opt(payload.get("recipient_user_id").and_then(Value::as_str)) {
        recipients.insert(user_id);
    }
    if let Some(user_ids) = payload.get("recipient_user_ids").and_then(Value::as_array) {
        recipients.extend(
            user_ids
                .iter()
                .filter_map(|item| non_empty_opt(item.as_str())),
        );
    }
    recipients.into_iter().collect()
}

fn timestamp_column(row: &sqlx::postgres::PgRow, column: &str) -> Option<String> {
    row.try_get::<Option<DateTime<Utc>>, _>(column)
        .ok()
        .flatten()
        .map(|value| value.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::explicit_recipients;

    #[test]
    fn explicit_recipients_are_deduplicated_and_sorted() {
        let payload = Map::from_iter([
            ("recipient_user_id".to_string(), json!("user-b")),
            (
                "recipient_user_ids".to_string(),
                json!(["user-a", " ", "user-b", 7]),
            ),
        ]);
        assert_eq!(
            explicit_recipients(&payload),
            vec!["user-a".to_string(), "user-b".to_string()]
        );
        assert!(explicit_recipients(&Map::new()).is_empty());
    }
}
