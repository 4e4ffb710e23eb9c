use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::repository::table_service::create_row;

/// Best-effort audit trail. Failures are logged and never fail the request.
#[allow(clippy::too_many_arguments)]
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    organization_id: Option<&str>,
    actor_user_id: Option<&str>,
    action: &str,
    entity_name: &str,
    entity_id: Option<&str>,
    before_state: Option<Value>,
    after_state: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let mut record = Map::new();
    record.insert("action".to_string(), Value::String(action.to_string()));
    record.insert(
        "entity_name".to_string(),
        Value::String(entity_name.to_string()),
    );
    for (key, value) in [
        ("organization_id", organization_id),
        ("actor_user_id", actor_user_id),
        ("entity_id", entity_id),
    ] {
        if let Some(value) = value.filter(|value| !value.is_empty()) {
            record.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    if let Some(before_state) = before_state {
        record.insert("before_state".to_string(), before_state);
    }
    if let Some(after_state) = after_state {
        record.insert("after_state".to_string(), after_state);
    }

    if let Err(error) = create_row(pool, "audit_logs", &record).await {
        tracing::warn!(action, entity_name, error = %error, "Failed to write audit log");
    }
}
