use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &[
    "audit_logs",
    "autopay_enrollments",
    "charges",
    "document_requests",
    "late_fee_rules",
    "lease_invitations",
    "leases",
    "maintenance_requests",
    "message_logs",
    "notification_events",
    "organization_members",
    "organizations",
    "payments",
    "platform_admins",
    "properties",
    "units",
    "user_notifications",
];

/// Columns holding auth subjects. These are opaque text, never uuid-typed.
const SUBJECT_COLUMNS: &[&str] = &["user_id", "tenant_id"];

pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    query
        .push(" ORDER BY t.")
        .push(order_name)
        .push(if ascending { " ASC" } else { " DESC" })
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn get_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_scalar_filter(
        &mut query,
        id_name,
        FilterOperator::Eq,
        &infer_scalar_filter(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn create_row(
    pool: &sqlx::PgPool,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    let keys = sorted_columns(payload)?;

    // jsonb_populate_record lets PostgreSQL coerce uuid/enum/date columns from JSON.
    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    push_column_list(&mut query, &keys, "");
    query.push(") SELECT ");
    push_column_list(&mut query, &keys, "r.");
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ")
        .push_bind(Value::Object(payload.clone()))
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

pub async fn update_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let keys = sorted_columns(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(*key);
            separated.push_unseparated(" = r.");
            separated.push_unseparated(*key);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ")
        .push_bind(Value::Object(payload.clone()))
        .push(") r WHERE ");
    push_scalar_filter(
        &mut query,
        id_name,
        FilterOperator::Eq,
        &infer_scalar_filter(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn count_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError> {
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    let row = query.build().fetch_one(pool).await.map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

pub fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Dependency("Database operation failed.".to_string())
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn sorted_columns(payload: &Map<String, Value>) -> Result<Vec<&str>, AppError> {
    let mut keys = payload
        .keys()
        .map(|key| validate_identifier(key))
        .collect::<Result<Vec<_>, _>>()?;
    keys.sort_unstable();
    Ok(keys)
}

fn push_column_list(query: &mut QueryBuilder<Postgres>, keys: &[&str], prefix: &str) {
    let mut separated = query.separated(", ");
    for key in keys {
        separated.push(prefix);
        separated.push_unseparated(*key);
    }
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    let valid_chars = trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    });
    let starts_with_digit = trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit());

    if trimmed.is_empty() || !valid_chars || starts_with_digit {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, PartialEq)]
enum ScalarFilter {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
}

impl FilterOperator {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => " = ",
            Self::Gt => " > ",
            Self::Gte => " >= ",
            Self::Lt => " < ",
            Self::Lte => " <= ",
            Self::IsNull => " IS NULL",
        }
    }
}

/// `due_date__lte` → (`due_date`, Lte). `status__in` with an array is plain Eq.
fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    let Some((column, suffix)) = filter_key.rsplit_once("__") else {
        return Ok((validate_identifier(filter_key)?, FilterOperator::Eq));
    };
    let operator = match suffix {
        "gt" => FilterOperator::Gt,
        "gte" => FilterOperator::Gte,
        "lt" => FilterOperator::Lt,
        "lte" => FilterOperator::Lte,
        "is_null" => FilterOperator::IsNull,
        "in" => FilterOperator::Eq,
        _ => return Ok((validate_identifier(filter_key)?, FilterOperator::Eq)),
    };
    Ok((validate_identifier(column)?, operator))
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    if operator == FilterOperator::IsNull {
        let should_be_null = value.as_bool().unwrap_or(true);
        query
            .push(" AND t.")
            .push(column)
            .push(if should_be_null { " IS NULL" } else { " IS NOT NULL" });
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if operator != FilterOperator::Eq {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            let texts = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(text.trim().to_string()),
                    Value::Number(number) => Some(number.to_string()),
                    Value::Bool(flag) => Some(flag.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>();
            if texts.is_empty() {
                return Ok(());
            }
            query
                .push(" AND t.")
                .push(column)
                .push("::text = ANY(")
                .push_bind(texts)
                .push(")");
            Ok(())
        }
        _ => {
            query.push(" AND ");
            push_scalar_filter(query, column, operator, &infer_scalar_filter(column, value));
            Ok(())
        }
    }
}

fn push_scalar_filter(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    operator: FilterOperator,
    value: &ScalarFilter,
) {
    query.push("t.").push(column);
    match value {
        ScalarFilter::Text(text) => {
            query.push("::text").push(operator.sql()).push_bind(text.clone());
        }
        ScalarFilter::Uuid(id) => {
            query.push(operator.sql()).push_bind(*id);
        }
        ScalarFilter::Bool(flag) => {
            query.push(operator.sql()).push_bind(*flag);
        }
        ScalarFilter::I64(number) => {
            query.push(operator.sql()).push_bind(*number);
        }
        ScalarFilter::Date(date) => {
            query.push(operator.sql()).push_bind(*date);
        }
        ScalarFilter::Timestamp(timestamp) => {
            query.push(operator.sql()).push_bind(*timestamp);
        }
    }
}

fn infer_scalar_filter(column: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::Number(number) => number
            .as_i64()
            .map(ScalarFilter::I64)
            .unwrap_or_else(|| ScalarFilter::Text(number.to_string())),
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_column(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return ScalarFilter::Uuid(parsed);
                }
            }
            if column.ends_with("_at") {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return ScalarFilter::Timestamp(parsed);
                }
            }
            if column.ends_with("_date") || column.ends_with("_on") {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        other => ScalarFilter::Text(other.to_string()),
    }
}

fn is_uuid_column(column: &str) -> bool {
    let normalized = column.trim();
    if SUBJECT_COLUMNS.contains(&normalized) || normalized.ends_with("_user_id") {
        return false;
    }
    normalized == "id" || normalized.ends_with("_id")
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{
        infer_scalar_filter, parse_filter_key, push_filter_clause, validate_identifier,
        validate_table, FilterOperator, ScalarFilter,
    };

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(validate_identifier("due_date").is_ok());
        assert!(validate_identifier("1col").is_err());
        assert!(validate_identifier("name; drop table leases").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_table("charges").is_ok());
        assert!(validate_table("pg_user").is_err());
    }

    #[test]
    fn parses_operator_suffixes() {
        assert_eq!(
            parse_filter_key("due_date__lte").expect("valid"),
            ("due_date", FilterOperator::Lte)
        );
        assert_eq!(
            parse_filter_key("status__in").expect("valid"),
            ("status", FilterOperator::Eq)
        );
        assert_eq!(
            parse_filter_key("voided_at__is_null").expect("valid"),
            ("voided_at", FilterOperator::IsNull)
        );
        assert_eq!(
            parse_filter_key("lease_id").expect("valid"),
            ("lease_id", FilterOperator::Eq)
        );
    }

    #[test]
    fn subject_columns_stay_text() {
        let id = Value::String("550e8400-e29b-41d4-a716-446655440000".to_string());
        assert!(matches!(
            infer_scalar_filter("lease_id", &id),
            ScalarFilter::Uuid(_)
        ));
        assert!(matches!(
            infer_scalar_filter("tenant_id", &id),
            ScalarFilter::Text(_)
        ));
        assert!(matches!(
            infer_scalar_filter("created_by_user_id", &id),
            ScalarFilter::Text(_)
        ));
        assert!(matches!(
            infer_scalar_filter("due_date", &json!("2026-03-05")),
            ScalarFilter::Date(_)
        ));
    }

    #[test]
    fn builds_filter_sql() {
        let mut filters = Map::new();
        filters.insert("status".to_string(), json!(["pending", "processing"]));
        filters.insert("due_date__lte".to_string(), json!("2026-03-05"));
        filters.insert("voided_at__is_null".to_string(), json!(true));

        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM charges t WHERE 1=1");
        for (key, value) in &filters {
            push_filter_clause(&mut query, key, value).expect("valid filter");
        }
        let sql = query.sql();
        assert!(sql.contains("t.due_date <= $1"), "got: {sql}");
        assert!(sql.contains("t.status::text = ANY($2)"), "got: {sql}");
        assert!(sql.contains("t.voided_at IS NULL"), "got: {sql}");
    }
}
