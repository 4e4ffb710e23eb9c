use serde_json::Value;
use sqlx::Row;

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{get_row, map_db_error},
    state::AppState,
};

pub const STAFF_ROLES: &[&str] = &["owner_admin", "manager", "accountant"];
pub const FINANCE_ROLES: &[&str] = &["owner_admin", "accountant"];
pub const TENANT_ROLE: &str = "tenant";

/// How the caller relates to a lease they are acting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAccess {
    Staff,
    Tenant,
}

pub async fn get_org_membership(
    state: &AppState,
    user_id: &str,
    org_id: &str,
) -> AppResult<Option<Value>> {
    if uuid::Uuid::parse_str(org_id.trim()).is_err() {
        return Ok(None);
    }
    let cache_key = format!("{org_id}:{user_id}");
    if let Some(cached) = state.org_membership_cache.get(&cache_key).await {
        return Ok(cached);
    }

    let pool = state.pool()?;
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM organization_members t
         WHERE organization_id = $1::uuid AND user_id = $2
         LIMIT 1",
    )
    .bind(org_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    let membership = row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten());
    state
        .org_membership_cache
        .insert(cache_key, membership.clone())
        .await;
    Ok(membership)
}

pub async fn assert_org_member(state: &AppState, user_id: &str, org_id: &str) -> AppResult<Value> {
    get_org_membership(state, user_id, org_id)
        .await?
        .ok_or_else(|| {
            AppError::Forbidden("Forbidden: not a member of this organization.".to_string())
        })
}

pub async fn assert_org_role(
    state: &AppState,
    user_id: &str,
    org_id: &str,
    allowed_roles: &[&str],
) -> AppResult<Value> {
    let membership = assert_org_member(state, user_id, org_id).await?;
    let role = membership
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    if allowed_roles.contains(&role) {
        return Ok(membership);
    }

    Err(AppError::Forbidden(format!(
        "Forbidden: role '{role}' is not allowed for this action."
    )))
}

/// Staff of the lease's organization, or the tenant bound to the lease.
pub async fn assert_lease_access(
    state: &AppState,
    user_id: &str,
    lease: &Value,
) -> AppResult<LeaseAccess> {
    let org_id = lease
        .get("organization_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let membership = assert_org_member(state, user_id, org_id).await?;
    let role = membership
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    if STAFF_ROLES.contains(&role) {
        return Ok(LeaseAccess::Staff);
    }

    let tenant_id = lease
        .get("tenant_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if role == TENANT_ROLE && !tenant_id.is_empty() && tenant_id == user_id {
        return Ok(LeaseAccess::Tenant);
    }

    Err(AppError::Forbidden(
        "Forbidden: no access to this lease.".to_string(),
    ))
}

/// Load a lease and resolve the caller's access to it.
pub async fn load_lease_for_user(
    state: &AppState,
    user_id: &str,
    lease_id: &str,
) -> AppResult<(Value, LeaseAccess)> {
    let lease = get_row(state.pool()?, "leases", lease_id, "id").await?;
    let access = assert_lease_access(state, user_id, &lease).await?;
    Ok((lease, access))
}

/// Load a lease the caller must manage with one of `allowed_roles`.
pub async fn load_lease_for_staff(
    state: &AppState,
    user_id: &str,
    lease_id: &str,
    allowed_roles: &[&str],
) -> AppResult<Value> {
    let lease = get_row(state.pool()?, "leases", lease_id, "id").await?;
    let org_id = lease
        .get("organization_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    assert_org_role(state, user_id, org_id, allowed_roles).await?;
    Ok(lease)
}

pub async fn ensure_org_membership(
    state: &AppState,
    org_id: &str,
    user_id: &str,
    role: &str,
) -> AppResult<()> {
    let pool = state.pool()?;
    sqlx::query(
        "INSERT INTO organization_members (organization_id, user_id, role)
         VALUES ($1::uuid, $2, $3)
         ON CONFLICT (organization_id, user_id) DO NOTHING",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(role)
    .execute(pool)
    .await
    .map_err(map_db_error)?;

    state
        .org_membership_cache
        .invalidate(&format!("{org_id}:{user_id}"))
        .await;
    Ok(())
}

pub async fn require_platform_admin(state: &AppState, user_id: &str) -> AppResult<()> {
    let pool = state.pool()?;
    let row = sqlx::query("SELECT 1 AS ok FROM platform_admins WHERE user_id = $1 LIMIT 1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    if row.is_some() {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Forbidden: platform admin access required.".to_string(),
        ))
    }
}
