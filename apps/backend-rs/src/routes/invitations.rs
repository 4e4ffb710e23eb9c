use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::{
    auth::require_user,
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows, map_db_error},
    schemas::{
        validate_input, value_str, value_str_opt, AcceptInvitationInput, CreateInvitationInput,
        InvitationPath, LeasePath,
    },
    services::{
        audit::write_audit_log,
        messaging::{queue_message, OutboundMessage},
    },
    state::AppState,
    tenancy::{assert_org_role, ensure_org_membership, load_lease_for_staff, TENANT_ROLE},
};

const INVITE_ROLES: &[&str] = &["owner_admin", "manager"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/leases/{lease_id}/invitations",
            axum::routing::get(list_invitations).post(create_invitation),
        )
        .route(
            "/invitations/{invitation_id}/revoke",
            axum::routing::post(revoke_invitation),
        )
        .route("/invitations/accept", axum::routing::post(accept_invitation))
}

/// 256 bits of randomness, hex encoded. Only the hash is stored.
fn generate_invite_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

fn hash_invite_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}

fn invite_link(app_public_url: &str, token: &str) -> AppResult<String> {
    let mut url = url::Url::parse(app_public_url)
        .and_then(|base| base.join("/invite"))
        .map_err(|error| AppError::Internal(format!("Invalid APP_PUBLIC_URL: {error}")))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvitationState {
    Pending,
    Accepted,
    Revoked,
    Expired,
}

fn invitation_state(row: &Value, now: DateTime<Utc>) -> InvitationState {
    match value_str(row, "status").as_str() {
        "accepted" => return InvitationState::Accepted,
        "revoked" => return InvitationState::Revoked,
        _ => {}
    }
    let expired = value_str_opt(row, "expires_at")
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .is_none_or(|expires_at| expires_at.with_timezone(&Utc) <= now);
    if expired {
        InvitationState::Expired
    } else {
        InvitationState::Pending
    }
}

fn public_view(mut row: Value) -> Value {
    if let Some(object) = row.as_object_mut() {
        object.remove("token_hash");
    }
    row
}

async fn create_invitation(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<CreateInvitationInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    validate_input(&payload)?;
    let user = require_user(&state, &headers).await?;
    let lease = load_lease_for_staff(&state, &user.id, &path.lease_id, INVITE_ROLES).await?;
    if value_str(&lease, "status") != "active" {
        return Err(AppError::Conflict("Lease is not active.".to_string()));
    }
    if value_str_opt(&lease, "tenant_id").is_some() {
        return Err(AppError::Conflict(
            "Lease already has a tenant account.".to_string(),
        ));
    }
    let org_id = value_str(&lease, "organization_id");
    let email = payload.email.trim().to_ascii_lowercase();
    let pool = state.pool()?;

    // A new invitation supersedes any still-pending one for the lease.
    sqlx::query(
        "UPDATE lease_invitations SET status = 'revoked', revoked_at = now()
         WHERE lease_id = $1::uuid AND status = 'pending'",
    )
    .bind(&path.lease_id)
    .execute(pool)
    .await
    .map_err(map_db_error)?;

    let token = generate_invite_token();
    let expires_at = Utc::now() + Duration::days(state.config.invite_expires_in_days.max(1));

    let mut record = Map::new();
    record.insert("organization_id".to_string(), json!(org_id));
    record.insert("lease_id".to_string(), json!(path.lease_id));
    record.insert("email".to_string(), json!(email));
    record.insert("token_hash".to_string(), json!(hash_invite_token(&token)));
    record.insert("status".to_string(), json!("pending"));
    record.insert("expires_at".to_string(), json!(expires_at.to_rfc3339()));
    record.insert("invited_by_user_id".to_string(), json!(user.id));
    let created = create_row(pool, "lease_invitations", &record).await?;
    let invitation_id = value_str(&created, "id");

    let link = invite_link(&state.config.app_public_url, &token)?;
    let message = OutboundMessage {
        organization_id: org_id.clone(),
        channel: "email".to_string(),
        recipient: email,
        subject: Some("You're invited to your tenant portal".to_string()),
        body: format!(
            "You have been invited to view your lease, pay rent and submit requests online.\n\nAccept the invitation: {link}\n\nThis link expires on {}.",
            expires_at.format("%Y-%m-%d")
        ),
        kind: "lease_invitation".to_string(),
        related_id: Some(invitation_id.clone()),
    };
    queue_message(pool, &message).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user.id),
        "create",
        "lease_invitations",
        Some(&invitation_id),
        None,
        Some(public_view(created.clone())),
    )
    .await;

    Ok((StatusCode::CREATED, Json(public_view(created))))
}

async fn list_invitations(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    load_lease_for_staff(&state, &user.id, &path.lease_id, INVITE_ROLES).await?;

    let mut filters = Map::new();
    filters.insert("lease_id".to_string(), json!(path.lease_id));
    let rows = list_rows(
        state.pool()?,
        "lease_invitations",
        Some(&filters),
        100,
        0,
        "created_at",
        false,
    )
    .await?;
    let data: Vec<Value> = rows.into_iter().map(public_view).collect();
    Ok(Json(json!({ "data": data })))
}

async fn revoke_invitation(
    State(state): State<AppState>,
    Path(path): Path<InvitationPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = state.pool()?;
    let existing = get_row(pool, "lease_invitations", &path.invitation_id, "id").await?;
    let org_id = value_str(&existing, "organization_id");
    assert_org_role(&state, &user.id, &org_id, INVITE_ROLES).await?;

    let row = sqlx::query(
        "UPDATE lease_invitations SET status = 'revoked', revoked_at = now()
         WHERE id = $1::uuid AND status = 'pending'
         RETURNING row_to_json(lease_invitations.*) AS row",
    )
    .bind(&path.invitation_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;
    let revoked = row
        .and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Conflict("Invitation is no longer pending.".to_string()))?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user.id),
        "revoke",
        "lease_invitations",
        Some(&path.invitation_id),
        Some(public_view(existing)),
        Some(public_view(revoked.clone())),
    )
    .await;

    Ok(Json(public_view(revoked)))
}

/// Binds the signed-in user to the invited lease as its tenant.
async fn accept_invitation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AcceptInvitationInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user = require_user(&state, &headers).await?;
    let pool = state.pool()?;

    let invitation = get_row(
        pool,
        "lease_invitations",
        &hash_invite_token(&payload.token),
        "token_hash",
    )
    .await
    .map_err(|_| AppError::NotFound("Invitation not found.".to_string()))?;

    match invitation_state(&invitation, Utc::now()) {
        InvitationState::Pending => {}
        InvitationState::Accepted => {
            return Err(AppError::Conflict(
                "Invitation has already been used.".to_string(),
            ))
        }
        InvitationState::Revoked | InvitationState::Expired => {
            return Err(AppError::Gone("Invitation has expired.".to_string()))
        }
    }
    let invited_email = value_str(&invitation, "email");
    if let Some(email) = user.email.as_deref() {
        if !email.trim().eq_ignore_ascii_case(&invited_email) {
            return Err(AppError::Forbidden(
                "Forbidden: this invitation was sent to a different email address.".to_string(),
            ));
        }
    }

    let invitation_id = value_str(&invitation, "id");
    let lease_id = value_str(&invitation, "lease_id");
    let org_id = value_str(&invitation, "organization_id");

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let claimed = sqlx::query(
        "UPDATE lease_invitations
         SET status = 'accepted', accepted_at = now(), accepted_by_user_id = $2
         WHERE id = $1::uuid AND status = 'pending' AND expires_at > now()
         RETURNING id",
    )
    .bind(&invitation_id)
    .bind(&user.id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(map_db_error)?;
    if claimed.is_none() {
        return Err(AppError::Conflict(
            "Invitation has already been used.".to_string(),
        ));
    }
    let bound = sqlx::query(
        "UPDATE leases SET tenant_id = $2, updated_at = now()
         WHERE id = $1::uuid AND (tenant_id IS NULL OR tenant_id = $2)
         RETURNING row_to_json(leases.*) AS row",
    )
    .bind(&lease_id)
    .bind(&user.id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(map_db_error)?;
    let Some(lease) = bound.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
    else {
        return Err(AppError::Conflict(
            "Lease already has a tenant account.".to_string(),
        ));
    };
    tx.commit().await.map_err(map_db_error)?;

    ensure_org_membership(&state, &org_id, &user.id, TENANT_ROLE).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user.id),
        "accept",
        "lease_invitations",
        Some(&invitation_id),
        None,
        Some(json!({ "lease_id": lease_id, "tenant_id": user.id })),
    )
    .await;

    tracing::info!(lease_id = %lease_id, "Lease invitation accepted");
    Ok(Json(json!({ "lease": lease, "organization_id": org_id })))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{
        generate_invite_token, hash_invite_token, invitation_state, invite_link, public_view,
        InvitationState,
    };

    #[test]
    fn tokens_are_long_and_unique() {
        let first = generate_invite_token();
        let second = generate_invite_token();
        assert_eq!(first.len(), 64);
        assert_ne!(first, second);
    }

    #[test]
    fn token_hash_is_sha256_hex() {
        assert_eq!(
            hash_invite_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash_invite_token(" abc "), hash_invite_token("abc"));
    }

    #[test]
    fn invite_link_encodes_token() {
        let link = invite_link("https://app.example.com/portal", "tok en").expect("valid base");
        assert_eq!(link, "https://app.example.com/invite?token=tok+en");
        assert!(invite_link("not a url", "token").is_err());
    }

    #[test]
    fn state_reflects_status_and_expiry() {
        let now = Utc::now();
        let future = (now + Duration::days(3)).to_rfc3339();
        let past = (now - Duration::minutes(1)).to_rfc3339();

        let pending = json!({ "status": "pending", "expires_at": future });
        let expired = json!({ "status": "pending", "expires_at": past });
        let accepted = json!({ "status": "accepted", "expires_at": past });
        let revoked = json!({ "status": "revoked", "expires_at": future });

        assert_eq!(invitation_state(&pending, now), InvitationState::Pending);
        assert_eq!(invitation_state(&expired, now), InvitationState::Expired);
        assert_eq!(invitation_state(&accepted, now), InvitationState::Accepted);
        assert_eq!(invitation_state(&revoked, now), InvitationState::Revoked);
        assert_eq!(
            invitation_state(&json!({ "status": "pending" }), now),
            InvitationState::Expired
        );
    }

    #[test]
    fn public_view_hides_token_hash() {
        let row = public_view(json!({ "id": "inv-1", "token_hash": "secret" }));
        assert!(row.get("token_hash").is_none());
        assert_eq!(row["id"], "inv-1");
    }
}
