use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};

/// Authenticated caller resolved from a bearer token (or the dev override header).
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
    pub user_metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<Value>,
}

pub async fn require_user(state: &AppState, headers: &HeaderMap) -> AppResult<AuthUser> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_str(headers, "x-user-id") {
            tracing::debug!(user_id = %user_id, "Using dev auth override");
            return Ok(AuthUser {
                id: user_id,
                email: header_str(headers, "x-user-email"),
                user_metadata: None,
            });
        }
    }

    let token = bearer_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Unauthorized: missing bearer token.".to_string()))?;

    let secret = state.config.auth_jwt_secret.as_deref().ok_or_else(|| {
        AppError::ServiceUnavailable("AUTH_JWT_SECRET is not configured.".to_string())
    })?;

    verify_session_token(&token, secret, state.config.auth_jwt_issuer.as_deref())
}

pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    Ok(require_user(state, headers).await?.id)
}

pub fn verify_session_token(token: &str, secret: &str, issuer: Option<&str>) -> AppResult<AuthUser> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    if let Some(issuer) = issuer {
        validation.set_issuer(&[issuer]);
    }

    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|error| {
        tracing::debug!(error = %error, "Rejected session token");
        AppError::Unauthorized("Unauthorized: invalid or expired token.".to_string())
    })?;

    let claims = data.claims;
    if claims.sub.trim().is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token has no subject.".to_string(),
        ));
    }

    Ok(AuthUser {
        id: claims.sub.trim().to_string(),
        email: claims
            .email
            .map(|email| email.trim().to_lowercase())
            .filter(|email| !email.is_empty()),
        user_metadata: claims.user_metadata,
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_str(headers, "authorization")?;
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::{bearer_token, verify_session_token};

    fn sign(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("token encodes")
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn verifies_signed_token() {
        let token = sign(
            json!({ "sub": "user-1", "email": "Ana@Example.com", "exp": future_exp() }),
            "secret",
        );
        let user = verify_session_token(&token, "secret", None).expect("valid token");
        assert_eq!(user.id, "user-1");
        assert_eq!(user.email.as_deref(), Some("ana@example.com"));
    }

    #[test]
    fn rejects_wrong_secret_and_issuer() {
        let token = sign(
            json!({ "sub": "user-1", "iss": "https://auth.example", "exp": future_exp() }),
            "secret",
        );
        assert!(verify_session_token(&token, "other", None).is_err());
        assert!(verify_session_token(&token, "secret", Some("https://evil.example")).is_err());
        assert!(verify_session_token(&token, "secret", Some("https://auth.example")).is_ok());
    }

    #[test]
    fn rejects_expired_token() {
        let token = sign(
            json!({ "sub": "user-1", "exp": chrono::Utc::now().timestamp() - 7200 }),
            "secret",
        );
        assert!(verify_session_token(&token, "secret", None).is_err());
    }
}
