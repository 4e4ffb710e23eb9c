use axum::{
    extract::{Request, State},
    http::{header::HOST, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::state::AppState;

/// Reject requests whose `Host` is not in `TRUSTED_HOSTS`. `*` disables the
/// check; `*.example.com` matches any subdomain.
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let trusted = &state.config.trusted_hosts;
    if trusted.is_empty() || trusted.iter().any(|host| host == "*") {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default()
        .to_string();

    if host_allowed(&host, trusted) {
        next.run(request).await
    } else {
        tracing::warn!(host = %host, "Rejected request with untrusted host header");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "Invalid host header." })),
        )
            .into_response()
    }
}

fn host_allowed(raw_host: &str, trusted: &[String]) -> bool {
    let host = strip_port(raw_host.trim()).to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    trusted.iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        match pattern.strip_prefix("*.") {
            Some(suffix) => host.ends_with(&format!(".{suffix}")),
            None => host == pattern,
        }
    })
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8000
        return rest.split(']').next().unwrap_or_default();
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::host_allowed;

    fn trusted(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|host| host.to_string()).collect()
    }

    #[test]
    fn matches_exact_hosts_ignoring_port_and_case() {
        let hosts = trusted(&["localhost", "api.rentroll.app"]);
        assert!(host_allowed("localhost:8000", &hosts));
        assert!(host_allowed("API.rentroll.app", &hosts));
        assert!(!host_allowed("evil.example", &hosts));
        assert!(!host_allowed("", &hosts));
    }

    #[test]
    fn wildcard_matches_subdomains_only() {
        let hosts = trusted(&["*.rentroll.app"]);
        assert!(host_allowed("tenant.rentroll.app", &hosts));
        assert!(!host_allowed("rentroll.app", &hosts));
        assert!(!host_allowed("rentroll.app.evil.com", &hosts));
    }

    #[test]
    fn handles_ipv6_literals() {
        assert!(host_allowed("[::1]:8000", &trusted(&["::1"])));
    }
}
