use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;

use crate::{
    config::AppConfig,
    error::{AppError, AppResult},
};

type HmacSha256 = Hmac<Sha256>;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";
const SIGNATURE_TOLERANCE_SECS: u64 = 300;

/// Parameters for a Stripe PaymentIntent. Amounts are in cents.
#[derive(Debug, Clone)]
pub struct PaymentIntentRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
    /// Charge a saved method without the customer present (autopay).
    pub off_session: bool,
    pub description: String,
    pub metadata: Vec<(String, String)>,
    pub idempotency_key: Option<String>,
}

impl PaymentIntentRequest {
    fn form(&self) -> Vec<(String, String)> {
        let mut form = vec![
            ("amount".to_string(), self.amount_cents.to_string()),
            ("currency".to_string(), self.currency.to_lowercase()),
            ("description".to_string(), self.description.clone()),
        ];
        if let Some(customer_id) = &self.customer_id {
            form.push(("customer".to_string(), customer_id.clone()));
        }
        match &self.payment_method_id {
            Some(payment_method_id) => {
                form.push(("payment_method".to_string(), payment_method_id.clone()));
                if self.off_session {
                    form.push(("off_session".to_string(), "true".to_string()));
                    form.push(("confirm".to_string(), "true".to_string()));
                }
            }
            None => {
                form.push((
                    "automatic_payment_methods[enabled]".to_string(),
                    "true".to_string(),
                ));
            }
        }
        for (key, value) in &self.metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }
        form
    }
}

pub async fn create_payment_intent(
    http_client: &Client,
    config: &AppConfig,
    request: &PaymentIntentRequest,
) -> AppResult<Value> {
    if request.amount_cents <= 0 {
        return Err(AppError::BadRequest(
            "Payment amount must be positive.".to_string(),
        ));
    }
    stripe_post(
        http_client,
        config,
        "/payment_intents",
        &request.form(),
        request.idempotency_key.as_deref(),
    )
    .await
}

pub async fn create_customer(
    http_client: &Client,
    config: &AppConfig,
    email: Option<&str>,
    organization_id: &str,
    tenant_id: &str,
) -> AppResult<Value> {
    let mut form = vec![
        (
            "metadata[organization_id]".to_string(),
            organization_id.to_string(),
        ),
        ("metadata[tenant_id]".to_string(), tenant_id.to_string()),
    ];
    if let Some(email) = email.filter(|value| !value.trim().is_empty()) {
        form.push(("email".to_string(), email.trim().to_string()));
    }
    stripe_post(http_client, config, "/customers", &form, None).await
}

/// SetupIntent the client confirms to save a payment method for off-session use.
pub async fn create_setup_intent(
    http_client: &Client,
    config: &AppConfig,
    customer_id: &str,
    lease_id: &str,
) -> AppResult<Value> {
    let form = vec![
        ("customer".to_string(), customer_id.to_string()),
        ("usage".to_string(), "off_session".to_string()),
        ("payment_method_types[]".to_string(), "card".to_string()),
        (
            "payment_method_types[]".to_string(),
            "us_bank_account".to_string(),
        ),
        ("metadata[lease_id]".to_string(), lease_id.to_string()),
    ];
    stripe_post(http_client, config, "/setup_intents", &form, None).await
}

pub async fn retrieve_payment_method(
    http_client: &Client,
    config: &AppConfig,
    payment_method_id: &str,
) -> AppResult<Value> {
    let secret_key = stripe_secret(config)?;
    let response = http_client
        .get(format!("{STRIPE_API_BASE}/payment_methods/{payment_method_id}"))
        .basic_auth(secret_key, None::<&str>)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Stripe API request failed");
            AppError::Dependency("Stripe API request failed.".to_string())
        })?;
    read_stripe_response(response).await
}

async fn stripe_post(
    http_client: &Client,
    config: &AppConfig,
    path: &str,
    form: &[(String, String)],
    idempotency_key: Option<&str>,
) -> AppResult<Value> {
    let secret_key = stripe_secret(config)?;
    let mut request = http_client
        .post(format!("{STRIPE_API_BASE}{path}"))
        .basic_auth(secret_key, None::<&str>)
        .form(form);
    if let Some(key) = idempotency_key {
        request = request.header("Idempotency-Key", key);
    }

    let response = request.send().await.map_err(|e| {
        tracing::error!(error = %e, path, "Stripe API request failed");
        AppError::Dependency("Stripe API request failed.".to_string())
    })?;
    read_stripe_response(response).await
}

async fn read_stripe_response(response: reqwest::Response) -> AppResult<Value> {
    let status = response.status();
    let resp_body: Value = response
        .json()
        .await
        .unwrap_or(json!({"error": {"message": "failed to parse response"}}));

    if status.is_success() {
        Ok(resp_body)
    } else {
        let error_msg = resp_body
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown Stripe error");
        tracing::warn!(status = status.as_u16(), error = error_msg, "Stripe API error");
        Err(AppError::Dependency(format!(
            "Stripe API error ({status}): {error_msg}"
        )))
    }
}

fn stripe_secret(config: &AppConfig) -> AppResult<&str> {
    config
        .stripe_secret_key
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::ServiceUnavailable("STRIPE_SECRET_KEY not configured".to_string()))
}

/// Verify a `Stripe-Signature` header (`t=<ts>,v1=<hex>[,v1=<hex>...]`).
///
/// The signed payload is `<ts>.<body>`, signed with HMAC-SHA256. Signatures
/// older than five minutes are rejected; any matching `v1` entry passes.
pub fn verify_stripe_signature(payload: &str, signature_header: &str, webhook_secret: &str) -> bool {
    verify_stripe_signature_at(
        payload,
        signature_header,
        webhook_secret,
        chrono::Utc::now().timestamp(),
    )
}

fn verify_stripe_signature_at(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
    now: i64,
) -> bool {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(v1) = part.strip_prefix("v1=") {
            signatures.push(v1);
        }
    }

    let Some(ts_str) = timestamp else {
        return false;
    };
    if signatures.is_empty() {
        return false;
    }
    let Ok(ts) = ts_str.parse::<i64>() else {
        return false;
    };

    let Some(delta_secs) = now.checked_sub(ts).map(i64::unsigned_abs) else {
        return false;
    };
    if delta_secs > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(delta_secs, "Stripe webhook signature too old");
        return false;
    }

    let signed_payload = format!("{ts_str}.{payload}");
    signatures.into_iter().any(|expected_hex| {
        let Ok(expected_bytes) = hex::decode(expected_hex) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(webhook_secret.as_bytes()) else {
            return false;
        };
        mac.update(signed_payload.as_bytes());
        mac.verify_slice(&expected_bytes).is_ok()
    })
}

#[cfg(test)]
mod tests {
    use hmac::Mac;

    use super::{verify_stripe_signature, verify_stripe_signature_at, HmacSha256, PaymentIntentRequest};

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).expect("hmac key");
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_valid_signature() {
        let now = chrono::Utc::now().timestamp();
        let payload = r#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
        let header = format!("t={now},v1={}", sign(payload, now));
        assert!(verify_stripe_signature(payload, &header, SECRET));
    }

    #[test]
    fn rejects_modified_payload() {
        let now = 1_700_000_000;
        let header = format!("t={now},v1={}", sign(r#"{"amount":100}"#, now));
        assert!(!verify_stripe_signature_at(
            r#"{"amount":999}"#,
            &header,
            SECRET,
            now
        ));
    }

    #[test]
    fn rejects_wrong_secret() {
        let now = 1_700_000_000;
        let payload = "{}";
        let header = format!("t={now},v1={}", sign(payload, now));
        assert!(!verify_stripe_signature_at(payload, &header, "whsec_other", now));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let signed_at = 1_700_000_000;
        let payload = "{}";
        let header = format!("t={signed_at},v1={}", sign(payload, signed_at));
        assert!(verify_stripe_signature_at(payload, &header, SECRET, signed_at + 300));
        assert!(!verify_stripe_signature_at(payload, &header, SECRET, signed_at + 301));
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let now = 1_700_000_000;
        let payload = "{}";
        let header = format!("t={now},v1=deadbeef,v1={}", sign(payload, now));
        assert!(verify_stripe_signature_at(payload, &header, SECRET, now));
    }

    #[test]
    fn rejects_malformed_headers() {
        let now = 1_700_000_000;
        for header in [
            "",
            "garbage",
            "t=abc,v1=00",
            "v1=00",
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
            &format!("t={now}"),
            &format!("t={now},v1=zz"),
        ] {
            assert!(
                !verify_stripe_signature_at("{}", header, SECRET, now),
                "header {header:?} should be rejected"
            );
        }
    }

    #[test]
    fn off_session_intent_confirms_saved_method() {
        let request = PaymentIntentRequest {
            amount_cents: 154_500,
            currency: "USD".to_string(),
            customer_id: Some("cus_1".to_string()),
            payment_method_id: Some("pm_1".to_string()),
            off_session: true,
            description: "Autopay".to_string(),
            metadata: vec![("lease_id".to_string(), "lease-1".to_string())],
            idempotency_key: None,
        };
        let form = request.form();
        assert!(form.contains(&("currency".to_string(), "usd".to_string())));
        assert!(form.contains(&("off_session".to_string(), "true".to_string())));
        assert!(form.contains(&("confirm".to_string(), "true".to_string())));
        assert!(form.contains(&("metadata[lease_id]".to_string(), "lease-1".to_string())));
        assert!(!form.iter().any(|(key, _)| key.starts_with("automatic_payment_methods")));
    }
}
