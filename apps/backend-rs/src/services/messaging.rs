use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::Row;
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    error::AppResult,
    repository::table_service::{create_row, map_db_error, update_row},
    schemas::{value_i64, value_str},
};

const MAX_SEND_ATTEMPTS: i64 = 3;

/// A tenant-facing SMS or email waiting in `message_logs`.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub organization_id: String,
    /// `sms` or `email`.
    pub channel: String,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub kind: String,
    pub related_id: Option<String>,
}

pub async fn queue_message(pool: &sqlx::PgPool, message: &OutboundMessage) -> AppResult<Value> {
    let mut payload = Map::new();
    payload.insert("body".to_string(), Value::String(message.body.clone()));
    payload.insert("kind".to_string(), Value::String(message.kind.clone()));
    if let Some(subject) = &message.subject {
        payload.insert("subject".to_string(), Value::String(subject.clone()));
    }
    if let Some(related_id) = &message.related_id {
        payload.insert("related_id".to_string(), Value::String(related_id.clone()));
    }

    let mut record = Map::new();
    record.insert(
        "organization_id".to_string(),
        Value::String(message.organization_id.clone()),
    );
    record.insert("channel".to_string(), Value::String(message.channel.clone()));
    record.insert(
        "recipient".to_string(),
        Value::String(message.recipient.clone()),
    );
    record.insert("status".to_string(), Value::String("queued".to_string()));
    record.insert("retry_count".to_string(), json!(0));
    record.insert(
        "scheduled_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    record.insert("payload".to_string(), Value::Object(payload));

    create_row(pool, "message_logs", &record).await
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchResult {
    pub sent: u32,
    pub failed: u32,
}

/// Rows move to `sending` before any provider call, so overlapping
/// dispatchers never pick up the same message. A `sending` row left behind
/// by a crashed run is reclaimed once it is older than the stale window.
const CLAIM_MESSAGES_SQL: &str = "
    UPDATE message_logs SET status = 'sending', scheduled_at = now()
    WHERE id IN (
        SELECT id FROM message_logs
        WHERE retry_count < $1
          AND (status IN ('queued', 'failed')
               OR (status = 'sending' AND scheduled_at < now() - make_interval(mins => $3)))
        ORDER BY created_at
        LIMIT $2
        FOR UPDATE SKIP LOCKED
    )
    RETURNING row_to_json(message_logs.*) AS row";

const CLAIM_BATCH_SIZE: i64 = 100;
const STALE_SENDING_MINUTES: i32 = 10;

async fn claim_batch(pool: &sqlx::PgPool) -> AppResult<Vec<Value>> {
    let rows = sqlx::query(CLAIM_MESSAGES_SQL)
        .bind(MAX_SEND_ATTEMPTS)
        .bind(CLAIM_BATCH_SIZE)
        .bind(STALE_SENDING_MINUTES)
        .fetch_all(pool)
        .await
        .map_err(map_db_error)?;
    Ok(rows
        .iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect())
}

/// Send queued messages, plus failed ones still under the retry limit.
pub async fn process_queued_messages(
    pool: &sqlx::PgPool,
    http_client: &Client,
    config: &AppConfig,
) -> DispatchResult {
    let mut result = DispatchResult::default();

    let messages = match claim_batch(pool).await {
        Ok(rows) => rows,
        Err(error) => {
            warn!(error = %error, "Failed to claim queued messages");
            return result;
        }
    };

    for msg in messages {
        let id = value_str(&msg, "id");
        let channel = value_str(&msg, "channel");
        let recipient = value_str(&msg, "recipient");
        if id.is_empty() || recipient.is_empty() {
            continue;
        }

        let payload = msg.get("payload").cloned().unwrap_or(Value::Null);
        let body = value_str(&payload, "body");

        let outcome = match channel.as_str() {
            "sms" => send_sms(http_client, config, &recipient, &body).await,
            "email" => {
                let subject = Some(value_str(&payload, "subject"))
                    .filter(|subject| !subject.is_empty())
                    .unwrap_or_else(|| format!("{} notification", config.app_name));
                send_email(http_client, config, &recipient, &subject, &body).await
            }
            _ => {
                warn!(message_id = %id, channel = %channel, "Unknown message channel");
                Err("unsupported channel".to_string())
            }
        };

        let retry_count = value_i64(&msg, "retry_count").unwrap_or(0);
        let mut patch = Map::new();
        match outcome {
            Ok(provider_response) => {
                patch.insert("status".to_string(), Value::String("sent".to_string()));
                patch.insert(
                    "sent_at".to_string(),
                    Value::String(Utc::now().to_rfc3339()),
                );
                patch.insert("provider_response".to_string(), provider_response);
                result.sent += 1;
            }
            Err(error_message) => {
                patch.insert("status".to_string(), Value::String("failed".to_string()));
                patch.insert("error_message".to_string(), Value::String(error_message));
                patch.insert("retry_count".to_string(), json!(retry_count + 1));
                result.failed += 1;
            }
        }

        if let Err(error) = update_row(pool, "message_logs", &id, &patch, "id").await {
            warn!(message_id = %id, error = %error, "Failed to record message outcome");
        }
    }

    if result.sent > 0 || result.failed > 0 {
        info!(sent = result.sent, failed = result.failed, "Processed outbound messages");
    }
    result
}

/// Send an email via the Resend API.
async fn send_email(
    http_client: &Client,
    config: &AppConfig,
    recipient: &str,
    subject: &str,
    body: &str,
) -> Result<Value, String> {
    let api_key = config
        .resend_api_key
        .as_deref()
        .ok_or_else(|| "RESEND_API_KEY not configured".to_string())?;

    let payload = json!({
        "from": config.email_from_address,
        "to": [recipient],
        "subject": subject,
        "html": render_email_html(body),
    });

    let response = http_client
        .post("https://api.resend.com/emails")
        .bearer_auth(api_key)
        .json(&payload)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Resend API request failed");
            "Resend API request failed.".to_string()
        })?;

    let status = response.status();
    let resp_body: Value = response
        .json()
        .await
        .unwrap_or(json!({"error": "failed to parse response"}));

    if status.is_success() {
        Ok(resp_body)
    } else {
        let error_msg = resp_body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Resend API error");
        Err(format!("Resend API error ({status}): {error_msg}"))
    }
}

/// Send an SMS via the Twilio Messages API.
async fn send_sms(
    http_client: &Client,
    config: &AppConfig,
    recipient: &str,
    body: &str,
) -> Result<Value, String> {
    let account_sid = config
        .twilio_account_sid
        .as_deref()
        .ok_or_else(|| "TWILIO_ACCOUNT_SID not configured".to_string())?;
    let auth_token = config
        .twilio_auth_token
        .as_deref()
        .ok_or_else(|| "TWILIO_AUTH_TOKEN not configured".to_string())?;
    let from_number = config
        .twilio_phone_number
        .as_deref()
        .ok_or_else(|| "TWILIO_PHONE_NUMBER not configured".to_string())?;

    let url = format!("https://api.twilio.com/2010-04-01/Accounts/{account_sid}/Messages.json");

    let response = http_client
        .post(&url)
        .basic_auth(account_sid, Some(auth_token))
        .form(&[("To", recipient), ("From", from_number), ("Body", body)])
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Twilio API request failed");
            "Twilio API request failed.".to_string()
        })?;

    let status = response.status();
    let resp_body: Value = response
        .json()
        .await
        .unwrap_or(json!({"error": "failed to parse response"}));

    if status.is_success() {
        Ok(resp_body)
    } else {
        let error_msg = resp_body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Twilio API error");
        Err(format!("Twilio API error ({status}): {error_msg}"))
    }
}

/// Plain-text body → minimal HTML: escaped, with line breaks preserved.
fn render_email_html(body: &str) -> String {
    let escaped = body
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\n', "<br>");
    format!("<div style=\"font-family: sans-serif; max-width: 600px; margin: 0 auto;\">{escaped}</div>")
}

#[cfg(test)]
mod tests {
    use super::render_email_html;

    #[test]
    fn email_html_escapes_and_breaks_lines() {
        let html = render_email_html("Balance <due>\nPay & relax");
        assert!(html.contains("Balance &lt;due&gt;<br>Pay &amp; relax"));
        assert!(html.starts_with("<div"));
    }
}
