use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use validator::{Validate, ValidationError};

use crate::{
    error::AppError,
    services::{autopay::PaymentMethodKind, ledger::ChargeType, proration::ProrationKind},
};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

pub fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

/// Trimmed string field of a JSON row; empty when missing or not a string.
pub fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

pub fn value_str_opt(row: &Value, key: &str) -> Option<String> {
    Some(value_str(row, key)).filter(|value| !value.is_empty())
}

/// Integer field, accepting JSON numbers and numeric strings (Stripe metadata
/// values are always strings).
pub fn value_i64(row: &Value, key: &str) -> Option<i64> {
    match row.get(key)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.fract() == 0.0).map(|v| v as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub fn value_f64(row: &Value, key: &str) -> Option<f64> {
    match row.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn value_bool(row: &Value, key: &str) -> Option<bool> {
    match row.get(key)? {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn validate_period(value: &str) -> Result<(), ValidationError> {
    crate::services::ledger::BillingPeriod::parse(value)
        .map(|_| ())
        .ok_or_else(|| ValidationError::new("period must be YYYY-MM"))
}

fn default_limit_100() -> i64 {
    100
}
fn default_limit_200() -> i64 {
    200
}
fn default_true() -> bool {
    true
}
fn default_manual_method() -> String {
    "cash".to_string()
}

// ===== Shared paths =====

#[derive(Debug, Clone, Deserialize)]
pub struct LeasePath {
    pub lease_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyPath {
    pub property_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargePath {
    pub charge_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenancePath {
    pub request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentRequestPath {
    pub document_request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvitationPath {
    pub invitation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrgQuery {
    pub org_id: String,
}

// ===== Ledger =====

#[derive(Debug, Clone, Deserialize)]
pub struct TenantBalanceQuery {
    pub org_id: String,
    pub tenant_id: String,
    pub unit_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargesQuery {
    pub status: Option<String>,
    pub charge_type: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateChargeInput {
    pub charge_type: ChargeType,
    /// Negative for credits.
    pub amount_cents: i64,
    pub due_date: NaiveDate,
    #[validate(length(min = 1, max = 500))]
    pub description: String,
    #[validate(custom(function = "validate_period"))]
    pub period: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ManualPaymentInput {
    #[validate(range(min = 1, max = 10_000_000))]
    pub amount_cents: i64,
    #[serde(default = "default_manual_method")]
    pub method: String,
    #[validate(length(max = 200))]
    pub reference: Option<String>,
}

// ===== Late fees =====

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LateFeeRuleInput {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[validate(range(min = 0, max = 60))]
    pub grace_period_days: i64,
    pub fee_type: crate::services::late_fees::LateFeeType,
    #[validate(range(min = 0, max = 1_000_000))]
    #[serde(default)]
    pub fee_amount_cents: i64,
    #[validate(range(min = 0.0, max = 100.0))]
    #[serde(default)]
    pub fee_percent: f64,
    #[validate(range(min = 0, max = 1_000_000))]
    pub max_fee_cents: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LateFeePreviewQuery {
    pub monthly_rent_cents: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RunLateFeesInput {
    pub org_id: String,
    pub as_of: Option<NaiveDate>,
}

// ===== Leases & proration =====

#[derive(Debug, Clone, Deserialize)]
pub struct LeasesQuery {
    pub org_id: String,
    pub status: Option<String>,
    pub property_id: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateLeaseInput {
    pub organization_id: String,
    pub property_id: String,
    pub unit_id: String,
    #[validate(length(max = 200))]
    pub tenant_name: Option<String>,
    #[validate(email)]
    pub tenant_email: Option<String>,
    #[validate(length(min = 8, max = 20))]
    pub tenant_phone_e164: Option<String>,
    #[validate(range(min = 1, max = 10_000_000))]
    pub monthly_rent_cents: i64,
    #[validate(range(min = 1, max = 31))]
    pub rent_due_day: i64,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    #[validate(range(min = 0, max = 10_000_000))]
    pub security_deposit_cents: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndLeaseInput {
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProrationPreviewQuery {
    pub monthly_rent_cents: i64,
    pub date: NaiveDate,
    pub kind: ProrationKind,
}

// ===== Payments & autopay =====

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePaymentInput {
    /// Defaults to the current balance.
    #[validate(range(min = 50, max = 10_000_000))]
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AutopayEnrollInput {
    #[validate(length(min = 1, max = 255))]
    pub stripe_customer_id: String,
    #[validate(length(min = 1, max = 255))]
    pub payment_method_id: String,
    #[validate(range(min = 1, max = 31))]
    pub charge_day: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutopayQuoteQuery {
    pub method: PaymentMethodKind,
    pub amount_cents: Option<i64>,
}

// ===== Maintenance =====

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateMaintenanceInput {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    pub category: Option<String>,
    pub urgency: Option<String>,
    #[serde(default)]
    pub permission_to_enter: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceQuery {
    pub org_id: String,
    pub status: Option<String>,
    pub property_id: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateMaintenanceInput {
    pub status: Option<String>,
    #[validate(length(max = 5000))]
    pub resolution_notes: Option<String>,
    pub assigned_user_id: Option<String>,
    pub scheduled_for: Option<NaiveDate>,
}

// ===== Document requests =====

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateDocumentRequestInput {
    pub lease_id: String,
    #[validate(length(min = 1, max = 100))]
    pub document_type: String,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentRequestsQuery {
    pub org_id: Option<String>,
    pub lease_id: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DocumentUploadInput {
    #[validate(length(min = 1, max = 255))]
    pub file_name: String,
    #[validate(length(min = 3, max = 100))]
    pub content_type: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReviewDocumentInput {
    pub approve: bool,
    #[validate(length(max = 2000))]
    pub review_notes: Option<String>,
}

// ===== Invitations =====

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateInvitationInput {
    #[validate(email)]
    pub email: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AcceptInvitationInput {
    #[validate(length(min = 16, max = 256))]
    pub token: String,
}

// ===== Notifications =====

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsQuery {
    pub org_id: String,
    #[serde(default)]
    pub unread_only: bool,
    pub cursor: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPath {
    pub notification_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadAllNotificationsInput {
    pub org_id: String,
}

// ===== Admin =====

#[derive(Debug, Clone, Deserialize)]
pub struct AdminListQuery {
    pub org_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminJobPath {
    pub job: String,
}

#[derive(Debug, Clone, Deserialize, Validate, Default)]
pub struct RunJobInput {
    pub org_id: Option<String>,
    #[validate(custom(function = "validate_period"))]
    pub period: Option<String>,
    pub as_of: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use validator::Validate;

    use super::{
        value_bool, value_f64, value_i64, value_str, value_str_opt, CreateLeaseInput, RunJobInput,
    };

    #[test]
    fn numeric_fields_accept_strings() {
        let row = json!({
            "amount": 1500,
            "fee_cents": "4500",
            "rounded": 12.0,
            "fractional": 12.5,
            "percent": "5.5",
            "enabled": "true",
            "name": "  Unit 4B  ",
            "blank": "   "
        });
        assert_eq!(value_i64(&row, "amount"), Some(1500));
        assert_eq!(value_i64(&row, "fee_cents"), Some(4500));
        assert_eq!(value_i64(&row, "rounded"), Some(12));
        assert_eq!(value_i64(&row, "fractional"), None);
        assert_eq!(value_f64(&row, "percent"), Some(5.5));
        assert_eq!(value_bool(&row, "enabled"), Some(true));
        assert_eq!(value_str(&row, "name"), "Unit 4B");
        assert_eq!(value_str_opt(&row, "blank"), None);
        assert_eq!(value_str(&json!(null), "name"), "");
    }

    #[test]
    fn lease_input_rejects_out_of_range_due_day() {
        let input: CreateLeaseInput = serde_json::from_value(json!({
            "organization_id": "org-1",
            "property_id": "prop-1",
            "unit_id": "unit-1",
            "monthly_rent_cents": 150000,
            "rent_due_day": 32,
            "start_date": "2026-03-15"
        }))
        .expect("deserializes");
        assert!(input.validate().is_err());
    }

    #[test]
    fn job_input_validates_period_format() {
        let ok = RunJobInput {
            period: Some("2026-03".to_string()),
            ..RunJobInput::default()
        };
        assert!(ok.validate().is_ok());
        let bad = RunJobInput {
            period: Some("March".to_string()),
            ..RunJobInput::default()
        };
        assert!(bad.validate().is_err());
    }
}
