use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::{
    config::AppConfig,
    error::AppResult,
    repository::table_service::{get_row, list_rows, update_row},
    schemas::{value_i64, value_str},
    services::{
        ledger::{get_lease_totals, BillingPeriod, LeaseTerms},
        payments::{create_payment_intent, PaymentIntentRequest},
    },
    state::AppState,
};

pub const DEFAULT_CURRENCY: &str = "usd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    Card,
    UsBankAccount,
}

impl PaymentMethodKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "card" => Some(Self::Card),
            "us_bank_account" | "ach" => Some(Self::UsBankAccount),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::UsBankAccount => "us_bank_account",
        }
    }
}

/// Gateway pricing for one payment method: a percentage plus a fixed amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeSchedule {
    pub bps: i64,
    pub fixed_cents: i64,
    pub cap_cents: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AutopayFees {
    pub card: FeeSchedule,
    pub ach: FeeSchedule,
}

impl AutopayFees {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            card: FeeSchedule {
                bps: config.autopay_card_fee_bps,
                fixed_cents: config.autopay_card_fee_fixed_cents,
                cap_cents: None,
            },
            ach: FeeSchedule {
                bps: config.autopay_ach_fee_bps,
                fixed_cents: 0,
                cap_cents: Some(config.autopay_ach_fee_cap_cents).filter(|cap| *cap > 0),
            },
        }
    }

    pub fn for_method(&self, method: PaymentMethodKind) -> FeeSchedule {
        match method {
            PaymentMethodKind::Card => self.card,
            PaymentMethodKind::UsBankAccount => self.ach,
        }
    }
}

impl Default for AutopayFees {
    fn default() -> Self {
        Self {
            card: FeeSchedule {
                bps: 290,
                fixed_cents: 30,
                cap_cents: None,
            },
            ach: FeeSchedule {
                bps: 80,
                fixed_cents: 0,
                cap_cents: Some(500),
            },
        }
    }
}

/// Fee that, added to `amount_cents`, leaves the landlord whole after the
/// gateway takes its cut: `ceil((amount + fixed) / (1 - rate)) - amount`,
/// then capped for methods with a fee ceiling.
pub fn calculate_processing_fee(
    amount_cents: i64,
    method: PaymentMethodKind,
    fees: &AutopayFees,
) -> i64 {
    if amount_cents <= 0 {
        return 0;
    }
    let schedule = fees.for_method(method);
    let bps = i128::from(schedule.bps.clamp(0, 9_999));
    let numerator = (i128::from(amount_cents) + i128::from(schedule.fixed_cents.max(0))) * 10_000;
    let denominator = 10_000 - bps;
    let total = (numerator + denominator - 1) / denominator;

    let fee = (total - i128::from(amount_cents)).max(0) as i64;
    match schedule.cap_cents {
        Some(cap) => fee.min(cap),
        None => fee,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AutopayQuote {
    pub amount_cents: i64,
    pub fee_cents: i64,
    pub total_cents: i64,
    pub method: PaymentMethodKind,
}

pub fn quote(amount_cents: i64, method: PaymentMethodKind, fees: &AutopayFees) -> AutopayQuote {
    let amount_cents = amount_cents.max(0);
    let fee_cents = calculate_processing_fee(amount_cents, method, fees);
    AutopayQuote {
        amount_cents,
        fee_cents,
        total_cents: amount_cents + fee_cents,
        method,
    }
}

/// Enrollment row parsed for a charge run.
#[derive(Debug, Clone, PartialEq)]
pub struct AutopayEnrollment {
    pub id: String,
    pub organization_id: String,
    pub lease_id: String,
    pub tenant_id: String,
    pub stripe_customer_id: String,
    pub stripe_payment_method_id: String,
    pub method: PaymentMethodKind,
    pub charge_day: u32,
    pub last_charged_period: Option<String>,
}

impl AutopayEnrollment {
    pub fn from_row(row: &Value) -> Option<Self> {
        let id = value_str(row, "id");
        let stripe_customer_id = value_str(row, "stripe_customer_id");
        let stripe_payment_method_id = value_str(row, "stripe_payment_method_id");
        if id.is_empty() || stripe_customer_id.is_empty() || stripe_payment_method_id.is_empty() {
            return None;
        }
        Some(Self {
            id,
            organization_id: value_str(row, "organization_id"),
            lease_id: value_str(row, "lease_id"),
            tenant_id: value_str(row, "tenant_id"),
            stripe_customer_id,
            stripe_payment_method_id,
            method: PaymentMethodKind::parse(&value_str(row, "payment_method_type"))?,
            charge_day: value_i64(row, "charge_day")
                .and_then(|day| u32::try_from(day).ok())
                .unwrap_or(1),
            last_charged_period: Some(value_str(row, "last_charged_period"))
                .filter(|period| !period.is_empty()),
        })
    }

    /// Due from the charge day (clamped to the month length) until the
    /// period is marked handled, so a missed run catches up the next day.
    pub fn is_due(&self, today: NaiveDate) -> bool {
        let period = BillingPeriod::containing(today);
        period.day_clamped(self.charge_day) <= today
            && self.last_charged_period.as_deref() != Some(period.key().as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutopayRunResult {
    pub evaluated: u32,
    pub charged: u32,
    pub skipped: u32,
    pub errors: u32,
}

/// Charge every enrollment that is due on `today`. The PaymentIntent
/// carries the ledger metadata; the payment row arrives via webhook.
pub async fn run_autopay_charges(state: &AppState, today: NaiveDate) -> AutopayRunResult {
    let mut result = AutopayRunResult::default();
    let Some(pool) = state.db_pool.as_ref() else {
        tracing::warn!("Autopay run skipped: no database pool configured");
        return result;
    };

    let enrollments = match list_active_enrollments(pool).await {
        Ok(rows) => rows,
        Err(error) => {
            tracing::warn!(error = %error, "Failed to load autopay enrollments");
            result.errors += 1;
            return result;
        }
    };

    let fees = AutopayFees::from_config(&state.config);
    for enrollment in enrollments.iter().filter_map(AutopayEnrollment::from_row) {
        if !enrollment.is_due(today) {
            continue;
        }
        result.evaluated += 1;
        match charge_enrollment(state, pool, &enrollment, &fees, today).await {
            Ok(true) => result.charged += 1,
            Ok(false) => result.skipped += 1,
            Err(error) => {
                tracing::warn!(enrollment_id = %enrollment.id, error = %error, "Autopay charge failed");
                record_failure(pool, &enrollment, &error.to_string()).await;
                result.errors += 1;
            }
        }
    }

    tracing::info!(
        date = %today,
        evaluated = result.evaluated,
        charged = result.charged,
        skipped = result.skipped,
        errors = result.errors,
        "Autopay run completed"
    );
    result
}

async fn list_active_enrollments(pool: &PgPool) -> AppResult<Vec<Value>> {
    const PAGE: i64 = 500;
    let mut filters = Map::new();
    filters.insert("status".to_string(), json!("active"));

    let mut enrollments = Vec::new();
    let mut offset = 0;
    loop {
        let page = list_rows(
            pool,
            "autopay_enrollments",
            Some(&filters),
            PAGE,
            offset,
            "created_at",
            true,
        )
        .await?;
        let fetched = page.len() as i64;
        enrollments.extend(page);
        if fetched < PAGE {
            break;
        }
        offset += PAGE;
    }
    Ok(enrollments)
}

async fn charge_enrollment(
    state: &AppState,
    pool: &PgPool,
    enrollment: &AutopayEnrollment,
    fees: &AutopayFees,
    today: NaiveDate,
) -> AppResult<bool> {
    let lease_row = get_row(pool, "leases", &enrollment.lease_id, "id").await?;
    let Some(lease) = LeaseTerms::from_row(&lease_row) else {
        return Ok(false);
    };
    if lease.status != "active" || lease.tenant_id.as_deref() != Some(enrollment.tenant_id.as_str()) {
        return Ok(false);
    }

    let period = BillingPeriod::containing(today);
    let totals = get_lease_totals(pool, &lease.id).await?;
    if totals.has_pending_payment() {
        return Ok(false);
    }
    let balance_cents = totals.balance_cents();
    if balance_cents <= 0 {
        // Nothing owed on the charge day; later charges wait for next period.
        let mut patch = Map::new();
        patch.insert("last_charged_period".to_string(), json!(period.key()));
        update_row(pool, "autopay_enrollments", &enrollment.id, &patch, "id").await?;
        return Ok(false);
    }

    let quoted = quote(balance_cents, enrollment.method, fees);
    let request = PaymentIntentRequest {
        amount_cents: quoted.total_cents,
        currency: DEFAULT_CURRENCY.to_string(),
        customer_id: Some(enrollment.stripe_customer_id.clone()),
        payment_method_id: Some(enrollment.stripe_payment_method_id.clone()),
        off_session: true,
        description: format!("Autopay for {}", period.key()),
        metadata: vec![
            ("organization_id".to_string(), lease.organization_id.clone()),
            ("lease_id".to_string(), lease.id.clone()),
            ("unit_id".to_string(), lease.unit_id.clone()),
            ("tenant_id".to_string(), enrollment.tenant_id.clone()),
            ("autopay".to_string(), "true".to_string()),
            ("fee_cents".to_string(), quoted.fee_cents.to_string()),
            ("enrollment_id".to_string(), enrollment.id.clone()),
        ],
        idempotency_key: Some(format!("autopay:{}:{}", enrollment.id, period.key())),
    };
    let intent = create_payment_intent(&state.http_client, &state.config, &request).await?;

    let mut patch = Map::new();
    patch.insert("last_charged_period".to_string(), json!(period.key()));
    patch.insert("last_payment_intent_id".to_string(), json!(value_str(&intent, "id")));
    patch.insert("last_error".to_string(), Value::Null);
    update_row(pool, "autopay_enrollments", &enrollment.id, &patch, "id").await?;

    tracing::info!(
        enrollment_id = %enrollment.id,
        lease_id = %lease.id,
        total_cents = quoted.total_cents,
        fee_cents = quoted.fee_cents,
        "Autopay PaymentIntent created"
    );
    Ok(true)
}

async fn record_failure(pool: &PgPool, enrollment: &AutopayEnrollment, message: &str) {
    let mut patch = Map::new();
    patch.insert("last_error".to_string(), json!(message));
    if let Err(error) = update_row(pool, "autopay_enrollments", &enrollment.id, &patch, "id").await {
        tracing::warn!(enrollment_id = %enrollment.id, error = %error, "Failed to record autopay error");
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::{
        calculate_processing_fee, quote, AutopayEnrollment, AutopayFees, FeeSchedule,
        PaymentMethodKind,
    };

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn card_fee_grosses_up_percentage_and_fixed() {
        let fees = AutopayFees::default();
        // (150000 + 30) / 0.971 = 154510.81 → 154511
        assert_eq!(
            calculate_processing_fee(150_000, PaymentMethodKind::Card, &fees),
            4_511
        );
        let quoted = quote(150_000, PaymentMethodKind::Card, &fees);
        assert_eq!(quoted.total_cents, 154_511);
        // net after 2.9% + 30¢ covers the full rent
        let net = quoted.total_cents - (quoted.total_cents * 290 + 9_999) / 10_000 - 30;
        assert!(net >= 150_000);
    }

    #[test]
    fn ach_fee_is_capped() {
        let fees = AutopayFees::default();
        // 10000 / 0.992 = 10080.64 → 10081
        assert_eq!(
            calculate_processing_fee(10_000, PaymentMethodKind::UsBankAccount, &fees),
            81
        );
        assert_eq!(
            calculate_processing_fee(150_000, PaymentMethodKind::UsBankAccount, &fees),
            500
        );
    }

    #[test]
    fn non_positive_amounts_have_no_fee() {
        let fees = AutopayFees::default();
        assert_eq!(calculate_processing_fee(0, PaymentMethodKind::Card, &fees), 0);
        assert_eq!(calculate_processing_fee(-100, PaymentMethodKind::Card, &fees), 0);
        assert_eq!(quote(-100, PaymentMethodKind::Card, &fees).total_cents, 0);
    }

    #[test]
    fn zero_rate_schedule_passes_only_fixed_fee() {
        let fees = AutopayFees {
            card: FeeSchedule {
                bps: 0,
                fixed_cents: 25,
                cap_cents: None,
            },
            ..AutopayFees::default()
        };
        assert_eq!(calculate_processing_fee(1_000, PaymentMethodKind::Card, &fees), 25);
    }

    #[test]
    fn enrollment_is_due_once_per_period_on_clamped_day() {
        let row = json!({
            "id": "enr-1",
            "organization_id": "org-1",
            "lease_id": "lease-1",
            "tenant_id": "user-1",
            "stripe_customer_id": "cus_1",
            "stripe_payment_method_id": "pm_1",
            "payment_method_type": "card",
            "charge_day": 31,
            "last_charged_period": "2026-01"
        });
        let enrollment = AutopayEnrollment::from_row(&row).expect("enrollment");
        assert!(!enrollment.is_due(date("2026-01-31")));
        assert!(enrollment.is_due(date("2026-02-28")));
        assert!(!enrollment.is_due(date("2026-02-27")));
    }

    #[test]
    fn missed_charge_day_is_caught_up_later_in_the_month() {
        let row = json!({
            "id": "enr-1",
            "organization_id": "org-1",
            "lease_id": "lease-1",
            "tenant_id": "user-1",
            "stripe_customer_id": "cus_1",
            "stripe_payment_method_id": "pm_1",
            "payment_method_type": "us_bank_account",
            "charge_day": 5,
            "last_charged_period": "2026-02"
        });
        let mut enrollment = AutopayEnrollment::from_row(&row).expect("enrollment");
        assert!(!enrollment.is_due(date("2026-03-04")));
        assert!(enrollment.is_due(date("2026-03-05")));
        assert!(enrollment.is_due(date("2026-03-09")));

        enrollment.last_charged_period = Some("2026-03".to_string());
        assert!(!enrollment.is_due(date("2026-03-20")));
        assert!(enrollment.is_due(date("2026-04-05")));
    }

    #[test]
    fn enrollment_requires_saved_method() {
        let row = json!({ "id": "enr-1", "stripe_customer_id": "cus_1", "payment_method_type": "card" });
        assert!(AutopayEnrollment::from_row(&row).is_none());
    }
}
