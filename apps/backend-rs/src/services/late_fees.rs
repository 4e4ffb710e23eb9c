use std::collections::HashMap;

use chrono::{Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::{
    config::parse_timezone,
    error::AppResult,
    repository::table_service::{count_rows, get_row, list_rows},
    schemas::{value_bool, value_f64, value_i64, value_str},
    services::{
        ledger::{
            get_lease_totals_due_by, list_active_leases, post_charge, rent_charge_for_period,
            BillingPeriod, ChargeType, LeaseTerms, NewCharge,
        },
        messaging::{queue_message, OutboundMessage},
        notification_center::{emit_event, EmitNotificationEventInput},
    },
    state::AppState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateFeeType {
    Flat,
    Percentage,
}

/// Per-property late fee configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateFeeRule {
    pub enabled: bool,
    pub grace_period_days: i64,
    pub fee_type: LateFeeType,
    /// Used when `fee_type` is flat.
    pub fee_amount_cents: i64,
    /// Percent of monthly rent (5.0 = 5%), used when `fee_type` is percentage.
    pub fee_percent: f64,
    pub max_fee_cents: Option<i64>,
}

impl LateFeeRule {
    pub fn from_row(row: &Value) -> Option<Self> {
        let fee_type = match value_str(row, "fee_type").as_str() {
            "flat" => LateFeeType::Flat,
            "percentage" => LateFeeType::Percentage,
            _ => return None,
        };
        Some(Self {
            enabled: value_bool(row, "enabled").unwrap_or(false),
            grace_period_days: value_i64(row, "grace_period_days").unwrap_or(0).max(0),
            fee_type,
            fee_amount_cents: value_i64(row, "fee_amount_cents").unwrap_or(0),
            fee_percent: value_f64(row, "fee_percent").unwrap_or(0.0),
            max_fee_cents: value_i64(row, "max_fee_cents"),
        })
    }
}

/// Facts about one lease and period that gate a late fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LateFeeContext {
    pub due_date: NaiveDate,
    pub today: NaiveDate,
    pub outstanding_cents: i64,
    pub has_pending_payment: bool,
    pub already_assessed: bool,
}

/// 100 (percent) × 1_000_000 (micro-percent).
const PERCENT_SCALE: i128 = 100_000_000;

/// Flat amount, or percent of monthly rent rounded half-up; capped by
/// `max_fee_cents` when set. Never negative.
pub fn calculate_late_fee(rule: &LateFeeRule, monthly_rent_cents: i64) -> i64 {
    let fee = match rule.fee_type {
        LateFeeType::Flat => rule.fee_amount_cents,
        LateFeeType::Percentage => {
            // Rate in millionths of a percent keeps six decimals exact; the
            // product is rounded once, on the final cents.
            let micro_percent = (rule.fee_percent * 1_000_000.0).round() as i64;
            let raw = i128::from(monthly_rent_cents.max(0)) * i128::from(micro_percent.max(0));
            ((raw + PERCENT_SCALE / 2) / PERCENT_SCALE) as i64
        }
    };

    let capped = match rule.max_fee_cents {
        Some(cap) if cap >= 0 => fee.min(cap),
        _ => fee,
    };
    capped.max(0)
}

/// The grace period runs through `due_date + grace_period_days`; a fee is due
/// the day after.
pub fn grace_period_end(rule: &LateFeeRule, due_date: NaiveDate) -> NaiveDate {
    due_date + Duration::days(rule.grace_period_days.max(0))
}

pub fn should_assess_late_fee(rule: &LateFeeRule, ctx: &LateFeeContext) -> bool {
    if !rule.enabled || ctx.already_assessed {
        return false;
    }
    if ctx.today <= grace_period_end(rule, ctx.due_date) {
        return false;
    }
    if ctx.outstanding_cents <= 0 {
        return false;
    }
    // A payment still settling (ACH can take days) must not be penalized.
    !ctx.has_pending_payment
}

/// Periods whose late fee can be judged on `today`: the current month, plus
/// the previous month while its grace period runs into this one.
pub fn candidate_periods(
    lease: &LeaseTerms,
    rule: &LateFeeRule,
    today: NaiveDate,
) -> Vec<(BillingPeriod, NaiveDate, i64)> {
    let current = BillingPeriod::containing(today);
    let previous = current.previous();
    let mut periods = Vec::with_capacity(2);
    if let Some((due_date, rent_cents)) = rent_charge_for_period(lease, previous) {
        if grace_period_end(rule, due_date) >= current.first_day() {
            periods.push((previous, due_date, rent_cents));
        }
    }
    if let Some((due_date, rent_cents)) = rent_charge_for_period(lease, current) {
        periods.push((current, due_date, rent_cents));
    }
    periods
}

pub fn late_fee_idempotency_key(lease_id: &str, period: BillingPeriod) -> String {
    format!("late_fee:{lease_id}:{}", period.key())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LateFeeRunResult {
    pub evaluated: u32,
    pub assessed: u32,
    pub skipped: u32,
    pub errors: u32,
}

/// Sweep active leases and post late fees where the property's rule says so.
///
/// `as_of` overrides "today"; otherwise today is taken in each organization's
/// time zone so a fee never lands before the due day ends locally.
pub async fn run_late_fee_assessment(
    state: &AppState,
    org_id: Option<&str>,
    as_of: Option<NaiveDate>,
) -> LateFeeRunResult {
    let mut result = LateFeeRunResult::default();
    let Some(pool) = state.db_pool.as_ref() else {
        tracing::warn!("Late fee run skipped: no database pool configured");
        return result;
    };

    let leases = match list_active_leases(pool, org_id).await {
        Ok(rows) => rows,
        Err(error) => {
            tracing::warn!(error = %error, "Failed to load leases for late fee run");
            result.errors += 1;
            return result;
        }
    };

    let mut rules: HashMap<String, Option<LateFeeRule>> = HashMap::new();
    let mut zones: HashMap<String, Tz> = HashMap::new();

    for row in &leases {
        let Some(lease) = LeaseTerms::from_row(row) else {
            continue;
        };
        result.evaluated += 1;

        if !rules.contains_key(&lease.property_id) {
            let rule = load_rule(pool, &lease.property_id).await.unwrap_or(None);
            rules.insert(lease.property_id.clone(), rule);
        }
        let Some(rule) = rules.get(&lease.property_id).cloned().flatten() else {
            result.skipped += 1;
            continue;
        };

        let today = match as_of {
            Some(date) => date,
            None => {
                if !zones.contains_key(&lease.organization_id) {
                    let tz = load_org_timezone(pool, &lease.organization_id)
                        .await
                        .unwrap_or_else(|| state.config.default_tz());
                    zones.insert(lease.organization_id.clone(), tz);
                }
                let tz = zones
                    .get(&lease.organization_id)
                    .copied()
                    .unwrap_or_else(|| state.config.default_tz());
                Utc::now().with_timezone(&tz).date_naive()
            }
        };

        match assess_lease(state, pool, &lease, &rule, today).await {
            Ok(0) => result.skipped += 1,
            Ok(posted) => result.assessed += posted,
            Err(error) => {
                tracing::warn!(lease_id = %lease.id, error = %error, "Late fee assessment failed");
                result.errors += 1;
            }
        }
    }

    tracing::info!(
        evaluated = result.evaluated,
        assessed = result.assessed,
        skipped = result.skipped,
        errors = result.errors,
        "Late fee run completed"
    );
    result
}

async fn assess_lease(
    state: &AppState,
    pool: &PgPool,
    lease: &LeaseTerms,
    rule: &LateFeeRule,
    today: NaiveDate,
) -> AppResult<u32> {
    let mut posted = 0;
    for (period, due_date, monthly_rent_cents) in candidate_periods(lease, rule, today) {
        if assess_period(state, pool, lease, rule, today, period, due_date, monthly_rent_cents)
            .await?
        {
            posted += 1;
        }
    }
    Ok(posted)
}

#[allow(clippy::too_many_arguments)]
async fn assess_period(
    state: &AppState,
    pool: &PgPool,
    lease: &LeaseTerms,
    rule: &LateFeeRule,
    today: NaiveDate,
    period: BillingPeriod,
    due_date: NaiveDate,
    monthly_rent_cents: i64,
) -> AppResult<bool> {

    let idempotency_key = late_fee_idempotency_key(&lease.id, period);
    let mut existing = Map::new();
    existing.insert("organization_id".to_string(), json!(lease.organization_id));
    existing.insert("idempotency_key".to_string(), json!(idempotency_key));
    let already_assessed = count_rows(pool, "charges", Some(&existing)).await? > 0;

    let totals = get_lease_totals_due_by(pool, &lease.id, due_date).await?;
    let ctx = LateFeeContext {
        due_date,
        today,
        outstanding_cents: totals.balance_cents(),
        has_pending_payment: totals.has_pending_payment(),
        already_assessed,
    };
    if !should_assess_late_fee(rule, &ctx) {
        return Ok(false);
    }

    let fee_cents = calculate_late_fee(rule, monthly_rent_cents);
    if fee_cents <= 0 {
        return Ok(false);
    }

    let charge = NewCharge {
        organization_id: lease.organization_id.clone(),
        lease_id: lease.id.clone(),
        unit_id: lease.unit_id.clone(),
        charge_type: ChargeType::LateFee,
        amount_cents: fee_cents,
        due_date: today,
        period: Some(period.key()),
        description: format!("Late fee for {} rent", period.key()),
        idempotency_key: Some(idempotency_key.clone()),
        created_by_user_id: None,
    };
    let Some(created) = post_charge(pool, &charge).await? else {
        return Ok(false);
    };

    let charge_id = value_str(&created, "id");
    let _ = emit_event(
        pool,
        EmitNotificationEventInput {
            organization_id: lease.organization_id.clone(),
            event_type: "late_fee_assessed".to_string(),
            category: "payments".to_string(),
            severity: "warning".to_string(),
            title: "Late fee assessed".to_string(),
            body: format!(
                "A late fee of {} was posted for {} rent.",
                format_cents(fee_cents),
                period.key()
            ),
            link_path: Some(format!("/leases/{}", lease.id)),
            source_table: Some("charges".to_string()),
            source_id: Some(charge_id.clone()),
            actor_user_id: None,
            payload: Map::from_iter([("lease_id".to_string(), json!(lease.id))]),
            dedupe_key: Some(idempotency_key),
            fallback_roles: Vec::new(),
        },
    )
    .await;

    notify_tenant(state, pool, lease, fee_cents, period).await;
    tracing::info!(lease_id = %lease.id, charge_id = %charge_id, fee_cents, "Late fee posted");
    Ok(true)
}

async fn notify_tenant(
    state: &AppState,
    pool: &PgPool,
    lease: &LeaseTerms,
    fee_cents: i64,
    period: BillingPeriod,
) {
    let Ok(row) = get_row(pool, "leases", &lease.id, "id").await
    else {
        return;
    };
    let body = format!(
        "A late fee of {} was added to your account for {} rent. Pay online at {}/tenant/payments",
        format_cents(fee_cents),
        period.key(),
        state.config.app_public_url
    );

    for (channel, recipient) in [
        ("sms", value_str(&row, "tenant_phone_e164")),
        ("email", value_str(&row, "tenant_email")),
    ] {
        if recipient.is_empty() {
            continue;
        }
        let message = OutboundMessage {
            organization_id: lease.organization_id.clone(),
            channel: channel.to_string(),
            recipient,
            subject: Some("Late fee posted to your account".to_string()),
            body: body.clone(),
            kind: "late_fee".to_string(),
            related_id: Some(lease.id.clone()),
        };
        if let Err(error) = queue_message(pool, &message).await {
            tracing::warn!(lease_id = %lease.id, channel, error = %error, "Failed to queue late fee notice");
        }
    }
}

pub async fn load_rule(pool: &PgPool, property_id: &str) -> AppResult<Option<LateFeeRule>> {
    let mut filters = Map::new();
    filters.insert("property_id".to_string(), json!(property_id));
    let rows = list_rows(pool, "late_fee_rules", Some(&filters), 1, 0, "created_at", false).await?;
    Ok(rows.first().and_then(LateFeeRule::from_row))
}

async fn load_org_timezone(pool: &PgPool, org_id: &str) -> Option<Tz> {
    let org = get_row(pool, "organizations", org_id, "id")
        .await
        .ok()?;
    parse_timezone(&value_str(&org, "timezone"))
}

pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}${}.{:02}", abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::NaiveDate;
    use serde_json::json;

    use super::{
        calculate_late_fee, candidate_periods, format_cents, grace_period_end,
        should_assess_late_fee, LateFeeContext, LateFeeRule, LateFeeType,
    };
    use crate::services::ledger::LeaseTerms;

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    fn flat(amount: i64) -> LateFeeRule {
        LateFeeRule {
            enabled: true,
            grace_period_days: 5,
            fee_type: LateFeeType::Flat,
            fee_amount_cents: amount,
            fee_percent: 0.0,
            max_fee_cents: None,
        }
    }

    fn percentage(percent: f64, cap: Option<i64>) -> LateFeeRule {
        LateFeeRule {
            enabled: true,
            grace_period_days: 3,
            fee_type: LateFeeType::Percentage,
            fee_amount_cents: 0,
            fee_percent: percent,
            max_fee_cents: cap,
        }
    }

    fn overdue_ctx() -> LateFeeContext {
        LateFeeContext {
            due_date: date("2026-03-01"),
            today: date("2026-03-07"),
            outstanding_cents: 150_000,
            has_pending_payment: false,
            already_assessed: false,
        }
    }

    #[test]
    fn flat_fee_ignores_rent() {
        assert_eq!(calculate_late_fee(&flat(7_500), 150_000), 7_500);
        assert_eq!(calculate_late_fee(&flat(7_500), 0), 7_500);
    }

    #[test]
    fn percentage_fee_rounds_half_up() {
        assert_eq!(calculate_late_fee(&percentage(5.0, None), 150_000), 7_500);
        // 1234.55 * 2.5% = 30.86375 → 30.86
        assert_eq!(calculate_late_fee(&percentage(2.5, None), 123_455), 3_086);
        // 10.10 * 5% = 0.505 → 0.51
        assert_eq!(calculate_late_fee(&percentage(5.0, None), 1_010), 51);
    }

    #[test]
    fn percentage_fee_keeps_fractional_rates() {
        assert_eq!(calculate_late_fee(&percentage(2.125, None), 100_000), 2_125);
        // 999.99 * 1.375% = 13.7498625 → 13.75
        assert_eq!(calculate_late_fee(&percentage(1.375, None), 99_999), 1_375);
        // 10.00 * 0.125% = 0.0125 → 0.01
        assert_eq!(calculate_late_fee(&percentage(0.125, None), 1_000), 1);
    }

    #[test]
    fn cap_limits_fee() {
        assert_eq!(calculate_late_fee(&percentage(10.0, Some(5_000)), 150_000), 5_000);
        assert_eq!(calculate_late_fee(&percentage(10.0, Some(50_000)), 150_000), 15_000);
        let mut capped_flat = flat(9_000);
        capped_flat.max_fee_cents = Some(2_500);
        assert_eq!(calculate_late_fee(&capped_flat, 150_000), 2_500);
    }

    #[test]
    fn fee_is_never_negative() {
        assert_eq!(calculate_late_fee(&flat(-100), 150_000), 0);
        assert_eq!(calculate_late_fee(&percentage(-5.0, None), 150_000), 0);
    }

    #[test]
    fn grace_period_is_inclusive() {
        let rule = flat(5_000);
        assert_eq!(grace_period_end(&rule, date("2026-03-01")), date("2026-03-06"));

        let mut ctx = overdue_ctx();
        ctx.today = date("2026-03-06");
        assert!(!should_assess_late_fee(&rule, &ctx));
        ctx.today = date("2026-03-07");
        assert!(should_assess_late_fee(&rule, &ctx));
    }

    #[test]
    fn gates_block_assessment() {
        let rule = flat(5_000);

        let mut pending = overdue_ctx();
        pending.has_pending_payment = true;
        assert!(!should_assess_late_fee(&rule, &pending));

        let mut paid = overdue_ctx();
        paid.outstanding_cents = 0;
        assert!(!should_assess_late_fee(&rule, &paid));

        let mut repeated = overdue_ctx();
        repeated.already_assessed = true;
        assert!(!should_assess_late_fee(&rule, &repeated));

        let mut disabled = flat(5_000);
        disabled.enabled = false;
        assert!(!should_assess_late_fee(&disabled, &overdue_ctx()));
    }

    fn lease_due_on(day: u32) -> LeaseTerms {
        LeaseTerms::from_row(&json!({
            "id": "lease-1",
            "organization_id": "org-1",
            "property_id": "prop-1",
            "unit_id": "unit-1",
            "tenant_id": "user-1",
            "monthly_rent_cents": 120000,
            "rent_due_day": day,
            "start_date": "2025-01-01",
            "status": "active"
        }))
        .expect("valid lease row")
    }

    /// Walk the daily sweep over a date range and record when each period's
    /// fee would post, with idempotency keys preventing repeats.
    fn daily_assessments(
        lease: &LeaseTerms,
        rule: &LateFeeRule,
        from: &str,
        to: &str,
    ) -> Vec<(String, String)> {
        let mut assessed = HashSet::new();
        let mut posted = Vec::new();
        let mut today = date(from);
        while today <= date(to) {
            for (period, due_date, _) in candidate_periods(lease, rule, today) {
                let ctx = LateFeeContext {
                    due_date,
                    today,
                    outstanding_cents: 120_000,
                    has_pending_payment: false,
                    already_assessed: assessed.contains(&period.key()),
                };
                if should_assess_late_fee(rule, &ctx) {
                    assessed.insert(period.key());
                    posted.push((today.to_string(), period.key()));
                }
            }
            today = today.succ_opt().expect("next day");
        }
        posted
    }

    #[test]
    fn grace_running_past_month_end_still_assesses() {
        let rule = flat(5_000);
        let posted = daily_assessments(&lease_due_on(28), &rule, "2026-03-01", "2026-04-30");
        assert_eq!(
            posted,
            vec![
                ("2026-03-06".to_string(), "2026-02".to_string()),
                ("2026-04-03".to_string(), "2026-03".to_string()),
            ]
        );
    }

    #[test]
    fn early_due_day_assesses_once_per_month() {
        let rule = flat(5_000);
        let posted = daily_assessments(&lease_due_on(1), &rule, "2026-03-01", "2026-04-30");
        assert_eq!(
            posted,
            vec![
                ("2026-03-07".to_string(), "2026-03".to_string()),
                ("2026-04-07".to_string(), "2026-04".to_string()),
            ]
        );
    }

    #[test]
    fn previous_period_drops_out_once_grace_ended_last_month() {
        let rule = flat(5_000);
        let periods = candidate_periods(&lease_due_on(10), &rule, date("2026-04-20"));
        let keys: Vec<String> = periods.iter().map(|(period, _, _)| period.key()).collect();
        assert_eq!(keys, vec!["2026-04".to_string()]);
    }

    #[test]
    fn parses_rule_rows() {
        let rule = LateFeeRule::from_row(&json!({
            "enabled": true,
            "grace_period_days": 5,
            "fee_type": "percentage",
            "fee_percent": "5.5",
            "max_fee_cents": 10000
        }))
        .expect("valid rule");
        assert_eq!(rule.fee_type, LateFeeType::Percentage);
        assert_eq!(rule.fee_percent, 5.5);
        assert_eq!(rule.max_fee_cents, Some(10_000));

        assert!(LateFeeRule::from_row(&json!({ "fee_type": "weekly" })).is_none());
    }

    #[test]
    fn formats_cents_as_dollars() {
        assert_eq!(format_cents(7_505), "$75.05");
        assert_eq!(format_cents(-30), "-$0.30");
    }
}
