use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::{PgPool, Row};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{list_rows, map_db_error},
    schemas::{value_i64, value_str, value_str_opt},
};

/// A calendar month used as the unit of billing (`YYYY-MM`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (year, month) = raw.trim().split_once('-')?;
        let period = Self {
            year: year.parse().ok()?,
            month: month.parse().ok()?,
        };
        NaiveDate::from_ymd_opt(period.year, period.month, 1).map(|_| period)
    }

    pub fn key(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next().first_day().pred_opt().unwrap_or(NaiveDate::MAX)
    }

    pub fn days(&self) -> u32 {
        self.last_day().day()
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Day `day` of this month, clamped to the month length (a due day of 31 lands on Feb 28/29).
    pub fn day_clamped(&self, day: u32) -> NaiveDate {
        let day = day.clamp(1, self.days());
        NaiveDate::from_ymd_opt(self.year, self.month, day).unwrap_or_else(|| self.last_day())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeType {
    Rent,
    LateFee,
    Proration,
    Deposit,
    Utility,
    Credit,
    Other,
}

impl ChargeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rent => "rent",
            Self::LateFee => "late_fee",
            Self::Proration => "proration",
            Self::Deposit => "deposit",
            Self::Utility => "utility",
            Self::Credit => "credit",
            Self::Other => "other",
        }
    }
}

/// Aggregates feeding a ledger balance, all in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub charges_cents: i64,
    pub payments_cents: i64,
    pub pending_cents: i64,
}

impl LedgerTotals {
    pub fn balance_cents(&self) -> i64 {
        compute_balance(self)
    }

    pub fn has_pending_payment(&self) -> bool {
        self.pending_cents > 0
    }
}

/// Charges minus succeeded payments. Pending payments never reduce the balance;
/// a negative result is a credit on the account.
pub fn compute_balance(totals: &LedgerTotals) -> i64 {
    totals.charges_cents.saturating_sub(totals.payments_cents)
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantBalance {
    pub tenant_id: String,
    pub unit_id: String,
    pub charges_cents: i64,
    pub payments_cents: i64,
    pub pending_cents: i64,
    pub balance_cents: i64,
}

const TENANT_UNIT_BALANCE_SQL: &str = "
    WITH scoped AS (
        SELECT id FROM leases
        WHERE organization_id = $1::uuid AND tenant_id = $2 AND unit_id = $3::uuid
    )
    SELECT
        (SELECT COALESCE(SUM(c.amount_cents), 0) FROM charges c
          WHERE c.lease_id IN (SELECT id FROM scoped) AND c.status <> 'void')::bigint AS charges_cents,
        (SELECT COALESCE(SUM(p.amount_cents - p.refunded_cents) FILTER (WHERE p.status = 'succeeded'), 0) FROM payments p
          WHERE p.lease_id IN (SELECT id FROM scoped))::bigint AS payments_cents,
        (SELECT COALESCE(SUM(p.amount_cents) FILTER (WHERE p.status IN ('pending', 'processing')), 0) FROM payments p
          WHERE p.lease_id IN (SELECT id FROM scoped))::bigint AS pending_cents";

const LEASE_BALANCE_SQL: &str = "
    SELECT
        (SELECT COALESCE(SUM(c.amount_cents), 0) FROM charges c
          WHERE c.lease_id = $1::uuid AND c.status <> 'void')::bigint AS charges_cents,
        (SELECT COALESCE(SUM(p.amount_cents - p.refunded_cents) FILTER (WHERE p.status = 'succeeded'), 0) FROM payments p
          WHERE p.lease_id = $1::uuid)::bigint AS payments_cents,
        (SELECT COALESCE(SUM(p.amount_cents) FILTER (WHERE p.status IN ('pending', 'processing')), 0) FROM payments p
          WHERE p.lease_id = $1::uuid)::bigint AS pending_cents";

/// Same totals, counting only charges due on or before `$2`. Charges posted
/// ahead of their due date do not make an earlier period look unpaid.
const LEASE_DUE_BY_SQL: &str = "
    SELECT
        (SELECT COALESCE(SUM(c.amount_cents), 0) FROM charges c
          WHERE c.lease_id = $1::uuid AND c.status <> 'void' AND c.due_date <= $2)::bigint AS charges_cents,
        (SELECT COALESCE(SUM(p.amount_cents - p.refunded_cents) FILTER (WHERE p.status = 'succeeded'), 0) FROM payments p
          WHERE p.lease_id = $1::uuid)::bigint AS payments_cents,
        (SELECT COALESCE(SUM(p.amount_cents) FILTER (WHERE p.status IN ('pending', 'processing')), 0) FROM payments p
          WHERE p.lease_id = $1::uuid)::bigint AS pending_cents";

pub async fn get_tenant_balance(
    pool: &PgPool,
    org_id: &str,
    tenant_id: &str,
    unit_id: &str,
) -> AppResult<TenantBalance> {
    let row = sqlx::query(TENANT_UNIT_BALANCE_SQL)
        .bind(org_id)
        .bind(tenant_id)
        .bind(unit_id)
        .fetch_one(pool)
        .await
        .map_err(map_db_error)?;
    let totals = read_totals(&row);

    Ok(TenantBalance {
        tenant_id: tenant_id.to_string(),
        unit_id: unit_id.to_string(),
        charges_cents: totals.charges_cents,
        payments_cents: totals.payments_cents,
        pending_cents: totals.pending_cents,
        balance_cents: totals.balance_cents(),
    })
}

pub async fn get_lease_totals(pool: &PgPool, lease_id: &str) -> AppResult<LedgerTotals> {
    let row = sqlx::query(LEASE_BALANCE_SQL)
        .bind(lease_id)
        .fetch_one(pool)
        .await
        .map_err(map_db_error)?;
    Ok(read_totals(&row))
}

pub async fn get_lease_totals_due_by(
    pool: &PgPool,
    lease_id: &str,
    due_by: NaiveDate,
) -> AppResult<LedgerTotals> {
    let row = sqlx::query(LEASE_DUE_BY_SQL)
        .bind(lease_id)
        .bind(due_by)
        .fetch_one(pool)
        .await
        .map_err(map_db_error)?;
    Ok(read_totals(&row))
}

fn read_totals(row: &sqlx::postgres::PgRow) -> LedgerTotals {
    LedgerTotals {
        charges_cents: row.try_get::<i64, _>("charges_cents").unwrap_or(0),
        payments_cents: row.try_get::<i64, _>("payments_cents").unwrap_or(0),
        pending_cents: row.try_get::<i64, _>("pending_cents").unwrap_or(0),
    }
}

#[derive(Debug, Clone)]
pub struct NewCharge {
    pub organization_id: String,
    pub lease_id: String,
    pub unit_id: String,
    pub charge_type: ChargeType,
    pub amount_cents: i64,
    pub due_date: NaiveDate,
    pub period: Option<String>,
    pub description: String,
    pub idempotency_key: Option<String>,
    pub created_by_user_id: Option<String>,
}

/// Insert a charge. With an idempotency key, a repeat post returns `None`
/// instead of creating a second row.
pub async fn post_charge(pool: &PgPool, charge: &NewCharge) -> AppResult<Option<Value>> {
    if charge.amount_cents == 0 {
        return Err(AppError::BadRequest(
            "Charge amount must be non-zero.".to_string(),
        ));
    }
    if charge.charge_type == ChargeType::Credit && charge.amount_cents > 0 {
        return Err(AppError::BadRequest(
            "Credits must be posted as negative amounts.".to_string(),
        ));
    }

    let row = sqlx::query(
        "INSERT INTO charges (
            organization_id, lease_id, unit_id, charge_type, amount_cents,
            due_date, period, description, idempotency_key, created_by_user_id
         )
         VALUES ($1::uuid, $2::uuid, $3::uuid, $4, $5, $6, $7, $8, $9, $10)
         ON CONFLICT (organization_id, idempotency_key) DO NOTHING
         RETURNING row_to_json(charges.*) AS row",
    )
    .bind(&charge.organization_id)
    .bind(&charge.lease_id)
    .bind(&charge.unit_id)
    .bind(charge.charge_type.as_str())
    .bind(charge.amount_cents)
    .bind(charge.due_date)
    .bind(charge.period.as_deref())
    .bind(&charge.description)
    .bind(charge.idempotency_key.as_deref())
    .bind(charge.created_by_user_id.as_deref())
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    let created = row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten());
    if created.is_none() {
        tracing::debug!(
            idempotency_key = charge.idempotency_key.as_deref().unwrap_or_default(),
            "Charge already posted, skipping"
        );
    }
    Ok(created)
}

pub async fn void_charge(pool: &PgPool, charge_id: &str, user_id: &str) -> AppResult<Value> {
    let row = sqlx::query(
        "UPDATE charges
         SET status = 'void', voided_at = now(), voided_by_user_id = $2
         WHERE id = $1::uuid AND status <> 'void'
         RETURNING row_to_json(charges.*) AS row",
    )
    .bind(charge_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Conflict("Charge is already void or does not exist.".to_string()))
}

pub fn move_out_idempotency_key(lease_id: &str, end_date: NaiveDate, revision: i64) -> String {
    format!("move_out:{lease_id}:{end_date}:{revision}")
}

/// Void every live move-out settlement on a lease so a rescheduled end date
/// is settled from scratch. Returns the voided rows and the number of
/// settlements the lease has ever had, which numbers the next key.
pub async fn void_move_out_settlements(
    pool: &PgPool,
    lease_id: &str,
    user_id: &str,
) -> AppResult<(Vec<Value>, i64)> {
    let prefix = format!("move_out:{lease_id}:%");
    let voided = sqlx::query(
        "UPDATE charges
         SET status = 'void', voided_at = now(), voided_by_user_id = $3
         WHERE lease_id = $1::uuid AND idempotency_key LIKE $2 AND status <> 'void'
         RETURNING row_to_json(charges.*) AS row",
    )
    .bind(lease_id)
    .bind(&prefix)
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?
    .iter()
    .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
    .collect();

    let revision = sqlx::query(
        "SELECT COUNT(*)::bigint AS total FROM charges
         WHERE lease_id = $1::uuid AND idempotency_key LIKE $2",
    )
    .bind(lease_id)
    .bind(&prefix)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?
    .try_get::<i64, _>("total")
    .unwrap_or(0);

    Ok((voided, revision))
}

/// Net rent billed to a lease for one period: rent, proration and the
/// credits that adjust them.
pub async fn period_rent_billed(pool: &PgPool, lease_id: &str, period: BillingPeriod) -> AppResult<i64> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(amount_cents), 0)::bigint AS billed
         FROM charges
         WHERE lease_id = $1::uuid AND period = $2 AND status <> 'void'
           AND charge_type IN ('rent', 'proration', 'credit')",
    )
    .bind(lease_id)
    .bind(period.key())
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("billed").unwrap_or(0))
}

/// Offline payment (cash, check, money order) entered by staff; settled immediately.
pub async fn record_manual_payment(
    pool: &PgPool,
    lease: &LeaseTerms,
    amount_cents: i64,
    method: &str,
    reference: Option<&str>,
    user_id: &str,
) -> AppResult<Value> {
    if amount_cents <= 0 {
        return Err(AppError::BadRequest(
            "Payment amount must be positive.".to_string(),
        ));
    }

    let row = sqlx::query(
        "INSERT INTO payments (
            organization_id, lease_id, unit_id, tenant_id, amount_cents, fee_cents,
            status, status_rank, method, source, reference, recorded_by_user_id, paid_at
         )
         VALUES ($1::uuid, $2::uuid, $3::uuid, $4, $5, 0, 'succeeded', $6, $7, 'manual', $8, $9, now())
         RETURNING row_to_json(payments.*) AS row",
    )
    .bind(&lease.organization_id)
    .bind(&lease.id)
    .bind(&lease.unit_id)
    .bind(lease.tenant_id.as_deref())
    .bind(amount_cents)
    .bind(crate::services::stripe_webhooks::PaymentStatus::Succeeded.rank())
    .bind(method)
    .bind(reference)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Internal("Could not record payment.".to_string()))
}

/// Billing terms of a lease, parsed from its row.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseTerms {
    pub id: String,
    pub organization_id: String,
    pub property_id: String,
    pub unit_id: String,
    pub tenant_id: Option<String>,
    pub monthly_rent_cents: i64,
    pub rent_due_day: u32,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub status: String,
}

impl LeaseTerms {
    pub fn from_row(row: &Value) -> Option<Self> {
        let id = value_str(row, "id");
        let organization_id = value_str(row, "organization_id");
        let unit_id = value_str(row, "unit_id");
        if id.is_empty() || organization_id.is_empty() || unit_id.is_empty() {
            return None;
        }
        let start_date = parse_date(&value_str(row, "start_date"))?;

        Some(Self {
            id,
            organization_id,
            property_id: value_str(row, "property_id"),
            unit_id,
            tenant_id: value_str_opt(row, "tenant_id"),
            monthly_rent_cents: value_i64(row, "monthly_rent_cents").unwrap_or(0),
            rent_due_day: value_i64(row, "rent_due_day")
                .and_then(|day| u32::try_from(day).ok())
                .unwrap_or(1),
            start_date,
            end_date: value_str_opt(row, "end_date").and_then(|raw| parse_date(&raw)),
            status: value_str(row, "status"),
        })
    }

    pub fn due_date_for(&self, period: BillingPeriod) -> NaiveDate {
        period.day_clamped(self.rent_due_day)
    }
}

/// Full-month rent owed for `period`, or `None` when the lease does not cover
/// the whole month. Partial move-in/move-out months are billed as proration.
pub fn rent_charge_for_period(lease: &LeaseTerms, period: BillingPeriod) -> Option<(NaiveDate, i64)> {
    if lease.status != "active" || lease.monthly_rent_cents <= 0 {
        return None;
    }
    if lease.start_date > period.first_day() {
        return None;
    }
    if lease.end_date.is_some_and(|end| end < period.last_day()) {
        return None;
    }
    Some((lease.due_date_for(period), lease.monthly_rent_cents))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RentPostingResult {
    pub posted: u32,
    pub skipped: u32,
    pub errors: u32,
}

pub async fn post_monthly_rent_charges(
    pool: &PgPool,
    org_id: Option<&str>,
    period: BillingPeriod,
) -> RentPostingResult {
    let mut result = RentPostingResult::default();
    let leases = match list_active_leases(pool, org_id).await {
        Ok(rows) => rows,
        Err(error) => {
            tracing::warn!(error = %error, "Failed to load active leases for rent posting");
            result.errors += 1;
            return result;
        }
    };

    for lease in leases.iter().filter_map(LeaseTerms::from_row) {
        let Some((due_date, amount_cents)) = rent_charge_for_period(&lease, period) else {
            result.skipped += 1;
            continue;
        };

        let charge = NewCharge {
            organization_id: lease.organization_id.clone(),
            lease_id: lease.id.clone(),
            unit_id: lease.unit_id.clone(),
            charge_type: ChargeType::Rent,
            amount_cents,
            due_date,
            period: Some(period.key()),
            description: format!("Rent for {}", period.key()),
            idempotency_key: Some(format!("rent:{}:{}", lease.id, period.key())),
            created_by_user_id: None,
        };

        match post_charge(pool, &charge).await {
            Ok(Some(_)) => result.posted += 1,
            Ok(None) => result.skipped += 1,
            Err(error) => {
                tracing::warn!(lease_id = %lease.id, error = %error, "Failed to post rent charge");
                result.errors += 1;
            }
        }
    }

    tracing::info!(
        period = %period.key(),
        posted = result.posted,
        skipped = result.skipped,
        errors = result.errors,
        "Rent posting completed"
    );
    result
}

/// Pages through every active lease, optionally scoped to one organization.
pub async fn list_active_leases(pool: &PgPool, org_id: Option<&str>) -> AppResult<Vec<Value>> {
    const PAGE: i64 = 500;
    let mut filters = Map::new();
    filters.insert("status".to_string(), json!("active"));
    if let Some(org_id) = org_id {
        filters.insert("organization_id".to_string(), json!(org_id));
    }

    let mut leases = Vec::new();
    let mut offset = 0;
    loop {
        let page = list_rows(pool, "leases", Some(&filters), PAGE, offset, "created_at", true).await?;
        let fetched = page.len() as i64;
        leases.extend(page);
        if fetched < PAGE {
            break;
        }
        offset += PAGE;
    }
    Ok(leases)
}

/// Flip leases whose end date has passed to `ended` and stop their autopay.
pub async fn close_ended_leases(pool: &PgPool, today: NaiveDate) -> AppResult<u64> {
    let closed = sqlx::query(
        "UPDATE leases SET status = 'ended', updated_at = now()
         WHERE status = 'active' AND end_date IS NOT NULL AND end_date < $1",
    )
    .bind(today)
    .execute(pool)
    .await
    .map_err(map_db_error)?
    .rows_affected();

    sqlx::query(
        "UPDATE autopay_enrollments e SET status = 'canceled', canceled_at = now()
         FROM leases l
         WHERE e.lease_id = l.id AND e.status = 'active' AND l.status = 'ended'",
    )
    .execute(pool)
    .await
    .map_err(map_db_error)?;

    if closed > 0 {
        tracing::info!(closed, "Closed ended leases");
    }
    Ok(closed)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date_part = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::{compute_balance, rent_charge_for_period, BillingPeriod, LeaseTerms, LedgerTotals};

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    fn lease(start: &str, end: Option<&str>) -> LeaseTerms {
        LeaseTerms::from_row(&json!({
            "id": "lease-1",
            "organization_id": "org-1",
            "property_id": "prop-1",
            "unit_id": "unit-1",
            "tenant_id": "user-1",
            "monthly_rent_cents": 150000,
            "rent_due_day": 31,
            "start_date": start,
            "end_date": end,
            "status": "active"
        }))
        .expect("valid lease row")
    }

    #[test]
    fn balance_ignores_pending_payments() {
        let totals = LedgerTotals {
            charges_cents: 165_000,
            payments_cents: 150_000,
            pending_cents: 15_000,
        };
        assert_eq!(compute_balance(&totals), 15_000);
        assert!(totals.has_pending_payment());
    }

    #[test]
    fn overpayment_is_a_credit() {
        let totals = LedgerTotals {
            charges_cents: 100_000,
            payments_cents: 120_000,
            pending_cents: 0,
        };
        assert_eq!(totals.balance_cents(), -20_000);
        assert!(!totals.has_pending_payment());
    }

    #[test]
    fn billing_period_math() {
        let feb = BillingPeriod::parse("2028-02").expect("valid period");
        assert_eq!(feb.days(), 29);
        assert_eq!(feb.day_clamped(31), date("2028-02-29"));
        assert_eq!(feb.key(), "2028-02");
        assert_eq!(BillingPeriod::parse("2026-12").map(|p| p.next().key()).as_deref(), Some("2027-01"));
        assert!(BillingPeriod::parse("2026-13").is_none());
        assert!(BillingPeriod::parse("garbage").is_none());
    }

    #[test]
    fn rent_is_skipped_for_partial_months() {
        let period = BillingPeriod::parse("2026-03").expect("valid period");

        let full = lease("2026-01-01", None);
        assert_eq!(
            rent_charge_for_period(&full, period),
            Some((date("2026-03-31"), 150000))
        );

        let mid_month_start = lease("2026-03-10", None);
        assert_eq!(rent_charge_for_period(&mid_month_start, period), None);

        let mid_month_end = lease("2025-06-01", Some("2026-03-15"));
        assert_eq!(rent_charge_for_period(&mid_month_end, period), None);

        let ends_on_last_day = lease("2025-06-01", Some("2026-03-31"));
        assert!(rent_charge_for_period(&ends_on_last_day, period).is_some());
    }

    #[test]
    fn lease_row_requires_ids_and_start() {
        assert!(LeaseTerms::from_row(&json!({ "id": "x" })).is_none());
        let parsed = LeaseTerms::from_row(&json!({
            "id": "l", "organization_id": "o", "unit_id": "u",
            "start_date": "2026-01-01T00:00:00Z"
        }))
        .expect("parses timestamp-shaped dates");
        assert_eq!(parsed.rent_due_day, 1);
        assert_eq!(parsed.tenant_id, None);
    }
}
