use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::services::ledger::BillingPeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationKind {
    /// Occupancy from the given date through the end of the month.
    MoveIn,
    /// Occupancy from the 1st through the given date.
    MoveOut,
}

/// Occupied days and the month length, both inclusive of `date`.
pub fn prorated_days(date: NaiveDate, kind: ProrationKind) -> (u32, u32) {
    let days_in_month = BillingPeriod::containing(date).days();
    let occupied = match kind {
        ProrationKind::MoveIn => days_in_month - date.day() + 1,
        ProrationKind::MoveOut => date.day(),
    };
    (occupied, days_in_month)
}

/// `rent × occupied / days_in_month`, rounded half-up to the cent.
pub fn calculate_prorated_rent(monthly_rent_cents: i64, date: NaiveDate, kind: ProrationKind) -> i64 {
    if monthly_rent_cents <= 0 {
        return 0;
    }
    let (occupied, days_in_month) = prorated_days(date, kind);
    prorate(monthly_rent_cents, occupied, days_in_month)
}

/// Rent owed for the month containing `end` when occupancy runs from
/// `start` (or the 1st, if the lease began earlier) through `end`.
pub fn final_month_rent(monthly_rent_cents: i64, start: NaiveDate, end: NaiveDate) -> i64 {
    if monthly_rent_cents <= 0 || end < start {
        return 0;
    }
    let period = BillingPeriod::containing(end);
    let from = start.max(period.first_day());
    let occupied = end.day() - from.day() + 1;
    prorate(monthly_rent_cents, occupied, period.days())
}

fn prorate(monthly_rent_cents: i64, occupied: u32, days_in_month: u32) -> i64 {
    if occupied >= days_in_month {
        return monthly_rent_cents;
    }
    let numerator = i128::from(monthly_rent_cents) * i128::from(occupied);
    let denominator = i128::from(days_in_month);
    ((numerator * 2 + denominator) / (denominator * 2)) as i64
}

#[derive(Debug, Clone, Serialize)]
pub struct ProrationQuote {
    pub kind: ProrationKind,
    pub date: NaiveDate,
    pub occupied_days: u32,
    pub days_in_month: u32,
    pub monthly_rent_cents: i64,
    pub amount_cents: i64,
}

pub fn quote(monthly_rent_cents: i64, date: NaiveDate, kind: ProrationKind) -> ProrationQuote {
    let (occupied_days, days_in_month) = prorated_days(date, kind);
    ProrationQuote {
        kind,
        date,
        occupied_days,
        days_in_month,
        monthly_rent_cents,
        amount_cents: calculate_prorated_rent(monthly_rent_cents, date, kind),
    }
}

/// A move-in on the 1st or a move-out on the last day is a full month, not proration.
pub fn needs_proration(date: NaiveDate, kind: ProrationKind) -> bool {
    let (occupied, days_in_month) = prorated_days(date, kind);
    occupied < days_in_month
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{
        calculate_prorated_rent, final_month_rent, needs_proration, prorated_days, quote,
        ProrationKind,
    };

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn move_in_counts_remaining_days_inclusive() {
        assert_eq!(prorated_days(date("2026-04-16"), ProrationKind::MoveIn), (15, 30));
        // 1500.00 * 15 / 30
        assert_eq!(
            calculate_prorated_rent(150_000, date("2026-04-16"), ProrationKind::MoveIn),
            75_000
        );
    }

    #[test]
    fn move_out_counts_elapsed_days_inclusive() {
        assert_eq!(prorated_days(date("2026-01-10"), ProrationKind::MoveOut), (10, 31));
        // 1000.00 * 10 / 31 = 322.580... → 322.58
        assert_eq!(
            calculate_prorated_rent(100_000, date("2026-01-10"), ProrationKind::MoveOut),
            32_258
        );
    }

    #[test]
    fn rounds_half_up_to_the_cent() {
        // 1 cent * 15 / 30 = 0.5 → 1
        assert_eq!(
            calculate_prorated_rent(1, date("2026-04-16"), ProrationKind::MoveIn),
            1
        );
        // 100 * 1 / 28 = 3.57 → 4
        assert_eq!(
            calculate_prorated_rent(100, date("2026-02-28"), ProrationKind::MoveIn),
            4
        );
    }

    #[test]
    fn full_months_return_exact_rent() {
        assert_eq!(
            calculate_prorated_rent(123_457, date("2026-03-01"), ProrationKind::MoveIn),
            123_457
        );
        assert_eq!(
            calculate_prorated_rent(123_457, date("2026-03-31"), ProrationKind::MoveOut),
            123_457
        );
        assert!(!needs_proration(date("2026-03-01"), ProrationKind::MoveIn));
        assert!(needs_proration(date("2026-03-02"), ProrationKind::MoveIn));
    }

    #[test]
    fn leap_february_uses_29_days() {
        let quoted = quote(290_000, date("2028-02-15"), ProrationKind::MoveIn);
        assert_eq!(quoted.days_in_month, 29);
        assert_eq!(quoted.occupied_days, 15);
        assert_eq!(quoted.amount_cents, 150_000);
    }

    #[test]
    fn non_positive_rent_prorates_to_zero() {
        assert_eq!(
            calculate_prorated_rent(0, date("2026-04-16"), ProrationKind::MoveIn),
            0
        );
        assert_eq!(
            calculate_prorated_rent(-500, date("2026-04-16"), ProrationKind::MoveOut),
            0
        );
    }

    #[test]
    fn final_month_matches_move_out_for_older_leases() {
        assert_eq!(
            final_month_rent(100_000, date("2025-06-01"), date("2026-01-10")),
            calculate_prorated_rent(100_000, date("2026-01-10"), ProrationKind::MoveOut)
        );
        assert_eq!(
            final_month_rent(100_000, date("2025-06-01"), date("2026-01-31")),
            100_000
        );
    }

    #[test]
    fn final_month_within_the_start_month_counts_the_span() {
        // 10th through 19th of April: 10 of 30 days
        assert_eq!(
            final_month_rent(90_000, date("2026-04-10"), date("2026-04-19")),
            30_000
        );
        assert_eq!(
            final_month_rent(90_000, date("2026-04-10"), date("2026-04-09")),
            0
        );
    }
}
