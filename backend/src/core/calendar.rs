//! Calendar math for the forecasting horizon
//!
//! The forecast grid operates in ISO weeks anchored at the snapshot's as-of
//! date. This module provides deterministic week indexing, business-day
//! arithmetic and payment-run day resolution.
//!
//! # Critical Invariants
//!
//! 1. Week boundaries are ISO (Monday-start) regardless of locale
//! 2. Week indexing is a pure function of (anchor, date)
//! 3. Payment-run days use 0 = Monday .. 6 = Sunday

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Number of weekly rows in the forecasting grid.
pub const HORIZON_WEEKS: i64 = 13;

/// Monday of the ISO week containing `date`.
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use treasury_core_rs::core::calendar::week_start;
///
/// let wed = NaiveDate::from_ymd_opt(2024, 3, 13).unwrap();
/// let mon = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();
/// assert_eq!(week_start(wed), mon);
/// ```
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Anchor week (week 0) for a snapshot taken at `as_of`.
pub fn anchor_week(as_of: NaiveDate) -> NaiveDate {
    week_start(as_of)
}

/// Signed week index of `date` relative to `anchor` (a Monday).
///
/// Dates inside the anchor week map to 0, the following week to 1, and
/// dates before the anchor to negative indexes.
pub fn week_index(anchor: NaiveDate, date: NaiveDate) -> i64 {
    (week_start(date) - anchor).num_days() / 7
}

/// Week index clamped into the grid: past weeks fold into week 0, weeks
/// beyond the horizon return `None` (the caller routes them to the
/// overflow bucket rather than a grid row).
pub fn grid_week(anchor: NaiveDate, date: NaiveDate) -> Option<i64> {
    let idx = week_index(anchor, date);
    if idx >= HORIZON_WEEKS {
        None
    } else {
        Some(idx.max(0))
    }
}

/// Monday of grid week `index` for the given anchor.
pub fn week_of_index(anchor: NaiveDate, index: i64) -> NaiveDate {
    anchor + Duration::weeks(index)
}

/// Add `n` business days (Mon-Fri) to `date`.
///
/// Used for SLA breach derivation on unmatched bank transactions.
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use treasury_core_rs::core::calendar::add_business_days;
///
/// // Friday + 1 business day = Monday
/// let fri = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
/// let mon = NaiveDate::from_ymd_opt(2024, 3, 18).unwrap();
/// assert_eq!(add_business_days(fri, 1), mon);
/// ```
pub fn add_business_days(date: NaiveDate, n: u32) -> NaiveDate {
    let mut current = date;
    let mut remaining = n;
    while remaining > 0 {
        current += Duration::days(1);
        if !matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
            remaining -= 1;
        }
    }
    current
}

/// Next occurrence of `run_day` (0 = Monday .. 6 = Sunday) on or after `date`.
///
/// This is the entity payment-run rule: bills exit on the entity's run day
/// on or after their due date.
pub fn next_run_day(date: NaiveDate, run_day: u8) -> NaiveDate {
    let target = u32::from(run_day.min(6));
    let current = date.weekday().num_days_from_monday();
    let ahead = (target + 7 - current) % 7;
    date + Duration::days(i64::from(ahead))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_week_start_is_idempotent() {
        let monday = week_start(d(2024, 3, 13));
        assert_eq!(week_start(monday), monday);
    }

    #[test]
    fn test_week_index_spans_year_boundary() {
        let anchor = anchor_week(d(2023, 12, 28));
        assert_eq!(week_index(anchor, d(2023, 12, 28)), 0);
        assert_eq!(week_index(anchor, d(2024, 1, 2)), 1);
    }

    #[test]
    fn test_grid_week_clamps_past_and_drops_beyond_horizon() {
        let anchor = anchor_week(d(2024, 3, 11));
        assert_eq!(grid_week(anchor, d(2024, 2, 1)), Some(0));
        assert_eq!(grid_week(anchor, d(2024, 3, 20)), Some(1));
        assert_eq!(grid_week(anchor, d(2024, 9, 1)), None);
    }

    #[test]
    fn test_next_run_day_same_day() {
        // 2024-03-13 is a Wednesday (index 2)
        assert_eq!(next_run_day(d(2024, 3, 13), 2), d(2024, 3, 13));
        assert_eq!(next_run_day(d(2024, 3, 13), 1), d(2024, 3, 19));
    }

    #[test]
    fn test_add_business_days_skips_weekend() {
        assert_eq!(add_business_days(d(2024, 3, 14), 5), d(2024, 3, 21));
        // Thursday + 2 crosses the weekend
        assert_eq!(add_business_days(d(2024, 3, 14), 2), d(2024, 3, 18));
    }
}
