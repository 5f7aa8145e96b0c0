//! AR forecast allocator
//!
//! Spreads one open invoice over up to three grid weeks through a fixed
//! mixture: 20% at week(P25), 50% at week(P50), 30% at week(P75). Every
//! contribution carries its invoice id, weight and the predicted date it
//! used, so each grid cell is fully explainable and sums exactly.
//!
//! Items that cannot be forecast (missing FX, missing due date) are not
//! dropped: they come back as Unknown outcomes for the aggregator to
//! route into the Unknown bucket.

use crate::core::calendar::{grid_week, week_index};
use crate::fx::FxTable;
use crate::models::invoice::ConfidenceDates;
use crate::models::{Cents, Invoice, UnknownReason};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Fixed weekly mixture weights over (P25, P50, P75)
pub const WEEKLY_MIX: [f64; 3] = [0.20, 0.50, 0.30];

/// One explainable cell contribution from an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArContribution {
    pub invoice_id: String,
    pub canonical_id: String,

    /// Signed week index relative to the anchor (in-grid contributions
    /// are 0..13; beyond-horizon entries keep their real index)
    pub week_index: i64,

    /// Contribution in entity base currency (cents)
    pub amount: Cents,

    /// Mixture weight this leg carried
    pub weight: f64,

    pub predicted_date_used: NaiveDate,
}

/// Allocation outcome for one invoice
#[derive(Debug, Clone, PartialEq)]
pub enum ArOutcome {
    /// Forecastable: in-grid legs plus any legs past the horizon
    Allocated {
        contributions: Vec<ArContribution>,
        beyond_horizon: Vec<ArContribution>,
    },

    /// Not forecastable; routed to the Unknown bucket with a reason
    Unknown(UnknownReason),
}

/// Allocate one open invoice across grid weeks
///
/// `open_amount` is the unallocated remainder in document currency. The
/// legs use largest-remainder splitting so they always sum to the
/// converted amount exactly.
pub fn allocate(
    invoice: &Invoice,
    open_amount: Cents,
    fx: &FxTable,
    base_currency: &str,
    anchor: NaiveDate,
) -> ArOutcome {
    let Some(due) = invoice.expected_due_date() else {
        return ArOutcome::Unknown(UnknownReason::MissingDueDate);
    };

    // Legs: the calibrated mixture when a prediction exists, the due date
    // as a single degenerate leg otherwise
    let legs: Vec<(f64, NaiveDate)> = match invoice.confidence() {
        Some(ConfidenceDates { p25, p50, p75, .. }) => vec![
            (WEEKLY_MIX[0], *p25),
            (WEEKLY_MIX[1], *p50),
            (WEEKLY_MIX[2], *p75),
        ],
        None => vec![(1.0, due)],
    };

    // FX is resolved once, at the central predicted date
    let fx_date = invoice
        .predicted_payment_date()
        .unwrap_or(due);
    let base_amount = match fx.convert(open_amount, invoice.currency(), base_currency, fx_date) {
        Ok(amount) => amount,
        Err(_) => return ArOutcome::Unknown(UnknownReason::MissingFx),
    };

    // Largest-remainder split: every leg but the last rounds, the last
    // absorbs the residual so the legs sum exactly
    let mut amounts: Vec<Cents> = legs
        .iter()
        .take(legs.len() - 1)
        .map(|(w, _)| ((base_amount as f64) * w).round() as Cents)
        .collect();
    let consumed: Cents = amounts.iter().sum();
    amounts.push(base_amount - consumed);

    let mut contributions = Vec::new();
    let mut beyond_horizon = Vec::new();
    for ((weight, date), amount) in legs.iter().zip(amounts) {
        let contribution = ArContribution {
            invoice_id: invoice.id().to_string(),
            canonical_id: invoice.canonical_id().to_string(),
            week_index: 0, // set below
            amount,
            weight: *weight,
            predicted_date_used: *date,
        };
        match grid_week(anchor, *date) {
            Some(idx) => contributions.push(ArContribution {
                week_index: idx,
                ..contribution
            }),
            None => beyond_horizon.push(ArContribution {
                week_index: week_index(anchor, *date),
                ..contribution
            }),
        }
    }

    ArOutcome::Allocated {
        contributions,
        beyond_horizon,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, Snapshot, SnapshotConfig, WeeklyFxRate};
    use crate::repo::Repository;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn invoice_with_prediction(currency: &str) -> Invoice {
        let mut inv = Invoice::new(
            "S1".to_string(),
            "C1".to_string(),
            "E1".to_string(),
            "invoice".to_string(),
            "INV-1".to_string(),
            "ACME".to_string(),
            "DE".to_string(),
            "NET30".to_string(),
            100_000,
            currency.to_string(),
            d(2024, 2, 1),
        )
        .with_due_date(d(2024, 3, 14));
        inv.set_prediction(
            d(2024, 3, 21),
            ConfidenceDates {
                p25: d(2024, 3, 14),
                p50: d(2024, 3, 21),
                p75: d(2024, 3, 28),
                p90: d(2024, 4, 10),
            },
            "customer:acme".to_string(),
        );
        inv
    }

    fn empty_fx() -> FxTable {
        let mut repo = Repository::new();
        repo.insert_entity(Entity::new("E1".to_string(), "EUR".to_string(), 0))
            .unwrap();
        let snapshot = Snapshot::new("E1".to_string(), d(2024, 3, 11), 0, SnapshotConfig::default());
        repo.insert_snapshot(snapshot).unwrap();
        FxTable::load(&repo, "S1")
    }

    #[test]
    fn test_mixture_sums_exactly() {
        let invoice = invoice_with_prediction("EUR");
        let anchor = d(2024, 3, 11);
        let ArOutcome::Allocated { contributions, .. } =
            allocate(&invoice, 99_999, &empty_fx(), "EUR", anchor)
        else {
            panic!("expected allocation");
        };
        assert_eq!(contributions.len(), 3);
        let total: Cents = contributions.iter().map(|c| c.amount).sum();
        assert_eq!(total, 99_999);
        let weights: Vec<f64> = contributions.iter().map(|c| c.weight).collect();
        assert_eq!(weights, vec![0.20, 0.50, 0.30]);
    }

    #[test]
    fn test_missing_fx_routes_to_unknown() {
        let invoice = invoice_with_prediction("USD");
        let outcome = allocate(&invoice, 100_000, &empty_fx(), "EUR", d(2024, 3, 11));
        assert_eq!(outcome, ArOutcome::Unknown(UnknownReason::MissingFx));
    }

    #[test]
    fn test_missing_due_date_routes_to_unknown() {
        let invoice = Invoice::new(
            "S1".to_string(),
            "C1".to_string(),
            "E1".to_string(),
            "invoice".to_string(),
            "INV-1".to_string(),
            "ACME".to_string(),
            "DE".to_string(),
            "NET30".to_string(),
            100_000,
            "EUR".to_string(),
            d(2024, 2, 1),
        );
        let outcome = allocate(&invoice, 100_000, &empty_fx(), "EUR", d(2024, 3, 11));
        assert_eq!(outcome, ArOutcome::Unknown(UnknownReason::MissingDueDate));
    }

    #[test]
    fn test_overdue_prediction_clamps_to_week_zero() {
        let mut invoice = invoice_with_prediction("EUR");
        invoice.set_prediction(
            d(2024, 2, 20),
            ConfidenceDates {
                p25: d(2024, 2, 13),
                p50: d(2024, 2, 20),
                p75: d(2024, 2, 27),
                p90: d(2024, 3, 5),
            },
            "customer:acme".to_string(),
        );
        let ArOutcome::Allocated { contributions, .. } =
            allocate(&invoice, 100_000, &empty_fx(), "EUR", d(2024, 3, 11))
        else {
            panic!("expected allocation");
        };
        assert!(contributions.iter().all(|c| c.week_index == 0));
    }

    #[test]
    fn test_far_future_legs_fall_out_of_grid() {
        let mut invoice = invoice_with_prediction("EUR");
        invoice.set_prediction(
            d(2024, 9, 2),
            ConfidenceDates {
                p25: d(2024, 8, 26),
                p50: d(2024, 9, 2),
                p75: d(2024, 9, 9),
                p90: d(2024, 9, 30),
            },
            "customer:acme".to_string(),
        );
        let ArOutcome::Allocated {
            contributions,
            beyond_horizon,
        } = allocate(&invoice, 100_000, &empty_fx(), "EUR", d(2024, 3, 11))
        else {
            panic!("expected allocation");
        };
        assert!(contributions.is_empty());
        assert_eq!(beyond_horizon.len(), 3);
        let total: Cents = beyond_horizon.iter().map(|c| c.amount).sum();
        assert_eq!(total, 100_000);
    }
}
