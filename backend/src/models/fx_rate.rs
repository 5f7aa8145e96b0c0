//! Snapshot-locked weekly FX rates
//!
//! Rates are written against a snapshot and frozen with it. Lookup picks
//! the most recent `effective_week_start` at or before the effective date.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rate validation error
#[derive(Debug, Error, PartialEq)]
pub enum FxRateError {
    #[error("FX rate must be positive, got {rate} for {from}->{to}")]
    InvalidRate {
        from: String,
        to: String,
        rate: f64,
    },
}

/// One weekly-banded FX rate row
///
/// Uniqueness per `(snapshot_id, from, to, effective_week_start)` is
/// enforced by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyFxRate {
    pub snapshot_id: String,
    pub from_currency: String,
    pub to_currency: String,
    pub effective_week_start: NaiveDate,

    /// Multiplicative rate: amount_from * rate = amount_to. Rates are f64;
    /// money stays i64 cents and is rounded once per conversion.
    pub rate: f64,
}

impl WeeklyFxRate {
    /// Create a validated rate row
    pub fn new(
        snapshot_id: String,
        from_currency: String,
        to_currency: String,
        effective_week_start: NaiveDate,
        rate: f64,
    ) -> Result<Self, FxRateError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(FxRateError::InvalidRate {
                from: from_currency,
                to: to_currency,
                rate,
            });
        }
        Ok(Self {
            snapshot_id,
            from_currency,
            to_currency,
            effective_week_start,
            rate,
        })
    }
}
