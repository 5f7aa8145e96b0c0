//! Learned segment delay distributions and their calibration
//!
//! The delay model learns per-segment payment-delay quantiles from paid
//! history. Segments form a hierarchy; prediction walks it from most to
//! least specific and records which level won.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hierarchy level of a delay segment, most specific first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentLevel {
    CustomerCountryTerms,
    CustomerCountry,
    Customer,
    CountryTerms,
    Country,
    Global,
}

impl SegmentLevel {
    /// Fallback order, most specific first
    pub const HIERARCHY: [SegmentLevel; 6] = [
        SegmentLevel::CustomerCountryTerms,
        SegmentLevel::CustomerCountry,
        SegmentLevel::Customer,
        SegmentLevel::CountryTerms,
        SegmentLevel::Country,
        SegmentLevel::Global,
    ];

    /// Build the segment key for this level from invoice dimensions
    pub fn key(self, customer: &str, country: &str, terms: &str) -> String {
        match self {
            SegmentLevel::CustomerCountryTerms => format!("{customer}|{country}|{terms}"),
            SegmentLevel::CustomerCountry => format!("{customer}|{country}"),
            SegmentLevel::Customer => customer.to_string(),
            SegmentLevel::CountryTerms => format!("{country}|{terms}"),
            SegmentLevel::Country => country.to_string(),
            SegmentLevel::Global => "*".to_string(),
        }
    }
}

impl fmt::Display for SegmentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegmentLevel::CustomerCountryTerms => "customer+country+terms",
            SegmentLevel::CustomerCountry => "customer+country",
            SegmentLevel::Customer => "customer",
            SegmentLevel::CountryTerms => "country+terms",
            SegmentLevel::Country => "country",
            SegmentLevel::Global => "global",
        };
        f.write_str(s)
    }
}

/// Learned delay distribution for one segment of one snapshot
///
/// Quantiles are payment delays in days relative to the expected due date
/// (negative = early). Amount- and recency-weighted; winsorized when the
/// flag is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDelayStats {
    pub snapshot_id: String,
    pub segment_type: SegmentLevel,
    pub segment_key: String,
    pub sample_size: usize,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub mean: f64,
    pub std: f64,
    pub recency_half_life_days: f64,
    pub winsorized: bool,
}

impl SegmentDelayStats {
    /// Quantiles in non-decreasing order
    pub fn is_monotonic(&self) -> bool {
        self.p25 <= self.p50 && self.p50 <= self.p75 && self.p75 <= self.p90
    }

    /// Repair any quantile inversion by taking the running maximum
    pub fn enforce_monotonic(&mut self) {
        self.p50 = self.p50.max(self.p25);
        self.p75 = self.p75.max(self.p50);
        self.p90 = self.p90.max(self.p75);
    }
}

/// Regime shift severity for a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeShiftSeverity {
    None,
    Mild,
    Moderate,
    Severe,
}

/// Conformal calibration outcome for one segment of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStats {
    pub snapshot_id: String,
    pub segment_key: String,

    /// Amount-weighted share of calibration amounts inside [P25, P75]
    pub coverage_p25_p75_amount_weighted: f64,

    /// |coverage - target|; < 0.10 is considered well calibrated
    pub calibration_error: f64,

    pub regime_shift_severity: RegimeShiftSeverity,

    /// Boundary of the time-ordered train/calibration split
    pub cv_fold_split_date: Option<chrono::NaiveDate>,

    /// Interval-width multiplier derived from nonconformity scores
    pub gamma: f64,
}
