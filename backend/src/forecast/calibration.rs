//! Split-conformal calibration (CQR)
//!
//! For segments with enough paid history, the learned quantile band is
//! recalibrated on a held-out split so that observed coverage matches the
//! target. The split is strictly by time: the calibration rows are the
//! most recent 40%, so no future payment leaks into training.

use crate::forecast::delay_model::{weighted_quantile, PaidObservation, SegmentFit};
use crate::models::SnapshotConfig;
use chrono::NaiveDate;

/// Minimum rows before a segment is conformally calibrated
pub const MIN_CALIBRATION_ROWS: usize = 30;

/// Train fraction of the time-ordered split
const TRAIN_FRACTION: f64 = 0.6;

/// Outcome of calibrating one segment
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutcome {
    /// Interval-width multiplier from the nonconformity quantile
    pub gamma: f64,

    /// Amount-weighted coverage of the adjusted [P25, P75] band on the
    /// calibration split
    pub coverage: f64,

    /// |coverage - target|
    pub calibration_error: f64,

    /// Boundary date of the time-ordered split
    pub split_date: Option<NaiveDate>,

    /// Adjusted quantiles, monotonicity already repaired
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

/// Calibrate one segment's quantile band
///
/// `observations` must already be sorted by `paid_on` ascending (the
/// training-set extractor guarantees this). Returns `None` when the
/// segment has too little history; the caller keeps the raw fit and
/// records an insufficient-history warning.
pub fn calibrate(
    observations: &[&PaidObservation],
    config: &SnapshotConfig,
) -> Option<CalibrationOutcome> {
    if observations.len() < MIN_CALIBRATION_ROWS {
        return None;
    }

    let n_train = ((observations.len() as f64) * TRAIN_FRACTION).floor() as usize;
    let (train, calib) = observations.split_at(n_train.clamp(1, observations.len() - 1));

    let half_life = config.recency_half_life_days;
    let train_pairs: Vec<(f64, f64)> = train
        .iter()
        .map(|o| (o.delay_days, o.weight(half_life)))
        .collect();

    let q25 = weighted_quantile(&train_pairs, 0.25);
    let q50 = weighted_quantile(&train_pairs, 0.50);
    let q75 = weighted_quantile(&train_pairs, 0.75);
    let q90 = weighted_quantile(&train_pairs, 0.90);
    let iqr = (q75 - q25).max(1e-9);

    // Nonconformity: scaled distance outside the [q25, q75] band,
    // bounded below by zero
    let scores: Vec<(f64, f64)> = calib
        .iter()
        .map(|o| {
            let d = o.delay_days;
            let s = ((q25 - d) / iqr).max((d - q75) / iqr).max(0.0);
            (s, o.amount.abs() as f64)
        })
        .collect();

    // alpha = 1 - target coverage; gamma at quantile (1 - alpha)
    let gamma = weighted_quantile(&scores, config.conformal_target_coverage);

    let mut p25 = q25 - gamma * iqr;
    let mut p50 = q50;
    let mut p75 = q75 + gamma * iqr;
    let mut p90 = q90 + gamma * iqr;

    // Monotonicity repair: running maximum
    p50 = p50.max(p25);
    p75 = p75.max(p50);
    p90 = p90.max(p75);

    let total_amount: f64 = calib.iter().map(|o| o.amount.abs() as f64).sum();
    let covered_amount: f64 = calib
        .iter()
        .filter(|o| o.delay_days >= p25 && o.delay_days <= p75)
        .map(|o| o.amount.abs() as f64)
        .sum();
    let coverage = if total_amount > 0.0 {
        covered_amount / total_amount
    } else {
        0.0
    };

    Some(CalibrationOutcome {
        gamma,
        coverage,
        calibration_error: (coverage - config.conformal_target_coverage).abs(),
        split_date: calib.first().map(|o| o.paid_on),
        p25,
        p50,
        p75,
        p90,
    })
}

/// Apply a calibration outcome onto a raw segment fit
pub fn apply(fit: &mut SegmentFit, outcome: &CalibrationOutcome) {
    fit.p25 = outcome.p25;
    fit.p50 = outcome.p50;
    fit.p75 = outcome.p75;
    fit.p90 = outcome.p90;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(delay: f64, paid_on: NaiveDate) -> PaidObservation {
        PaidObservation {
            delay_days: delay,
            amount: 100_00,
            paid_on,
            age_days: 0.0,
            customer: "c".to_string(),
            country: "DE".to_string(),
            terms: "NET30".to_string(),
        }
    }

    fn series(n: usize) -> Vec<PaidObservation> {
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        (0..n)
            .map(|i| obs((i % 21) as f64, start + chrono::Duration::days(i as i64)))
            .collect()
    }

    #[test]
    fn test_too_little_history_is_not_calibrated() {
        let observations = series(MIN_CALIBRATION_ROWS - 1);
        let refs: Vec<&PaidObservation> = observations.iter().collect();
        assert!(calibrate(&refs, &SnapshotConfig::default()).is_none());
    }

    #[test]
    fn test_calibrated_band_is_monotonic_and_dated() {
        let observations = series(100);
        let refs: Vec<&PaidObservation> = observations.iter().collect();
        let outcome = calibrate(&refs, &SnapshotConfig::default()).unwrap();
        assert!(outcome.p25 <= outcome.p50);
        assert!(outcome.p50 <= outcome.p75);
        assert!(outcome.p75 <= outcome.p90);
        assert!(outcome.split_date.is_some());
        assert!(outcome.gamma >= 0.0);
    }

    #[test]
    fn test_widened_band_reaches_target_coverage() {
        // Uniform delays: the raw IQR covers ~50%; the adjusted band must
        // cover at least the target on the calibration split
        let observations = series(200);
        let refs: Vec<&PaidObservation> = observations.iter().collect();
        let config = SnapshotConfig::default();
        let outcome = calibrate(&refs, &config).unwrap();
        assert!(outcome.coverage >= config.conformal_target_coverage - 0.10);
    }

    #[test]
    fn test_split_is_by_time_not_by_index_shuffle() {
        // The calibration split starts strictly after the last training
        // payment date
        let observations = series(50);
        let refs: Vec<&PaidObservation> = observations.iter().collect();
        let outcome = calibrate(&refs, &SnapshotConfig::default()).unwrap();
        let split = outcome.split_date.unwrap();
        let n_train = (refs.len() as f64 * 0.6).floor() as usize;
        assert!(refs[..n_train].iter().all(|o| o.paid_on < split));
    }
}
