//! Regime shift detection
//!
//! Compares the recent delay distribution of a segment against its
//! long-run distribution. A material shift is reported to the trust
//! report; it never triggers retraining on its own — that call is human.

use crate::forecast::delay_model::PaidObservation;
use crate::models::{RegimeShiftSeverity, SnapshotConfig};

/// Detect a regime shift for one segment's observations
///
/// Two indicators: the amount-weighted mean shift measured in long-run
/// standard deviations, and the two-sample Kolmogorov-Smirnov statistic
/// between recent and long-run delays. Severity escalates as either
/// indicator crosses its configured cut-off.
pub fn detect(observations: &[&PaidObservation], config: &SnapshotConfig) -> RegimeShiftSeverity {
    let recent: Vec<&&PaidObservation> = observations
        .iter()
        .filter(|o| o.age_days <= config.regime_recent_window_days)
        .collect();

    if recent.len() < 5 || observations.len() < 10 {
        return RegimeShiftSeverity::None;
    }

    let weighted_mean = |rows: &[&&PaidObservation]| -> f64 {
        let total: f64 = rows.iter().map(|o| o.amount.abs() as f64).sum();
        if total <= 0.0 {
            return 0.0;
        }
        rows.iter()
            .map(|o| o.delay_days * o.amount.abs() as f64)
            .sum::<f64>()
            / total
    };

    let all: Vec<&&PaidObservation> = observations.iter().collect();
    let long_mean = weighted_mean(&all);
    let recent_mean = weighted_mean(&recent);

    let total: f64 = all.iter().map(|o| o.amount.abs() as f64).sum();
    let long_var = all
        .iter()
        .map(|o| o.amount.abs() as f64 * (o.delay_days - long_mean).powi(2))
        .sum::<f64>()
        / total.max(1e-9);
    let long_std = long_var.sqrt().max(1e-9);

    let mean_shift_sigmas = (recent_mean - long_mean).abs() / long_std;

    let recent_delays: Vec<f64> = recent.iter().map(|o| o.delay_days).collect();
    let all_delays: Vec<f64> = all.iter().map(|o| o.delay_days).collect();
    let ks = ks_statistic(&recent_delays, &all_delays);

    severity(
        mean_shift_sigmas,
        ks,
        config.regime_mean_shift_sigma,
        config.regime_ks_threshold,
    )
}

fn severity(
    mean_shift: f64,
    ks: f64,
    sigma_cutoff: f64,
    ks_cutoff: f64,
) -> RegimeShiftSeverity {
    if mean_shift > 2.0 * sigma_cutoff || ks > 2.0 * ks_cutoff {
        RegimeShiftSeverity::Severe
    } else if mean_shift > sigma_cutoff || ks > ks_cutoff {
        RegimeShiftSeverity::Moderate
    } else if mean_shift > 0.75 * sigma_cutoff || ks > 0.75 * ks_cutoff {
        RegimeShiftSeverity::Mild
    } else {
        RegimeShiftSeverity::None
    }
}

/// Two-sample Kolmogorov-Smirnov statistic: max distance between the
/// empirical CDFs
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut sa = a.to_vec();
    let mut sb = b.to_vec();
    sa.sort_by(f64::total_cmp);
    sb.sort_by(f64::total_cmp);

    let mut max_dist: f64 = 0.0;
    let (mut i, mut j) = (0usize, 0usize);
    while i < sa.len() && j < sb.len() {
        let x = sa[i].min(sb[j]);
        while i < sa.len() && sa[i] <= x {
            i += 1;
        }
        while j < sb.len() && sb[j] <= x {
            j += 1;
        }
        let fa = i as f64 / sa.len() as f64;
        let fb = j as f64 / sb.len() as f64;
        max_dist = max_dist.max((fa - fb).abs());
    }
    max_dist
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn obs(delay: f64, age: f64) -> PaidObservation {
        PaidObservation {
            delay_days: delay,
            amount: 100_00,
            paid_on: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            age_days: age,
            customer: "c".to_string(),
            country: "DE".to_string(),
            terms: "NET30".to_string(),
        }
    }

    #[test]
    fn test_ks_identical_samples_is_zero() {
        let xs: Vec<f64> = (0..50).map(f64::from).collect();
        assert!(ks_statistic(&xs, &xs) < 1e-12);
    }

    #[test]
    fn test_ks_disjoint_samples_is_one() {
        let a: Vec<f64> = (0..50).map(f64::from).collect();
        let b: Vec<f64> = (100..150).map(f64::from).collect();
        assert!((ks_statistic(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_stable_history_reports_none() {
        let observations: Vec<PaidObservation> = (0..60)
            .map(|i| obs((i % 10) as f64, f64::from(i) * 2.0))
            .collect();
        let refs: Vec<&PaidObservation> = observations.iter().collect();
        assert_eq!(
            detect(&refs, &SnapshotConfig::default()),
            RegimeShiftSeverity::None
        );
    }

    #[test]
    fn test_blown_out_recent_delays_report_shift() {
        // long-run delays around 5, recent delays around 60
        let mut observations: Vec<PaidObservation> = (0..60)
            .map(|i| obs(5.0 + (i % 3) as f64, 60.0 + f64::from(i)))
            .collect();
        observations.extend((0..10).map(|i| obs(60.0 + f64::from(i), 10.0)));
        let refs: Vec<&PaidObservation> = observations.iter().collect();
        let severity = detect(&refs, &SnapshotConfig::default());
        assert!(severity >= RegimeShiftSeverity::Moderate);
    }
}
