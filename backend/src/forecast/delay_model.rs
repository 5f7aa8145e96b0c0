//! Segment delay model
//!
//! Learns payment-delay distributions from paid history, per segment of a
//! six-level hierarchy. Quantiles are amount- and recency-weighted and the
//! tails are winsorized so one late outlier cannot distort a segment.
//!
//! Training set: paid invoices with both `payment_date` and
//! `expected_due_date`; `delay_days = payment_date - expected_due_date`.

use crate::fx::FxTable;
use crate::models::{Cents, SegmentDelayStats, SegmentLevel, SnapshotConfig};
use crate::repo::Repository;
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// One paid-history observation
#[derive(Debug, Clone)]
pub struct PaidObservation {
    pub delay_days: f64,

    /// Weighting amount (cents): base-converted when the snapshot FX
    /// table resolves the pair, document amount otherwise
    pub amount: Cents,

    pub paid_on: NaiveDate,

    /// Days between payment and the snapshot as-of, for recency decay
    pub age_days: f64,

    pub customer: String,
    pub country: String,
    pub terms: String,
}

impl PaidObservation {
    /// Combined recency x amount weight
    pub fn weight(&self, half_life_days: f64) -> f64 {
        let decay = (2.0_f64).powf(-self.age_days / half_life_days);
        decay * self.amount.abs() as f64
    }
}

/// Extract the training set for a snapshot
///
/// Rows missing either date are excluded. Payments after the as-of are
/// ignored: they cannot have been observed at snapshot time.
pub fn training_set(
    repo: &Repository,
    snapshot_id: &str,
    fx: &FxTable,
    base_currency: &str,
    as_of: NaiveDate,
) -> Vec<PaidObservation> {
    let mut observations = Vec::new();
    for invoice in repo.invoices_for_snapshot(snapshot_id) {
        let (Some(paid), Some(_due)) = (invoice.payment_date(), invoice.expected_due_date())
        else {
            continue;
        };
        if paid > as_of {
            continue;
        }
        let Some(delay) = invoice.delay_days() else {
            continue;
        };
        let amount = fx
            .convert(invoice.amount(), invoice.currency(), base_currency, paid)
            .unwrap_or_else(|_| invoice.amount());
        observations.push(PaidObservation {
            delay_days: delay as f64,
            amount,
            paid_on: paid,
            age_days: (as_of - paid).num_days().max(0) as f64,
            customer: invoice.customer().to_string(),
            country: invoice.country().to_string(),
            terms: invoice.terms_of_payment().to_string(),
        });
    }
    // Deterministic order regardless of repository iteration
    observations.sort_by(|a, b| {
        a.paid_on
            .cmp(&b.paid_on)
            .then_with(|| a.delay_days.total_cmp(&b.delay_days))
            .then_with(|| a.amount.cmp(&b.amount))
            .then_with(|| a.customer.cmp(&b.customer))
    });
    observations
}

/// Group observations by segment key at every hierarchy level
pub fn group_by_segment<'a>(
    observations: &'a [PaidObservation],
) -> BTreeMap<(SegmentLevel, String), Vec<&'a PaidObservation>> {
    let mut groups: BTreeMap<(SegmentLevel, String), Vec<&PaidObservation>> = BTreeMap::new();
    for obs in observations {
        for level in SegmentLevel::HIERARCHY {
            let key = level.key(&obs.customer, &obs.country, &obs.terms);
            groups.entry((level, key)).or_default().push(obs);
        }
    }
    groups
}

/// Unweighted empirical percentile of a sorted slice (nearest-rank)
fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Winsorize delays in place against the segment's own tails.
/// Returns true when any value was clipped.
pub fn winsorize(delays: &mut [f64], lower_pct: f64, upper_pct: f64) -> bool {
    let mut sorted: Vec<f64> = delays.to_vec();
    sorted.sort_by(f64::total_cmp);
    let lo = percentile_sorted(&sorted, lower_pct);
    let hi = percentile_sorted(&sorted, upper_pct);
    let mut clipped = false;
    for d in delays.iter_mut() {
        if *d < lo {
            *d = lo;
            clipped = true;
        } else if *d > hi {
            *d = hi;
            clipped = true;
        }
    }
    clipped
}

/// Weighted quantile: smallest delay whose cumulative weight fraction
/// reaches `q`. Pairs are (delay, weight) with weight > 0.
pub fn weighted_quantile(pairs: &[(f64, f64)], q: f64) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<(f64, f64)> = pairs.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    let total: f64 = sorted.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return sorted[sorted.len() / 2].0;
    }
    let mut cumulative = 0.0;
    for (delay, weight) in &sorted {
        cumulative += weight;
        if cumulative / total >= q {
            return *delay;
        }
    }
    sorted[sorted.len() - 1].0
}

/// Learned quantiles and moments for one segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFit {
    pub sample_size: usize,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub mean: f64,
    pub std: f64,
    pub winsorized: bool,
}

/// Fit one segment: winsorize, then weighted quantiles and moments
pub fn fit_segment(observations: &[&PaidObservation], config: &SnapshotConfig) -> SegmentFit {
    let mut delays: Vec<f64> = observations.iter().map(|o| o.delay_days).collect();
    let winsorized = winsorize(
        &mut delays,
        config.winsorize_lower_pct,
        config.winsorize_upper_pct,
    );

    let pairs: Vec<(f64, f64)> = delays
        .iter()
        .zip(observations.iter())
        .map(|(d, o)| (*d, o.weight(config.recency_half_life_days)))
        .collect();

    let total_weight: f64 = pairs.iter().map(|(_, w)| w).sum();
    let mean = if total_weight > 0.0 {
        pairs.iter().map(|(d, w)| d * w).sum::<f64>() / total_weight
    } else {
        0.0
    };
    let variance = if total_weight > 0.0 {
        pairs
            .iter()
            .map(|(d, w)| w * (d - mean).powi(2))
            .sum::<f64>()
            / total_weight
    } else {
        0.0
    };

    SegmentFit {
        sample_size: observations.len(),
        p25: weighted_quantile(&pairs, 0.25),
        p50: weighted_quantile(&pairs, 0.50),
        p75: weighted_quantile(&pairs, 0.75),
        p90: weighted_quantile(&pairs, 0.90),
        mean,
        std: variance.sqrt(),
        winsorized,
    }
}

/// Industry default used when no hierarchy level has enough history
pub const FALLBACK_SEGMENT_LABEL: &str = "Global (Fallback)";

/// Fallback quantiles (days): P25=-7, P50=0, P75=14, P90=30
pub fn fallback_stats(snapshot_id: &str, config: &SnapshotConfig) -> SegmentDelayStats {
    SegmentDelayStats {
        snapshot_id: snapshot_id.to_string(),
        segment_type: SegmentLevel::Global,
        segment_key: FALLBACK_SEGMENT_LABEL.to_string(),
        sample_size: 0,
        p25: -7.0,
        p50: 0.0,
        p75: 14.0,
        p90: 30.0,
        mean: 0.0,
        std: 0.0,
        recency_half_life_days: config.recency_half_life_days,
        winsorized: false,
    }
}

/// Walk the hierarchy for an open invoice's dimensions; the first level
/// with enough history wins
pub fn resolve_segment<'a>(
    repo: &'a Repository,
    snapshot_id: &str,
    config: &SnapshotConfig,
    customer: &str,
    country: &str,
    terms: &str,
) -> Option<&'a SegmentDelayStats> {
    for level in SegmentLevel::HIERARCHY {
        let key = level.key(customer, country, terms);
        if let Some(stats) = repo.segment_stats(snapshot_id, level, &key) {
            if stats.sample_size >= config.min_segment_sample_size {
                return Some(stats);
            }
        }
    }
    None
}
