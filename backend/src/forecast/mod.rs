//! Probabilistic AR forecast
//!
//! The forecast pipeline:
//! 1. Extract paid history (training set)
//! 2. Fit winsorized, recency- and amount-weighted delay quantiles per
//!    segment at every hierarchy level
//! 3. Conformally calibrate segments with enough history (split-CQR)
//! 4. Detect regime shifts per segment (reported, never auto-acted on)
//! 5. Write segment and calibration statistics into the snapshot
//! 6. Predict payment dates for every open invoice via hierarchical
//!    segment fallback
//!
//! Insufficient history is a warning, not an error: the pipeline always
//! completes and falls back to the industry default distribution.

pub mod allocator;
pub mod calibration;
pub mod delay_model;
pub mod regime;

pub use allocator::{allocate, ArContribution, ArOutcome};

use crate::fx::FxTable;
use crate::models::invoice::ConfidenceDates;
use crate::models::{
    CalibrationStats, RegimeShiftSeverity, SegmentDelayStats, SegmentLevel, SnapshotConfig,
};
use crate::progress::{CancellationToken, ProgressEvent, ProgressSink};
use crate::repo::{RepoError, Repository};
use chrono::Duration;
use delay_model::{
    fallback_stats, fit_segment, group_by_segment, resolve_segment, training_set,
    FALLBACK_SEGMENT_LABEL,
};
use thiserror::Error;

/// Forecast pipeline errors
#[derive(Debug, Error, PartialEq)]
pub enum ForecastError {
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("forecast cancelled")]
    Cancelled,
}

/// Structured warning attached to the calibration report
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ForecastWarning {
    pub segment_key: String,
    pub kind: WarningKind,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Too few paid rows to calibrate; raw quantiles are used
    InsufficientHistory { rows: usize },

    /// Recent delays diverge from long-run behavior
    RegimeShift { severity: RegimeShiftSeverity },
}

/// Calibration report returned by the forecast pipeline
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ForecastReport {
    pub trained_segments: usize,
    pub calibrated_segments: usize,
    pub predicted_invoices: usize,

    /// Open invoices that fell through every hierarchy level
    pub fallback_invoices: usize,

    pub calibration: Vec<CalibrationStats>,
    pub warnings: Vec<ForecastWarning>,
}

/// Composite segment identifier used in predictions and calibration rows
fn segment_label(level: SegmentLevel, key: &str) -> String {
    format!("{level}:{key}")
}

/// Run the forecast pipeline for a snapshot
///
/// Trains, calibrates and predicts inside one repository transaction; a
/// cancellation or error leaves the snapshot untouched.
pub fn run_forecast(
    repo: &mut Repository,
    snapshot_id: &str,
    cancel: &CancellationToken,
    sink: &mut dyn ProgressSink,
) -> Result<ForecastReport, ForecastError> {
    let snapshot = repo.snapshot(snapshot_id)?;
    let as_of = snapshot.as_of();
    let config = snapshot.config().clone();
    let entity_id = snapshot.entity_id().to_string();
    let base_currency = repo.entity(&entity_id)?.base_currency().to_string();
    let snapshot_id = snapshot_id.to_string();

    repo.with_transaction(|repo| {
        let fx = FxTable::load(repo, &snapshot_id);
        let mut report = ForecastReport::default();

        // Stage 1: training set
        let observations = training_set(repo, &snapshot_id, &fx, &base_currency, as_of);
        sink.report(ProgressEvent {
            pipeline: "forecast".to_string(),
            stage: "training_set".to_string(),
            processed: observations.len(),
            total: Some(observations.len()),
        });
        if cancel.is_cancelled() {
            return Err(ForecastError::Cancelled);
        }

        // Stage 2: fit + calibrate every segment group
        let groups = group_by_segment(&observations);
        let total_groups = groups.len();
        for (i, ((level, key), group)) in groups.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ForecastError::Cancelled);
            }

            let mut fit = fit_segment(&group, &config);
            let label = segment_label(level, &key);

            let severity = regime::detect(&group, &config);
            if severity > RegimeShiftSeverity::None {
                report.warnings.push(ForecastWarning {
                    segment_key: label.clone(),
                    kind: WarningKind::RegimeShift { severity },
                });
            }

            match calibration::calibrate(&group, &config) {
                Some(outcome) => {
                    calibration::apply(&mut fit, &outcome);
                    let stats = CalibrationStats {
                        snapshot_id: snapshot_id.clone(),
                        segment_key: label.clone(),
                        coverage_p25_p75_amount_weighted: outcome.coverage,
                        calibration_error: outcome.calibration_error,
                        regime_shift_severity: severity,
                        cv_fold_split_date: outcome.split_date,
                        gamma: outcome.gamma,
                    };
                    repo.upsert_calibration_stats(stats.clone())?;
                    report.calibration.push(stats);
                    report.calibrated_segments += 1;
                }
                None if fit.sample_size >= config.min_segment_sample_size => {
                    report.warnings.push(ForecastWarning {
                        segment_key: label.clone(),
                        kind: WarningKind::InsufficientHistory {
                            rows: fit.sample_size,
                        },
                    });
                }
                None => {}
            }

            let mut stats = SegmentDelayStats {
                snapshot_id: snapshot_id.clone(),
                segment_type: level,
                segment_key: key,
                sample_size: fit.sample_size,
                p25: fit.p25,
                p50: fit.p50,
                p75: fit.p75,
                p90: fit.p90,
                mean: fit.mean,
                std: fit.std,
                recency_half_life_days: config.recency_half_life_days,
                winsorized: fit.winsorized,
            };
            stats.enforce_monotonic();
            repo.upsert_segment_stats(stats)?;
            report.trained_segments += 1;

            if (i + 1) % 100 == 0 || i + 1 == total_groups {
                sink.report(ProgressEvent {
                    pipeline: "forecast".to_string(),
                    stage: "fit_segments".to_string(),
                    processed: i + 1,
                    total: Some(total_groups),
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(ForecastError::Cancelled);
        }

        // Stage 3: predict open invoices through the hierarchy
        predict_open_invoices(repo, &snapshot_id, &config, &mut report)?;
        sink.report(ProgressEvent {
            pipeline: "forecast".to_string(),
            stage: "predict".to_string(),
            processed: report.predicted_invoices,
            total: Some(report.predicted_invoices),
        });

        Ok(report)
    })
}

fn predict_open_invoices(
    repo: &mut Repository,
    snapshot_id: &str,
    config: &SnapshotConfig,
    report: &mut ForecastReport,
) -> Result<(), ForecastError> {
    let open: Vec<String> = repo
        .invoices_for_snapshot(snapshot_id)
        .iter()
        .filter(|i| i.is_open())
        .map(|i| i.id().to_string())
        .collect();

    for invoice_id in open {
        let invoice = repo.invoice(&invoice_id)?;
        let Some(due) = invoice.expected_due_date() else {
            // No due date: nothing to anchor a prediction to; the
            // aggregator routes this row to the Unknown bucket
            repo.update_invoice(&invoice_id, |inv| inv.clear_prediction())?;
            continue;
        };

        let resolved = resolve_segment(
            repo,
            snapshot_id,
            config,
            invoice.customer(),
            invoice.country(),
            invoice.terms_of_payment(),
        );

        let (stats, label) = match resolved {
            Some(stats) => (
                stats.clone(),
                segment_label(stats.segment_type, &stats.segment_key),
            ),
            None => {
                report.fallback_invoices += 1;
                (
                    fallback_stats(snapshot_id, config),
                    FALLBACK_SEGMENT_LABEL.to_string(),
                )
            }
        };

        let offset = |days: f64| due + Duration::days(days.round() as i64);
        let confidence = ConfidenceDates {
            p25: offset(stats.p25),
            p50: offset(stats.p50),
            p75: offset(stats.p75),
            p90: offset(stats.p90),
        };
        let predicted = confidence.p50;
        repo.update_invoice(&invoice_id, |inv| {
            inv.set_prediction(predicted, confidence, label.clone());
        })?;
        report.predicted_invoices += 1;
    }
    Ok(())
}
