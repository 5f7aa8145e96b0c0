//! Truth labeling and the trust report
//!
//! Aggregation assigns every evaluated invoice and bill exactly one truth
//! label (see [`crate::models::TruthLabel`]); this module turns those
//! labels, the Unknown bucket and the reconciliation state into the
//! headline trust metrics:
//!
//! - **Cash Explained %** - amount-weighted share of bank movements
//!   backed by reconciled evidence. The single headline metric.
//! - **Unknown exposure** - what the forecast refused to guess about,
//!   with reason codes.
//! - **Lock eligibility** - the same gate check the state machine runs.

use crate::locking::{gate_check, GateCheckResult};
use crate::models::{CalibrationStats, Cents, TruthLabel, UnknownReason};
use crate::repo::{RepoError, Repository};
use crate::workspace::WorkspaceGrid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unknown exposure grouped by reason
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnknownBucket {
    /// Total absolute exposure (document-currency cents summed as-is)
    pub total: Cents,

    pub by_reason: BTreeMap<UnknownReason, Cents>,

    /// Share of unknown exposure against all evaluated amounts, percent
    pub exposure_pct: f64,

    /// Advisory KPI target from the snapshot config, percent
    pub kpi_target_pct: f64,
}

/// The per-snapshot trust report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustReport {
    pub snapshot_id: String,

    /// Amount-weighted share of non-wash bank movements that are
    /// reconciled, percent
    pub cash_explained_pct: f64,

    pub unknown: UnknownBucket,

    pub missing_fx_exposure_pct: f64,

    /// Per-segment conformal calibration results
    pub calibration: Vec<CalibrationStats>,

    /// Amount per truth label across the whole grid
    pub truth_totals: BTreeMap<TruthLabel, Cents>,

    pub lock_eligibility: GateCheckResult,
}

/// Cash Explained %: reconciled movement over all non-wash movement
pub fn cash_explained_pct(repo: &Repository, entity_id: &str) -> Result<f64, RepoError> {
    let mut total: Cents = 0;
    let mut explained: Cents = 0;
    for txn in repo.bank_transactions_for_entity(entity_id) {
        if txn.is_wash() {
            continue;
        }
        total += txn.abs_amount();
        if txn.is_reconciled() {
            explained += txn.abs_amount();
        }
    }
    if total == 0 {
        return Ok(100.0);
    }
    Ok((explained as f64) / (total as f64) * 100.0)
}

/// Build the trust report from an already-aggregated grid
pub fn trust_report(
    repo: &Repository,
    snapshot_id: &str,
    grid: &WorkspaceGrid,
) -> Result<TrustReport, RepoError> {
    let snapshot = repo.snapshot(snapshot_id)?;
    let entity_id = snapshot.entity_id().to_string();
    let config = snapshot.config();

    let mut by_reason: BTreeMap<UnknownReason, Cents> = BTreeMap::new();
    for item in &grid.unknown_items {
        *by_reason.entry(item.reason).or_insert(0) += item.amount.abs();
    }
    let unknown_total = grid.unknown_total();

    let mut truth_totals: BTreeMap<TruthLabel, Cents> = BTreeMap::new();
    for row in &grid.rows {
        for (label, amount) in &row.truth_mix {
            *truth_totals.entry(*label).or_insert(0) += amount;
        }
    }
    let evaluated_total: Cents = truth_totals.values().sum();
    let exposure_pct = if evaluated_total == 0 {
        0.0
    } else {
        (unknown_total as f64) / (evaluated_total as f64) * 100.0
    };

    let lock_eligibility = gate_check(repo, snapshot_id)?;

    Ok(TrustReport {
        snapshot_id: snapshot_id.to_string(),
        cash_explained_pct: cash_explained_pct(repo, &entity_id)?,
        unknown: UnknownBucket {
            total: unknown_total,
            by_reason,
            exposure_pct,
            kpi_target_pct: config.unknown_bucket_kpi_target_pct,
        },
        missing_fx_exposure_pct: lock_eligibility.missing_fx_exposure_pct,
        calibration: repo
            .calibration_stats_for_snapshot(snapshot_id)
            .into_iter()
            .cloned()
            .collect(),
        truth_totals,
        lock_eligibility,
    })
}
