//! Snapshot state machine, lock gates and lock-time digest
//!
//! `Draft -> ReadyForReview -> Locked`, with a CFO override allowed from
//! either pre-lock state. Gates are amount-weighted, never row-count
//! weighted: a thousand clean ten-euro invoices do not outvote one
//! unexplained million.
//!
//! At lock time a SHA-256 digest over the snapshot's owned rows is stored
//! on the snapshot; [`verify_digest`] recomputes it, giving tamper
//! evidence on top of the repository's write guard.

use crate::fx::FxTable;
use crate::models::{
    Cents, LockType, SnapshotStatus, TransitionError,
};
use crate::repo::{RepoError, Repository};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Minimum acknowledgment length for a CFO override
pub const MIN_ACKNOWLEDGMENT_LEN: usize = 20;

/// Advisory calibration gate: |coverage - 0.5| above this is flagged
pub const CALIBRATION_ADVISORY_LIMIT: f64 = 0.15;

/// Locking errors
#[derive(Debug, Error, PartialEq)]
pub enum LockError {
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// One or more blocking gates failed and no override was given
    #[error("lock gates failed: {}", reasons.join("; "))]
    GateFailed { reasons: Vec<String> },

    /// Override acknowledgment shorter than the required minimum
    #[error("override acknowledgment too short: {len} chars, need {MIN_ACKNOWLEDGMENT_LEN}")]
    AckTooShort { len: usize },
}

/// One failed blocking gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GateFailure {
    MissingFxExposure { pct: f64, threshold: f64 },
    UnexplainedCash { pct: f64, threshold: f64 },
}

impl GateFailure {
    fn describe(&self) -> String {
        match self {
            GateFailure::MissingFxExposure { pct, threshold } => {
                format!("missing FX exposure {pct:.2}% exceeds {threshold:.2}%")
            }
            GateFailure::UnexplainedCash { pct, threshold } => {
                format!("unexplained cash {pct:.2}% exceeds {threshold:.2}%")
            }
        }
    }
}

/// Gate check outcome; calibration is advisory and never blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateCheckResult {
    pub missing_fx_exposure_pct: f64,
    pub unexplained_cash_pct: f64,

    /// |amount-weighted P25-P75 coverage - target|, when calibrated
    pub calibration_error: Option<f64>,
    pub calibration_advisory: bool,

    pub passed: bool,
    pub failures: Vec<GateFailure>,
}

/// Outcome of a successful lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockResult {
    pub snapshot_id: String,
    pub lock_type: LockType,
    pub gate_check: GateCheckResult,
    pub digest: String,
}

/// Run the amount-weighted lock gates for a snapshot
pub fn gate_check(repo: &Repository, snapshot_id: &str) -> Result<GateCheckResult, RepoError> {
    let snapshot = repo.snapshot(snapshot_id)?;
    let entity = repo.entity(snapshot.entity_id())?;
    let config = snapshot.config();
    let fx = FxTable::load(repo, snapshot_id);
    let base = entity.base_currency();

    // Gate 1: missing FX exposure, amount-weighted over all invoices
    let mut total_invoice_amount: Cents = 0;
    let mut missing_fx_amount: Cents = 0;
    for invoice in repo.invoices_for_snapshot(snapshot_id) {
        total_invoice_amount += invoice.amount().abs();
        let probe_date = invoice
            .predicted_payment_date()
            .or(invoice.expected_due_date())
            .unwrap_or(snapshot.as_of());
        if !fx.can_convert(invoice.currency(), base, probe_date) {
            missing_fx_amount += invoice.amount().abs();
        }
    }
    let missing_fx_pct = percentage(missing_fx_amount, total_invoice_amount);

    // Gate 2: unexplained cash, amount-weighted over non-wash movements
    let mut total_movement: Cents = 0;
    let mut unmatched_movement: Cents = 0;
    for txn in repo.bank_transactions_for_entity(entity.id()) {
        if txn.is_wash() {
            continue;
        }
        total_movement += txn.abs_amount();
        if !txn.is_reconciled() {
            unmatched_movement += txn.abs_amount();
        }
    }
    let unexplained_pct = percentage(unmatched_movement, total_movement);

    // Advisory: mean calibration coverage error across calibrated segments
    let calibration_rows = repo.calibration_stats_for_snapshot(snapshot_id);
    let calibration_error = if calibration_rows.is_empty() {
        None
    } else {
        let target = config.conformal_target_coverage;
        let mean_coverage = calibration_rows
            .iter()
            .map(|c| c.coverage_p25_p75_amount_weighted)
            .sum::<f64>()
            / calibration_rows.len() as f64;
        Some((mean_coverage - target).abs())
    };

    let mut failures = Vec::new();
    if missing_fx_pct > config.missing_fx_threshold_pct {
        failures.push(GateFailure::MissingFxExposure {
            pct: missing_fx_pct,
            threshold: config.missing_fx_threshold_pct,
        });
    }
    if unexplained_pct > config.unexplained_cash_threshold_pct {
        failures.push(GateFailure::UnexplainedCash {
            pct: unexplained_pct,
            threshold: config.unexplained_cash_threshold_pct,
        });
    }

    Ok(GateCheckResult {
        missing_fx_exposure_pct: missing_fx_pct,
        unexplained_cash_pct: unexplained_pct,
        calibration_advisory: calibration_error
            .is_some_and(|e| e > CALIBRATION_ADVISORY_LIMIT),
        calibration_error,
        passed: failures.is_empty(),
        failures,
    })
}

fn percentage(part: Cents, total: Cents) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64) / (total as f64) * 100.0
    }
}

/// Move a draft snapshot to ReadyForReview
///
/// The transition applies only when every blocking gate passes; a failed
/// gate check is returned, not raised, and leaves the snapshot in Draft.
pub fn mark_ready_for_review(
    repo: &mut Repository,
    snapshot_id: &str,
) -> Result<GateCheckResult, LockError> {
    let snapshot = repo.snapshot(snapshot_id)?;
    snapshot.check_transition(SnapshotStatus::ReadyForReview)?;

    let result = gate_check(repo, snapshot_id)?;
    if result.passed {
        repo.modify_snapshot(snapshot_id, |s| {
            // transition validated above; the snapshot cannot have moved
            // since (single-writer per snapshot via advisory lock)
            let _ = s.mark_ready();
        })?;
    }
    Ok(result)
}

/// Lock a snapshot
///
/// Without an override, every blocking gate must pass. With
/// `cfo_override`, gates are bypassed if the acknowledgment is at least
/// 20 characters after trimming; the acknowledgment is stored on the
/// snapshot and audited by the engine.
pub fn lock_snapshot(
    repo: &mut Repository,
    snapshot_id: &str,
    user: &str,
    cfo_override: bool,
    acknowledgment: Option<&str>,
) -> Result<LockResult, LockError> {
    let snapshot = repo.snapshot(snapshot_id)?;
    snapshot.check_transition(SnapshotStatus::Locked)?;

    let gate_result = gate_check(repo, snapshot_id)?;

    let (lock_type, stored_ack) = if cfo_override {
        let ack = acknowledgment.unwrap_or("").trim().to_string();
        if ack.len() < MIN_ACKNOWLEDGMENT_LEN {
            return Err(LockError::AckTooShort { len: ack.len() });
        }
        (LockType::CfoOverride, Some(ack))
    } else {
        if !gate_result.passed {
            return Err(LockError::GateFailed {
                reasons: gate_result.failures.iter().map(GateFailure::describe).collect(),
            });
        }
        // without an override the only path to Locked is through review
        if snapshot.status() == SnapshotStatus::Draft {
            return Err(TransitionError {
                from: SnapshotStatus::Draft,
                to: SnapshotStatus::Locked,
            }
            .into());
        }
        (LockType::Standard, None)
    };

    let digest = compute_digest(repo, snapshot_id)?;
    let mut transition: Result<(), TransitionError> = Ok(());
    repo.modify_snapshot(snapshot_id, |s| {
        transition = s.lock(lock_type, user.to_string(), stored_ack.clone(), digest.clone());
    })?;
    transition?;

    Ok(LockResult {
        snapshot_id: snapshot_id.to_string(),
        lock_type,
        gate_check: gate_result,
        digest,
    })
}

/// SHA-256 digest over the canonical JSON of a snapshot's owned rows
///
/// Row order is fixed (sorted by canonical id / key) so the digest is a
/// pure function of content, not of insertion order.
pub fn compute_digest(repo: &Repository, snapshot_id: &str) -> Result<String, RepoError> {
    let mut invoices = repo.invoices_for_snapshot(snapshot_id);
    invoices.sort_by(|a, b| a.canonical_id().cmp(b.canonical_id()));
    let mut bills = repo.bills_for_snapshot(snapshot_id);
    bills.sort_by(|a, b| a.canonical_id().cmp(b.canonical_id()));
    let mut rates = repo.fx_rates_for_snapshot(snapshot_id);
    rates.sort_by(|a, b| {
        (&a.from_currency, &a.to_currency, a.effective_week_start)
            .cmp(&(&b.from_currency, &b.to_currency, b.effective_week_start))
    });
    let mut stats = repo.segment_stats_for_snapshot(snapshot_id);
    stats.sort_by(|a, b| {
        (a.segment_type, &a.segment_key).cmp(&(b.segment_type, &b.segment_key))
    });
    let mut allocations = repo.allocations_for_snapshot(snapshot_id);
    allocations.sort_by(|a, b| a.id().cmp(b.id()));

    let mut hasher = Sha256::new();
    let mut feed = |value: serde_json::Result<String>| -> Result<(), RepoError> {
        let json = value.map_err(|e| RepoError::Serialization(e.to_string()))?;
        hasher.update(json.as_bytes());
        hasher.update([0x1e]);
        Ok(())
    };
    for invoice in invoices {
        feed(serde_json::to_string(invoice))?;
    }
    for bill in bills {
        feed(serde_json::to_string(bill))?;
    }
    for rate in rates {
        feed(serde_json::to_string(rate))?;
    }
    for stat in stats {
        feed(serde_json::to_string(stat))?;
    }
    for allocation in allocations {
        feed(serde_json::to_string(allocation))?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Recompute and compare the lock-time digest
pub fn verify_digest(repo: &Repository, snapshot_id: &str) -> Result<bool, RepoError> {
    let snapshot = repo.snapshot(snapshot_id)?;
    match snapshot.digest() {
        Some(stored) => Ok(stored == compute_digest(repo, snapshot_id)?),
        None => Ok(false),
    }
}
