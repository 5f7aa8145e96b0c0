//! Snapshot model
//!
//! A snapshot is one point-in-time forecasting run. It exclusively owns its
//! invoices, vendor bills, FX rates, segment statistics and calibration
//! rows. Status transitions are monotonic and `Locked` is terminal: once a
//! snapshot locks, no record transitively belonging to it may change.
//!
//! # Critical Invariants
//!
//! 1. Transitions: Draft -> ReadyForReview -> Locked (Draft -> Locked only
//!    with an override acknowledgment)
//! 2. Locked has no outgoing transitions
//! 3. All thresholds are carried on the snapshot so a locked run is fully
//!    reproducible from its own rows

use crate::models::Cents;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Snapshot lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    /// Mutable working state
    Draft,

    /// Gates passed, awaiting sign-off
    ReadyForReview,

    /// Terminal: the snapshot and everything it owns is immutable
    Locked,
}

/// How the lock was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    /// All gates passed
    Standard,

    /// Gates bypassed with an explicit CFO acknowledgment
    CfoOverride,
}

/// Invalid state-machine transition
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid snapshot transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SnapshotStatus,
    pub to: SnapshotStatus,
}

/// Configuration bag attached to a snapshot at creation
///
/// Thresholds drive lock gates; the model parameters drive the segment
/// delay model and the reconciliation solver. Regime-shift cut-offs are
/// heuristic and deliberately configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Lock gate: max % of invoice amount with unresolvable FX
    pub missing_fx_threshold_pct: f64,

    /// Lock gate: max % of bank movement amount left unexplained
    pub unexplained_cash_threshold_pct: f64,

    /// Advisory KPI target for the Unknown bucket
    pub unknown_bucket_kpi_target_pct: f64,

    /// Minimum paid-history rows for a segment to win the hierarchy
    pub min_segment_sample_size: usize,

    /// Half-life for recency weighting of paid observations
    pub recency_half_life_days: f64,

    /// Winsorization bounds (percentiles of the per-segment training set)
    pub winsorize_lower_pct: f64,
    pub winsorize_upper_pct: f64,

    /// Target coverage of the conformal P25-P75 band
    pub conformal_target_coverage: f64,

    /// Matching: default amount tolerance (cents) and date window
    pub amount_tolerance: Cents,
    pub date_window_days: i64,

    /// Solver: candidate cap before degrading to greedy, and wall-clock cap
    pub lp_candidate_cap: usize,
    pub lp_timeout_ms: u64,

    /// AP: whether bills require an approval date to be forecastable
    pub require_ap_approval: bool,

    /// Regime-shift detection window and cut-offs
    pub regime_recent_window_days: f64,
    pub regime_mean_shift_sigma: f64,
    pub regime_ks_threshold: f64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            missing_fx_threshold_pct: 5.0,
            unexplained_cash_threshold_pct: 5.0,
            unknown_bucket_kpi_target_pct: 5.0,
            min_segment_sample_size: 15,
            recency_half_life_days: 90.0,
            winsorize_lower_pct: 1.0,
            winsorize_upper_pct: 99.0,
            conformal_target_coverage: 0.50,
            amount_tolerance: 1,
            date_window_days: 30,
            lp_candidate_cap: 50,
            lp_timeout_ms: 2000,
            require_ap_approval: true,
            regime_recent_window_days: 45.0,
            regime_mean_shift_sigma: 1.5,
            regime_ks_threshold: 0.2,
        }
    }
}

/// A point-in-time forecasting run
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use treasury_core_rs::models::{Snapshot, SnapshotConfig, SnapshotStatus};
///
/// let as_of = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();
/// let snapshot = Snapshot::new(
///     "ACME_DE".to_string(),
///     as_of,
///     0,
///     SnapshotConfig::default(),
/// );
/// assert_eq!(snapshot.status(), SnapshotStatus::Draft);
/// assert!(!snapshot.is_locked());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique snapshot identifier (UUID)
    id: String,

    /// Owning entity
    entity_id: String,

    /// Forecast anchor date; week 0 is the ISO week containing this date
    as_of: NaiveDate,

    /// Creation instant
    created_at: DateTime<Utc>,

    status: SnapshotStatus,
    lock_type: Option<LockType>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    override_acknowledgment: Option<String>,

    /// Lineage identifiers (UUIDs)
    import_batch_id: String,
    assumption_set_id: String,
    fx_table_version: String,

    /// Opening cash position in entity base currency (cents), seeds week 0
    opening_balance: Cents,

    /// Thresholds and model parameters frozen at creation
    config: SnapshotConfig,

    /// SHA-256 digest over owned rows, computed at lock time
    digest: Option<String>,
}

impl Snapshot {
    /// Create a new draft snapshot with fresh lineage ids
    pub fn new(
        entity_id: String,
        as_of: NaiveDate,
        opening_balance: Cents,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id,
            as_of,
            created_at: Utc::now(),
            status: SnapshotStatus::Draft,
            lock_type: None,
            locked_at: None,
            locked_by: None,
            override_acknowledgment: None,
            import_batch_id: uuid::Uuid::new_v4().to_string(),
            assumption_set_id: uuid::Uuid::new_v4().to_string(),
            fx_table_version: uuid::Uuid::new_v4().to_string(),
            opening_balance,
            config,
            digest: None,
        }
    }

    /// Get snapshot ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get owning entity ID
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Get the as-of anchor date
    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    /// Get creation instant
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get current status
    pub fn status(&self) -> SnapshotStatus {
        self.status
    }

    /// Check whether the snapshot is terminally locked
    pub fn is_locked(&self) -> bool {
        self.status == SnapshotStatus::Locked
    }

    /// Get lock type, if locked
    pub fn lock_type(&self) -> Option<LockType> {
        self.lock_type
    }

    /// Get lock instant, if locked
    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.locked_at
    }

    /// Get the user who locked, if locked
    pub fn locked_by(&self) -> Option<&str> {
        self.locked_by.as_deref()
    }

    /// Get the stored override acknowledgment, if any
    pub fn override_acknowledgment(&self) -> Option<&str> {
        self.override_acknowledgment.as_deref()
    }

    /// Get import batch lineage id
    pub fn import_batch_id(&self) -> &str {
        &self.import_batch_id
    }

    /// Get assumption set lineage id
    pub fn assumption_set_id(&self) -> &str {
        &self.assumption_set_id
    }

    /// Get FX table version id
    pub fn fx_table_version(&self) -> &str {
        &self.fx_table_version
    }

    /// Get opening balance (cents, entity base currency)
    pub fn opening_balance(&self) -> Cents {
        self.opening_balance
    }

    /// Get the frozen configuration
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Get the lock-time digest, if locked
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Validate a transition without applying it
    pub fn check_transition(&self, to: SnapshotStatus) -> Result<(), TransitionError> {
        use SnapshotStatus::{Draft, Locked, ReadyForReview};
        let ok = matches!(
            (self.status, to),
            (Draft, ReadyForReview) | (ReadyForReview, Locked) | (Draft, Locked)
        );
        if ok {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }

    /// Move to ReadyForReview
    pub fn mark_ready(&mut self) -> Result<(), TransitionError> {
        self.check_transition(SnapshotStatus::ReadyForReview)?;
        self.status = SnapshotStatus::ReadyForReview;
        Ok(())
    }

    /// Apply the terminal lock
    ///
    /// The caller (the lock gate layer) is responsible for gate checks and
    /// acknowledgment validation; this method only enforces the state
    /// machine itself.
    pub fn lock(
        &mut self,
        lock_type: LockType,
        locked_by: String,
        acknowledgment: Option<String>,
        digest: String,
    ) -> Result<(), TransitionError> {
        self.check_transition(SnapshotStatus::Locked)?;
        self.status = SnapshotStatus::Locked;
        self.lock_type = Some(lock_type);
        self.locked_at = Some(Utc::now());
        self.locked_by = Some(locked_by);
        self.override_acknowledgment = acknowledgment;
        self.digest = Some(digest);
        Ok(())
    }
}
