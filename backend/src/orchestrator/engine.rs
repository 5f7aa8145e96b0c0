//! Treasury engine - the external surface of the core
//!
//! One facade over the whole pipeline: snapshot creation, ingest, FX,
//! forecast, reconciliation, workspace, lock gates, variance and the
//! trust report. A transport layer (HTTP, RPC, CLI) wraps these
//! synchronous operations; the core itself never spawns work.
//!
//! Every state-changing operation:
//! - takes the per-snapshot advisory lock for the duration of the call
//! - runs its writes inside a repository transaction
//! - appends an audit event on success

use crate::ap::ApError;
use crate::forecast::{ForecastError, ForecastReport};
use crate::fx::{FxError, FxTable};
use crate::ingest::{IngestError, IngestRecord, IngestSummary};
use crate::locking::{self, GateCheckResult, LockError, LockResult};
use crate::models::{
    AllocationError, AllocationTarget, BankTransaction, Cents, Entity, FxRateError,
    LifecycleStatus, MatchAllocation, MatchTier, MatchingPolicy, ReconciliationType, Snapshot,
    SnapshotConfig, TransitionError, WeeklyFxRate,
};
use crate::progress::{CancellationToken, NullSink, ProgressSink};
use crate::recon::lifecycle::WorkflowError;
use crate::recon::{ReconError, ReconcileReport};
use crate::repo::{RepoError, Repository};
use crate::truth::TrustReport;
use crate::variance::{VarianceError, VarianceReport};
use crate::workspace::{CellContribution, Direction, WorkspaceError, WorkspaceGrid};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Engine-level error: the union of the boundary error taxonomy
#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("forecast error: {0}")]
    Forecast(#[from] ForecastError),

    #[error("reconciliation error: {0}")]
    Recon(#[from] ReconError),

    #[error("AP projection error: {0}")]
    Ap(#[from] ApError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("variance error: {0}")]
    Variance(#[from] VarianceError),

    #[error("FX error: {0}")]
    Fx(#[from] FxError),

    #[error("invalid rate: {0}")]
    InvalidRate(#[from] FxRateError),

    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// No learned statistics for the requested segment
    #[error("unknown segment: {segment_key}")]
    UnknownSegment { segment_key: String },
}

/// Lineage identifiers returned by snapshot creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLineage {
    pub snapshot_id: String,
    pub import_batch_id: String,
    pub assumption_set_id: String,
    pub fx_table_version: String,
}

/// The treasury core engine
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use treasury_core_rs::models::Entity;
/// use treasury_core_rs::orchestrator::TreasuryEngine;
///
/// let mut engine = TreasuryEngine::new();
/// engine
///     .register_entity(Entity::new("ACME_DE".to_string(), "EUR".to_string(), 4))
///     .unwrap();
/// let lineage = engine
///     .create_snapshot(
///         "ACME_DE",
///         NaiveDate::from_ymd_opt(2024, 3, 11).unwrap(),
///         0,
///         None,
///         "treasurer",
///     )
///     .unwrap();
/// assert!(!lineage.snapshot_id.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct TreasuryEngine {
    repo: Repository,
}

impl TreasuryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing repository (e.g. restored state)
    pub fn with_repository(repo: Repository) -> Self {
        Self { repo }
    }

    /// Read access to the underlying repository
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    fn audit(
        &mut self,
        user: &str,
        entity_id: &str,
        snapshot_id: Option<&str>,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        delta: serde_json::Value,
    ) {
        self.repo.audit_mut().append(
            user.to_string(),
            entity_id.to_string(),
            snapshot_id.map(str::to_string),
            action.to_string(),
            resource_type.to_string(),
            resource_id.to_string(),
            delta,
        );
    }

    /// Run `f` while holding the snapshot's advisory write lock
    fn with_snapshot_lock<T>(
        &mut self,
        snapshot_id: &str,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.repo.advisory_lock(snapshot_id)?;
        let result = f(self);
        self.repo.advisory_unlock(snapshot_id);
        result
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    pub fn register_entity(&mut self, entity: Entity) -> Result<(), EngineError> {
        let id = entity.id().to_string();
        self.repo.insert_entity(entity)?;
        info!(entity_id = %id, "entity registered");
        Ok(())
    }

    /// Register an actual bank movement (statement parsers feed these in)
    pub fn register_bank_transaction(
        &mut self,
        txn: BankTransaction,
    ) -> Result<String, EngineError> {
        let id = txn.id().to_string();
        self.repo.insert_bank_transaction(txn)?;
        Ok(id)
    }

    /// Install or replace a matching policy; the change is audited
    pub fn set_matching_policy(
        &mut self,
        policy: MatchingPolicy,
        user: &str,
    ) -> Result<(), EngineError> {
        let entity = policy.entity_id.clone().unwrap_or_else(|| "*".to_string());
        let delta = serde_json::to_value(&policy).unwrap_or(serde_json::Value::Null);
        self.repo.set_matching_policy(policy);
        self.audit(
            user,
            &entity,
            None,
            "set_matching_policy",
            "matching_policy",
            &entity,
            delta,
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshot lifecycle
    // ------------------------------------------------------------------

    /// Create a draft snapshot with fresh lineage ids
    pub fn create_snapshot(
        &mut self,
        entity_id: &str,
        as_of: NaiveDate,
        opening_balance: Cents,
        config: Option<SnapshotConfig>,
        user: &str,
    ) -> Result<SnapshotLineage, EngineError> {
        self.repo.entity(entity_id)?;
        let snapshot = Snapshot::new(
            entity_id.to_string(),
            as_of,
            opening_balance,
            config.unwrap_or_default(),
        );
        let lineage = SnapshotLineage {
            snapshot_id: snapshot.id().to_string(),
            import_batch_id: snapshot.import_batch_id().to_string(),
            assumption_set_id: snapshot.assumption_set_id().to_string(),
            fx_table_version: snapshot.fx_table_version().to_string(),
        };
        self.repo.insert_snapshot(snapshot)?;
        self.audit(
            user,
            entity_id,
            Some(&lineage.snapshot_id),
            "create_snapshot",
            "snapshot",
            &lineage.snapshot_id,
            serde_json::json!({ "as_of": as_of.to_string() }),
        );
        info!(snapshot_id = %lineage.snapshot_id, %entity_id, "snapshot created");
        Ok(lineage)
    }

    /// Ingest canonical records into a snapshot (idempotent)
    pub fn ingest_records(
        &mut self,
        snapshot_id: &str,
        records: &[IngestRecord],
        user: &str,
    ) -> Result<IngestSummary, EngineError> {
        self.ingest_records_with(
            snapshot_id,
            records,
            user,
            &CancellationToken::new(),
            &mut NullSink,
        )
    }

    pub fn ingest_records_with(
        &mut self,
        snapshot_id: &str,
        records: &[IngestRecord],
        user: &str,
        cancel: &CancellationToken,
        sink: &mut dyn ProgressSink,
    ) -> Result<IngestSummary, EngineError> {
        self.with_snapshot_lock(snapshot_id, |engine| {
            let summary = crate::ingest::ingest(&mut engine.repo, snapshot_id, records, cancel, sink)?;
            let entity_id = engine.repo.snapshot(snapshot_id)?.entity_id().to_string();
            engine.audit(
                user,
                &entity_id,
                Some(snapshot_id),
                "ingest_records",
                "snapshot",
                snapshot_id,
                serde_json::json!({
                    "inserted": summary.inserted,
                    "updated": summary.updated,
                    "skipped": summary.skipped,
                    "unresolved_parents": summary.unresolved_parents.len(),
                    "possible_collisions": summary.possible_collisions.len(),
                }),
            );
            Ok(summary)
        })
    }

    /// Write weekly FX rates into a snapshot
    pub fn set_fx_rates(
        &mut self,
        snapshot_id: &str,
        rates: &[(String, String, NaiveDate, f64)],
        user: &str,
    ) -> Result<(), EngineError> {
        self.with_snapshot_lock(snapshot_id, |engine| {
            let entity_id = engine.repo.snapshot(snapshot_id)?.entity_id().to_string();
            let result: Result<(), EngineError> = engine.repo.with_transaction(|repo| {
                for (from, to, week, rate) in rates {
                    let row = WeeklyFxRate::new(
                        snapshot_id.to_string(),
                        from.clone(),
                        to.clone(),
                        *week,
                        *rate,
                    )?;
                    repo.upsert_fx_rate(row)?;
                }
                Ok(())
            });
            result?;
            engine.audit(
                user,
                &entity_id,
                Some(snapshot_id),
                "set_fx_rates",
                "fx_rates",
                snapshot_id,
                serde_json::json!({ "rates": rates.len() }),
            );
            Ok(())
        })
    }

    /// Convert an amount using a snapshot's frozen rates
    ///
    /// Raises [`FxError::Missing`] for an unconfigured pair; never
    /// defaults to 1.0 unless `from == to`.
    pub fn convert_currency(
        &self,
        snapshot_id: &str,
        amount: Cents,
        from: &str,
        to: &str,
        date: NaiveDate,
    ) -> Result<Cents, EngineError> {
        self.repo.snapshot(snapshot_id)?;
        let fx = FxTable::load(&self.repo, snapshot_id);
        Ok(fx.convert(amount, from, to, date)?)
    }

    /// Record an approved off-cycle payment exception
    pub fn add_payment_run_exception(
        &mut self,
        exception: crate::models::PaymentRunException,
        user: &str,
    ) -> Result<(), EngineError> {
        let snapshot_id = exception.snapshot_id.clone();
        self.with_snapshot_lock(&snapshot_id, |engine| {
            let entity_id = engine.repo.snapshot(&snapshot_id)?.entity_id().to_string();
            let delta = serde_json::to_value(&exception).unwrap_or(serde_json::Value::Null);
            let bill = exception.bill_canonical_id.clone();
            engine.repo.insert_payment_run_exception(exception)?;
            engine.audit(
                user,
                &entity_id,
                Some(&snapshot_id),
                "add_payment_run_exception",
                "payment_run_exception",
                &bill,
                delta,
            );
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    /// Train, calibrate and predict; returns the calibration report
    pub fn run_forecast(
        &mut self,
        snapshot_id: &str,
        user: &str,
    ) -> Result<ForecastReport, EngineError> {
        self.run_forecast_with(snapshot_id, user, &CancellationToken::new(), &mut NullSink)
    }

    pub fn run_forecast_with(
        &mut self,
        snapshot_id: &str,
        user: &str,
        cancel: &CancellationToken,
        sink: &mut dyn ProgressSink,
    ) -> Result<ForecastReport, EngineError> {
        self.with_snapshot_lock(snapshot_id, |engine| {
            let report =
                crate::forecast::run_forecast(&mut engine.repo, snapshot_id, cancel, sink)?;
            let entity_id = engine.repo.snapshot(snapshot_id)?.entity_id().to_string();
            engine.audit(
                user,
                &entity_id,
                Some(snapshot_id),
                "run_forecast",
                "snapshot",
                snapshot_id,
                serde_json::json!({
                    "trained_segments": report.trained_segments,
                    "calibrated_segments": report.calibrated_segments,
                    "predicted_invoices": report.predicted_invoices,
                    "warnings": report.warnings.len(),
                }),
            );
            Ok(report)
        })
    }

    /// Run the reconciliation ladder; returns per-tier counts and proofs
    pub fn reconcile(
        &mut self,
        entity_id: &str,
        snapshot_id: &str,
        user: &str,
    ) -> Result<ReconcileReport, EngineError> {
        self.reconcile_with(
            entity_id,
            snapshot_id,
            user,
            &CancellationToken::new(),
            &mut NullSink,
        )
    }

    pub fn reconcile_with(
        &mut self,
        entity_id: &str,
        snapshot_id: &str,
        user: &str,
        cancel: &CancellationToken,
        sink: &mut dyn ProgressSink,
    ) -> Result<ReconcileReport, EngineError> {
        self.with_snapshot_lock(snapshot_id, |engine| {
            let report =
                crate::recon::reconcile(&mut engine.repo, entity_id, snapshot_id, cancel, sink)?;
            engine.audit(
                user,
                entity_id,
                Some(snapshot_id),
                "reconcile",
                "snapshot",
                snapshot_id,
                serde_json::json!({
                    "tier1": report.counts.tier1_deterministic,
                    "tier2": report.counts.tier2_rule,
                    "tier3_suggested": report.counts.tier3_suggested,
                    "unmatched": report.unmatched,
                    "similarity_formula": report.similarity_formula,
                }),
            );
            Ok(report)
        })
    }

    /// Approve a suggested or manual allocation
    pub fn approve_match(&mut self, allocation_id: &str, user: &str) -> Result<(), EngineError> {
        let (snapshot_id, transaction_id) = {
            let alloc = self.repo.allocation(allocation_id)?;
            (
                alloc.snapshot_id().to_string(),
                alloc.transaction_id().to_string(),
            )
        };
        self.with_snapshot_lock(&snapshot_id, |engine| {
            let mut outcome: Result<(), AllocationError> = Ok(());
            engine.repo.update_allocation(allocation_id, |alloc| {
                outcome = alloc.approve(user.to_string());
            })?;
            outcome?;

            // fully explained transactions flip to reconciled
            let txn = engine.repo.bank_transaction(&transaction_id)?;
            let consumed: Cents = engine
                .repo
                .allocations_for_transaction(&transaction_id)
                .iter()
                .filter(|a| a.is_approved())
                .map(|a| a.allocated_amount())
                .sum();
            let fully = consumed + txn.fees() + txn.writeoffs() >= txn.abs_amount();
            engine
                .repo
                .update_bank_transaction(&transaction_id, |t| {
                    if let Some(rt) = t.reconciliation_type() {
                        t.set_reconciliation(rt, fully);
                    }
                })?;

            let entity_id = engine.repo.snapshot(&snapshot_id)?.entity_id().to_string();
            engine.audit(
                user,
                &entity_id,
                Some(&snapshot_id),
                "approve_match",
                "allocation",
                allocation_id,
                serde_json::json!({ "transaction_id": transaction_id }),
            );
            Ok(())
        })
    }

    /// Create a tier-4 manual link
    pub fn create_manual_match(
        &mut self,
        transaction_id: &str,
        target: AllocationTarget,
        amount: Cents,
        user: &str,
    ) -> Result<String, EngineError> {
        let snapshot_id = match &target {
            AllocationTarget::Invoice(id) => self.repo.invoice(id)?.snapshot_id().to_string(),
            AllocationTarget::Bill(id) => self.repo.bill(id)?.snapshot_id().to_string(),
        };
        self.with_snapshot_lock(&snapshot_id, |engine| {
            let alloc = MatchAllocation::new(
                transaction_id.to_string(),
                target,
                snapshot_id.clone(),
                amount,
                MatchTier::Manual,
            )?
            .auto_approved();
            let alloc_id = alloc.id().to_string();
            engine.repo.insert_allocation(alloc)?;

            // a manual link only reconciles the transaction once approved
            // allocations plus fees and writeoffs cover the whole amount
            let txn = engine.repo.bank_transaction(transaction_id)?;
            let (abs_amount, fees, writeoffs) = (txn.abs_amount(), txn.fees(), txn.writeoffs());
            let consumed: Cents = engine
                .repo
                .allocations_for_transaction(transaction_id)
                .iter()
                .filter(|a| a.is_approved())
                .map(|a| a.allocated_amount())
                .sum();
            let fully = consumed + fees + writeoffs >= abs_amount;
            engine
                .repo
                .update_bank_transaction(transaction_id, |t| {
                    t.set_reconciliation(ReconciliationType::Manual, fully);
                })?;

            let entity_id = engine.repo.snapshot(&snapshot_id)?.entity_id().to_string();
            engine.audit(
                user,
                &entity_id,
                Some(&snapshot_id),
                "create_manual_match",
                "allocation",
                &alloc_id,
                serde_json::json!({ "transaction_id": transaction_id, "amount": amount }),
            );
            Ok(alloc_id)
        })
    }

    // ------------------------------------------------------------------
    // Workspace and reports
    // ------------------------------------------------------------------

    /// Build the 13-week workspace
    ///
    /// While the snapshot is still mutable the truth labels assigned
    /// during aggregation are persisted onto the rows; a locked snapshot
    /// is read as-is.
    pub fn get_workspace_13w(&mut self, snapshot_id: &str) -> Result<WorkspaceGrid, EngineError> {
        let grid = crate::workspace::build(&self.repo, snapshot_id)?;
        if !self.repo.snapshot(snapshot_id)?.is_locked() {
            let labels = grid.item_labels().clone();
            self.repo.with_transaction(|repo| -> Result<(), RepoError> {
                for (row_id, label) in &labels {
                    if repo.invoice(row_id).is_ok() {
                        repo.update_invoice(row_id, |inv| inv.set_truth_label(*label))?;
                    } else if repo.bill(row_id).is_ok() {
                        repo.update_bill(row_id, |bill| bill.set_truth_label(*label))?;
                    }
                }
                Ok(())
            })?;
        }
        debug!(snapshot_id, rows = grid.rows.len(), "workspace built");
        Ok(grid)
    }

    /// Exact decomposition of one grid cell
    pub fn get_drilldown(
        &self,
        snapshot_id: &str,
        week_index: i64,
        direction: Direction,
    ) -> Result<Vec<CellContribution>, EngineError> {
        let grid = crate::workspace::build(&self.repo, snapshot_id)?;
        Ok(grid.drilldown(week_index, direction).to_vec())
    }

    /// Gate check + transition to ReadyForReview when gates pass
    pub fn mark_ready_for_review(
        &mut self,
        snapshot_id: &str,
        user: &str,
    ) -> Result<GateCheckResult, EngineError> {
        self.with_snapshot_lock(snapshot_id, |engine| {
            let result = locking::mark_ready_for_review(&mut engine.repo, snapshot_id)?;
            let entity_id = engine.repo.snapshot(snapshot_id)?.entity_id().to_string();
            engine.audit(
                user,
                &entity_id,
                Some(snapshot_id),
                "mark_ready_for_review",
                "snapshot",
                snapshot_id,
                serde_json::json!({
                    "passed": result.passed,
                    "missing_fx_exposure_pct": result.missing_fx_exposure_pct,
                    "unexplained_cash_pct": result.unexplained_cash_pct,
                }),
            );
            Ok(result)
        })
    }

    /// Lock a snapshot (terminal)
    pub fn lock_snapshot(
        &mut self,
        snapshot_id: &str,
        user: &str,
        cfo_override: bool,
        acknowledgment: Option<&str>,
    ) -> Result<LockResult, EngineError> {
        self.with_snapshot_lock(snapshot_id, |engine| {
            let result = locking::lock_snapshot(
                &mut engine.repo,
                snapshot_id,
                user,
                cfo_override,
                acknowledgment,
            )?;
            let entity_id = engine.repo.snapshot(snapshot_id)?.entity_id().to_string();
            engine.audit(
                user,
                &entity_id,
                Some(snapshot_id),
                "lock_snapshot",
                "snapshot",
                snapshot_id,
                serde_json::json!({
                    "lock_type": format!("{:?}", result.lock_type),
                    "override_acknowledgment": acknowledgment,
                    "digest": result.digest,
                }),
            );
            info!(snapshot_id, lock_type = ?result.lock_type, "snapshot locked");
            Ok(result)
        })
    }

    /// Four-category variance between two snapshots
    pub fn compute_variance(
        &self,
        snapshot_a: &str,
        snapshot_b: &str,
    ) -> Result<VarianceReport, EngineError> {
        Ok(crate::variance::compute_variance(
            &self.repo, snapshot_a, snapshot_b,
        )?)
    }

    /// Headline trust metrics for a snapshot
    pub fn get_trust_report(&self, snapshot_id: &str) -> Result<TrustReport, EngineError> {
        let grid = crate::workspace::build(&self.repo, snapshot_id)?;
        Ok(crate::truth::trust_report(&self.repo, snapshot_id, &grid)?)
    }

    /// Recompute and compare a locked snapshot's digest
    pub fn verify_digest(&self, snapshot_id: &str) -> Result<bool, EngineError> {
        Ok(locking::verify_digest(&self.repo, snapshot_id)?)
    }

    /// Learned delay statistics for one segment of a snapshot
    pub fn get_segment_stats(
        &self,
        snapshot_id: &str,
        level: crate::models::SegmentLevel,
        segment_key: &str,
    ) -> Result<crate::models::SegmentDelayStats, EngineError> {
        self.repo.snapshot(snapshot_id)?;
        self.repo
            .segment_stats(snapshot_id, level, segment_key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSegment {
                segment_key: format!("{level}:{segment_key}"),
            })
    }

    // ------------------------------------------------------------------
    // Unmatched transaction workflow
    // ------------------------------------------------------------------

    /// Assign an unmatched transaction; returns the derived SLA breach
    /// date
    pub fn assign_transaction(
        &mut self,
        transaction_id: &str,
        assignee: &str,
        assigned_at: NaiveDate,
        user: &str,
    ) -> Result<NaiveDate, EngineError> {
        let breach = crate::recon::lifecycle::assign_transaction(
            &mut self.repo,
            transaction_id,
            assignee,
            assigned_at,
        )?;
        let entity_id = self
            .repo
            .bank_transaction(transaction_id)?
            .entity_id()
            .to_string();
        self.audit(
            user,
            &entity_id,
            None,
            "assign_transaction",
            "bank_transaction",
            transaction_id,
            serde_json::json!({ "assignee": assignee, "sla_breach_at": breach.to_string() }),
        );
        Ok(breach)
    }

    /// User-driven lifecycle transition on an unmatched transaction
    pub fn transition_transaction(
        &mut self,
        transaction_id: &str,
        to: LifecycleStatus,
        user: &str,
    ) -> Result<(), EngineError> {
        crate::recon::lifecycle::transition_transaction(&mut self.repo, transaction_id, to)?;
        let entity_id = self
            .repo
            .bank_transaction(transaction_id)?
            .entity_id()
            .to_string();
        self.audit(
            user,
            &entity_id,
            None,
            "transition_transaction",
            "bank_transaction",
            transaction_id,
            serde_json::json!({ "to": format!("{to:?}") }),
        );
        Ok(())
    }
}
