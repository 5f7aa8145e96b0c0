//! Repository - the single write choke point
//!
//! In-memory tabular store for all domain entities. Every write routes
//! through this layer, which is where lock immutability is enforced: once
//! a snapshot is `Locked`, any write touching the snapshot or a record
//! transitively owned by it fails with [`RepoError::SnapshotLocked`]. This
//! is a guarantee of the storage layer, not a convention upheld by
//! callers.
//!
//! # Critical Invariants
//!
//! 1. `(snapshot_id, canonical_id)` unique for invoices and bills
//! 2. No write into a locked snapshot, ever
//! 3. Per invoice/bill: sum of allocations never exceeds the document
//!    amount (checked at insert)
//! 4. Per transaction: allocations + fees + writeoffs never exceed
//!    |amount| (checked at insert)
//! 5. Multi-row pipelines run inside [`Repository::with_transaction`];
//!    an error restores the pre-transaction state exactly
//!
//! Reads never serialize; writes within a snapshot are serialized by the
//! advisory lock the pipelines take around state-changing operations.

use crate::models::{
    AllocationTarget, AuditLog, BankTransaction, CalibrationStats, Cents, Entity, Invoice,
    MatchAllocation, MatchingPolicy, PaymentRunException, SegmentDelayStats, SegmentLevel,
    Snapshot, VendorBill, WeeklyFxRate,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors raised at the repository boundary
#[derive(Debug, Error, PartialEq)]
pub enum RepoError {
    /// Write rejected: the owning snapshot is terminally locked
    #[error("snapshot {snapshot_id} is locked")]
    SnapshotLocked { snapshot_id: String },

    #[error("{resource_type} {id} not found")]
    NotFound { resource_type: String, id: String },

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Allocation would exceed the target's open amount or the
    /// transaction's capacity
    #[error(
        "over-allocation on {resource_id}: attempted {attempted}, capacity {capacity}"
    )]
    OverAllocation {
        resource_id: String,
        attempted: Cents,
        capacity: Cents,
    },

    /// Advisory lock already held for this snapshot
    #[error("advisory lock for snapshot {snapshot_id} already held")]
    AdvisoryLockHeld { snapshot_id: String },

    /// Row could not be serialized for hashing
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant breached; indicates a programming bug
    #[error("integrity violation: {0}")]
    Integrity(String),
}

/// In-memory tabular repository
///
/// One map per entity table, plus the unique-key indexes the data model
/// requires. `Clone` is the transaction mechanism: [`Repository::with_transaction`]
/// snapshots the store and restores it if the closure fails.
#[derive(Debug, Clone, Default)]
pub struct Repository {
    entities: BTreeMap<String, Entity>,
    snapshots: BTreeMap<String, Snapshot>,

    invoices: BTreeMap<String, Invoice>,
    /// (snapshot_id, canonical_id) -> invoice row id
    invoice_canonical: BTreeMap<(String, String), String>,

    bills: BTreeMap<String, VendorBill>,
    /// (snapshot_id, canonical_id) -> bill row id
    bill_canonical: BTreeMap<(String, String), String>,

    bank_transactions: BTreeMap<String, BankTransaction>,

    allocations: BTreeMap<String, MatchAllocation>,

    /// (snapshot_id, from, to, week_start ISO) -> rate
    fx_rates: BTreeMap<(String, String, String, String), WeeklyFxRate>,

    /// (snapshot_id, segment_type, segment_key) -> stats
    segment_stats: BTreeMap<(String, SegmentLevel, String), SegmentDelayStats>,

    /// (snapshot_id, segment_key) -> calibration
    calibration_stats: BTreeMap<(String, String), CalibrationStats>,

    matching_policies: Vec<MatchingPolicy>,

    payment_run_exceptions: BTreeMap<(String, String), PaymentRunException>,

    audit: AuditLog,

    advisory_locks: BTreeSet<String>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Lock guard
    // ------------------------------------------------------------------

    /// The choke-point check: every snapshot-owned write calls this first.
    fn assert_unlocked(&self, snapshot_id: &str) -> Result<(), RepoError> {
        match self.snapshots.get(snapshot_id) {
            Some(s) if s.is_locked() => Err(RepoError::SnapshotLocked {
                snapshot_id: snapshot_id.to_string(),
            }),
            Some(_) => Ok(()),
            None => Err(RepoError::NotFound {
                resource_type: "snapshot".to_string(),
                id: snapshot_id.to_string(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Transactions and advisory locks
    // ------------------------------------------------------------------

    /// Run `f` atomically: if it returns an error, every write it made is
    /// rolled back. All multi-row pipelines go through here so no error
    /// can leave a partially-updated snapshot.
    pub fn with_transaction<T, E>(
        &mut self,
        f: impl FnOnce(&mut Repository) -> Result<T, E>,
    ) -> Result<T, E> {
        let backup = self.clone();
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                *self = backup;
                Err(e)
            }
        }
    }

    /// Acquire the per-snapshot advisory write lock
    pub fn advisory_lock(&mut self, snapshot_id: &str) -> Result<(), RepoError> {
        if !self.advisory_locks.insert(snapshot_id.to_string()) {
            return Err(RepoError::AdvisoryLockHeld {
                snapshot_id: snapshot_id.to_string(),
            });
        }
        Ok(())
    }

    /// Release the per-snapshot advisory write lock
    pub fn advisory_unlock(&mut self, snapshot_id: &str) {
        self.advisory_locks.remove(snapshot_id);
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    pub fn insert_entity(&mut self, entity: Entity) -> Result<(), RepoError> {
        if self.entities.contains_key(entity.id()) {
            return Err(RepoError::DuplicateKey(format!("entity {}", entity.id())));
        }
        self.entities.insert(entity.id().to_string(), entity);
        Ok(())
    }

    pub fn entity(&self, id: &str) -> Result<&Entity, RepoError> {
        self.entities.get(id).ok_or_else(|| RepoError::NotFound {
            resource_type: "entity".to_string(),
            id: id.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn insert_snapshot(&mut self, snapshot: Snapshot) -> Result<(), RepoError> {
        if self.snapshots.contains_key(snapshot.id()) {
            return Err(RepoError::DuplicateKey(format!(
                "snapshot {}",
                snapshot.id()
            )));
        }
        self.snapshots.insert(snapshot.id().to_string(), snapshot);
        Ok(())
    }

    pub fn snapshot(&self, id: &str) -> Result<&Snapshot, RepoError> {
        self.snapshots.get(id).ok_or_else(|| RepoError::NotFound {
            resource_type: "snapshot".to_string(),
            id: id.to_string(),
        })
    }

    /// Mutate a snapshot's own attributes. Rejected once locked; the lock
    /// transition itself runs while the snapshot is still unlocked, so it
    /// passes this guard exactly once.
    pub fn modify_snapshot(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut Snapshot),
    ) -> Result<(), RepoError> {
        self.assert_unlocked(id)?;
        let snapshot = self.snapshots.get_mut(id).ok_or_else(|| RepoError::NotFound {
            resource_type: "snapshot".to_string(),
            id: id.to_string(),
        })?;
        f(snapshot);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invoices
    // ------------------------------------------------------------------

    pub fn insert_invoice(&mut self, invoice: Invoice) -> Result<(), RepoError> {
        self.assert_unlocked(invoice.snapshot_id())?;
        let key = (
            invoice.snapshot_id().to_string(),
            invoice.canonical_id().to_string(),
        );
        if self.invoice_canonical.contains_key(&key) {
            return Err(RepoError::DuplicateKey(format!(
                "invoice ({}, {})",
                key.0, key.1
            )));
        }
        self.invoice_canonical.insert(key, invoice.id().to_string());
        self.invoices.insert(invoice.id().to_string(), invoice);
        Ok(())
    }

    pub fn invoice(&self, id: &str) -> Result<&Invoice, RepoError> {
        self.invoices.get(id).ok_or_else(|| RepoError::NotFound {
            resource_type: "invoice".to_string(),
            id: id.to_string(),
        })
    }

    pub fn invoice_by_canonical(&self, snapshot_id: &str, canonical_id: &str) -> Option<&Invoice> {
        let key = (snapshot_id.to_string(), canonical_id.to_string());
        self.invoice_canonical
            .get(&key)
            .and_then(|id| self.invoices.get(id))
    }

    pub fn invoices_for_snapshot(&self, snapshot_id: &str) -> Vec<&Invoice> {
        self.invoices
            .values()
            .filter(|i| i.snapshot_id() == snapshot_id)
            .collect()
    }

    pub fn update_invoice(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut Invoice),
    ) -> Result<(), RepoError> {
        let snapshot_id = self.invoice(id)?.snapshot_id().to_string();
        self.assert_unlocked(&snapshot_id)?;
        if let Some(invoice) = self.invoices.get_mut(id) {
            f(invoice);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Vendor bills
    // ------------------------------------------------------------------

    pub fn insert_bill(&mut self, bill: VendorBill) -> Result<(), RepoError> {
        self.assert_unlocked(bill.snapshot_id())?;
        let key = (
            bill.snapshot_id().to_string(),
            bill.canonical_id().to_string(),
        );
        if self.bill_canonical.contains_key(&key) {
            return Err(RepoError::DuplicateKey(format!(
                "bill ({}, {})",
                key.0, key.1
            )));
        }
        self.bill_canonical.insert(key, bill.id().to_string());
        self.bills.insert(bill.id().to_string(), bill);
        Ok(())
    }

    pub fn bill(&self, id: &str) -> Result<&VendorBill, RepoError> {
        self.bills.get(id).ok_or_else(|| RepoError::NotFound {
            resource_type: "bill".to_string(),
            id: id.to_string(),
        })
    }

    pub fn bill_by_canonical(&self, snapshot_id: &str, canonical_id: &str) -> Option<&VendorBill> {
        let key = (snapshot_id.to_string(), canonical_id.to_string());
        self.bill_canonical
            .get(&key)
            .and_then(|id| self.bills.get(id))
    }

    pub fn bills_for_snapshot(&self, snapshot_id: &str) -> Vec<&VendorBill> {
        self.bills
            .values()
            .filter(|b| b.snapshot_id() == snapshot_id)
            .collect()
    }

    pub fn update_bill(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut VendorBill),
    ) -> Result<(), RepoError> {
        let snapshot_id = self.bill(id)?.snapshot_id().to_string();
        self.assert_unlocked(&snapshot_id)?;
        if let Some(bill) = self.bills.get_mut(id) {
            f(bill);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bank transactions (entity-owned: no snapshot guard)
    // ------------------------------------------------------------------

    pub fn insert_bank_transaction(&mut self, txn: BankTransaction) -> Result<(), RepoError> {
        if self.bank_transactions.contains_key(txn.id()) {
            return Err(RepoError::DuplicateKey(format!("transaction {}", txn.id())));
        }
        self.bank_transactions.insert(txn.id().to_string(), txn);
        Ok(())
    }

    pub fn bank_transaction(&self, id: &str) -> Result<&BankTransaction, RepoError> {
        self.bank_transactions
            .get(id)
            .ok_or_else(|| RepoError::NotFound {
                resource_type: "bank_transaction".to_string(),
                id: id.to_string(),
            })
    }

    /// Transactions for an entity, ordered by (transaction_date, id)
    pub fn bank_transactions_for_entity(&self, entity_id: &str) -> Vec<&BankTransaction> {
        let mut txns: Vec<&BankTransaction> = self
            .bank_transactions
            .values()
            .filter(|t| t.entity_id() == entity_id)
            .collect();
        txns.sort_by(|a, b| {
            a.transaction_date()
                .cmp(&b.transaction_date())
                .then_with(|| a.id().cmp(b.id()))
        });
        txns
    }

    pub fn update_bank_transaction(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut BankTransaction),
    ) -> Result<(), RepoError> {
        let txn = self
            .bank_transactions
            .get_mut(id)
            .ok_or_else(|| RepoError::NotFound {
                resource_type: "bank_transaction".to_string(),
                id: id.to_string(),
            })?;
        f(txn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocations
    // ------------------------------------------------------------------

    /// Insert an allocation, enforcing the no-overmatch and conservation
    /// capacity invariants against current state.
    pub fn insert_allocation(&mut self, alloc: MatchAllocation) -> Result<(), RepoError> {
        self.assert_unlocked(alloc.snapshot_id())?;

        // Invariant 3: target capacity
        let target_amount = match alloc.target() {
            AllocationTarget::Invoice(id) => self.invoice(id)?.amount(),
            AllocationTarget::Bill(id) => self.bill(id)?.amount().abs(),
        };
        let already: Cents = self
            .allocations_for_target(alloc.target())
            .iter()
            .map(|a| a.allocated_amount())
            .sum();
        if already + alloc.allocated_amount() > target_amount {
            return Err(RepoError::OverAllocation {
                resource_id: alloc.target().row_id().to_string(),
                attempted: alloc.allocated_amount(),
                capacity: target_amount - already,
            });
        }

        // Invariant 4: transaction capacity
        let txn = self.bank_transaction(alloc.transaction_id())?;
        let consumed: Cents = self
            .allocations_for_transaction(alloc.transaction_id())
            .iter()
            .map(|a| a.allocated_amount())
            .sum();
        let capacity = txn.abs_amount() - txn.fees() - txn.writeoffs() - consumed;
        if alloc.allocated_amount() > capacity {
            return Err(RepoError::OverAllocation {
                resource_id: alloc.transaction_id().to_string(),
                attempted: alloc.allocated_amount(),
                capacity,
            });
        }

        self.allocations.insert(alloc.id().to_string(), alloc);
        Ok(())
    }

    pub fn allocation(&self, id: &str) -> Result<&MatchAllocation, RepoError> {
        self.allocations.get(id).ok_or_else(|| RepoError::NotFound {
            resource_type: "allocation".to_string(),
            id: id.to_string(),
        })
    }

    pub fn allocations_for_transaction(&self, transaction_id: &str) -> Vec<&MatchAllocation> {
        self.allocations
            .values()
            .filter(|a| a.transaction_id() == transaction_id)
            .collect()
    }

    pub fn allocations_for_target(&self, target: &AllocationTarget) -> Vec<&MatchAllocation> {
        self.allocations
            .values()
            .filter(|a| a.target() == target)
            .collect()
    }

    pub fn allocations_for_snapshot(&self, snapshot_id: &str) -> Vec<&MatchAllocation> {
        self.allocations
            .values()
            .filter(|a| a.snapshot_id() == snapshot_id)
            .collect()
    }

    pub fn update_allocation(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut MatchAllocation),
    ) -> Result<(), RepoError> {
        let snapshot_id = self.allocation(id)?.snapshot_id().to_string();
        self.assert_unlocked(&snapshot_id)?;
        if let Some(alloc) = self.allocations.get_mut(id) {
            f(alloc);
        }
        Ok(())
    }

    pub fn delete_allocation(&mut self, id: &str) -> Result<(), RepoError> {
        let snapshot_id = self.allocation(id)?.snapshot_id().to_string();
        self.assert_unlocked(&snapshot_id)?;
        self.allocations.remove(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // FX rates
    // ------------------------------------------------------------------

    /// Upsert a weekly rate row; the (snapshot, from, to, week) key is
    /// unique so re-setting a band replaces it
    pub fn upsert_fx_rate(&mut self, rate: WeeklyFxRate) -> Result<(), RepoError> {
        self.assert_unlocked(&rate.snapshot_id)?;
        let key = (
            rate.snapshot_id.clone(),
            rate.from_currency.clone(),
            rate.to_currency.clone(),
            rate.effective_week_start.to_string(),
        );
        self.fx_rates.insert(key, rate);
        Ok(())
    }

    pub fn fx_rates_for_snapshot(&self, snapshot_id: &str) -> Vec<&WeeklyFxRate> {
        self.fx_rates
            .values()
            .filter(|r| r.snapshot_id == snapshot_id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Segment and calibration statistics
    // ------------------------------------------------------------------

    pub fn upsert_segment_stats(&mut self, stats: SegmentDelayStats) -> Result<(), RepoError> {
        self.assert_unlocked(&stats.snapshot_id)?;
        let key = (
            stats.snapshot_id.clone(),
            stats.segment_type,
            stats.segment_key.clone(),
        );
        self.segment_stats.insert(key, stats);
        Ok(())
    }

    pub fn segment_stats(
        &self,
        snapshot_id: &str,
        level: SegmentLevel,
        segment_key: &str,
    ) -> Option<&SegmentDelayStats> {
        let key = (snapshot_id.to_string(), level, segment_key.to_string());
        self.segment_stats.get(&key)
    }

    pub fn segment_stats_for_snapshot(&self, snapshot_id: &str) -> Vec<&SegmentDelayStats> {
        self.segment_stats
            .values()
            .filter(|s| s.snapshot_id == snapshot_id)
            .collect()
    }

    pub fn upsert_calibration_stats(&mut self, stats: CalibrationStats) -> Result<(), RepoError> {
        self.assert_unlocked(&stats.snapshot_id)?;
        let key = (stats.snapshot_id.clone(), stats.segment_key.clone());
        self.calibration_stats.insert(key, stats);
        Ok(())
    }

    pub fn calibration_stats_for_snapshot(&self, snapshot_id: &str) -> Vec<&CalibrationStats> {
        self.calibration_stats
            .values()
            .filter(|c| c.snapshot_id == snapshot_id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Matching policies and payment-run exceptions
    // ------------------------------------------------------------------

    /// Insert or replace the policy with the same (entity, currency) scope
    pub fn set_matching_policy(&mut self, policy: MatchingPolicy) {
        self.matching_policies
            .retain(|p| !(p.entity_id == policy.entity_id && p.currency == policy.currency));
        self.matching_policies.push(policy);
    }

    pub fn matching_policies(&self) -> &[MatchingPolicy] {
        &self.matching_policies
    }

    pub fn insert_payment_run_exception(
        &mut self,
        exception: PaymentRunException,
    ) -> Result<(), RepoError> {
        self.assert_unlocked(&exception.snapshot_id)?;
        let key = (
            exception.snapshot_id.clone(),
            exception.bill_canonical_id.clone(),
        );
        self.payment_run_exceptions.insert(key, exception);
        Ok(())
    }

    pub fn payment_run_exception(
        &self,
        snapshot_id: &str,
        bill_canonical_id: &str,
    ) -> Option<&PaymentRunException> {
        let key = (snapshot_id.to_string(), bill_canonical_id.to_string());
        self.payment_run_exceptions.get(&key)
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// The audit log is append-only; this is the only mutator
    pub fn audit_mut(&mut self) -> &mut AuditLog {
        &mut self.audit
    }
}
