//! BankTransaction model
//!
//! An actual bank movement. Transactions belong to an entity, not a
//! snapshot: the same movement may be referenced by allocations from
//! several snapshots, which is what makes cross-lock variance analysis
//! possible.
//!
//! CRITICAL: All money values are i64 (cents); amounts are signed
//! (positive = inflow, negative = outflow)

use crate::models::Cents;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the transaction was reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationType {
    /// Tier 1: document number verbatim in reference, amount within
    /// tolerance
    Deterministic,

    /// Tier 2: amount + date window rule
    Rule,

    /// Tier 3: similarity candidate, requires human approval
    Suggested,

    /// Tier 4: user-initiated link
    Manual,
}

/// Workflow state of an unmatched transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    New,
    Assigned,
    InReview,
    Resolved,
    Escalated,
}

/// Invalid lifecycle transition
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid lifecycle transition: {from:?} -> {to:?}")]
pub struct LifecycleError {
    pub from: LifecycleStatus,
    pub to: LifecycleStatus,
}

/// An actual bank movement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    /// Row identifier (UUID)
    id: String,

    /// Owning entity (not snapshot)
    entity_id: String,

    bank_account_id: String,
    transaction_date: NaiveDate,

    /// Signed amount (i64 cents); positive = inflow
    amount: Cents,
    currency: String,

    counterparty: String,

    /// Free-text statement reference
    reference: String,

    reconciliation_type: Option<ReconciliationType>,
    is_reconciled: bool,

    /// Movement between the entity's own accounts; excluded from cash
    /// explanation metrics
    is_wash: bool,

    /// Bank fees consumed by this transaction's allocation (cents)
    fees: Cents,

    /// Write-offs consumed by this transaction's allocation (cents)
    writeoffs: Cents,

    assignee: Option<String>,
    lifecycle_status: LifecycleStatus,
    assigned_at: Option<NaiveDate>,
    sla_breach_at: Option<NaiveDate>,
}

impl BankTransaction {
    /// Create a new bank transaction
    pub fn new(
        entity_id: String,
        bank_account_id: String,
        transaction_date: NaiveDate,
        amount: Cents,
        currency: String,
        counterparty: String,
        reference: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id,
            bank_account_id,
            transaction_date,
            amount,
            currency,
            counterparty,
            reference,
            reconciliation_type: None,
            is_reconciled: false,
            is_wash: false,
            fees: 0,
            writeoffs: 0,
            assignee: None,
            lifecycle_status: LifecycleStatus::New,
            assigned_at: None,
            sla_breach_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn bank_account_id(&self) -> &str {
        &self.bank_account_id
    }

    pub fn transaction_date(&self) -> NaiveDate {
        self.transaction_date
    }

    /// Signed amount (i64 cents); positive = inflow
    pub fn amount(&self) -> Cents {
        self.amount
    }

    /// Absolute amount (i64 cents)
    pub fn abs_amount(&self) -> Cents {
        self.amount.abs()
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn counterparty(&self) -> &str {
        &self.counterparty
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn reconciliation_type(&self) -> Option<ReconciliationType> {
        self.reconciliation_type
    }

    pub fn is_reconciled(&self) -> bool {
        self.is_reconciled
    }

    pub fn is_wash(&self) -> bool {
        self.is_wash
    }

    pub fn fees(&self) -> Cents {
        self.fees
    }

    pub fn writeoffs(&self) -> Cents {
        self.writeoffs
    }

    pub fn assignee(&self) -> Option<&str> {
        self.assignee.as_deref()
    }

    pub fn lifecycle_status(&self) -> LifecycleStatus {
        self.lifecycle_status
    }

    pub fn assigned_at(&self) -> Option<NaiveDate> {
        self.assigned_at
    }

    pub fn sla_breach_at(&self) -> Option<NaiveDate> {
        self.sla_breach_at
    }

    /// Mark the transaction as a wash movement
    pub fn set_wash(&mut self, wash: bool) {
        self.is_wash = wash;
    }

    /// Record reconciliation outcome
    pub fn set_reconciliation(&mut self, rt: ReconciliationType, reconciled: bool) {
        self.reconciliation_type = Some(rt);
        self.is_reconciled = reconciled;
    }

    /// Record fees consumed by allocation
    pub fn set_fees(&mut self, fees: Cents) {
        self.fees = fees;
    }

    /// Record write-offs consumed by allocation
    pub fn set_writeoffs(&mut self, writeoffs: Cents) {
        self.writeoffs = writeoffs;
    }

    /// Assign the transaction to a user, deriving the SLA breach date
    pub fn assign(
        &mut self,
        assignee: String,
        assigned_at: NaiveDate,
        sla_breach_at: NaiveDate,
    ) -> Result<(), LifecycleError> {
        self.transition(LifecycleStatus::Assigned)?;
        self.assignee = Some(assignee);
        self.assigned_at = Some(assigned_at);
        self.sla_breach_at = Some(sla_breach_at);
        Ok(())
    }

    /// Apply a user-driven lifecycle transition
    ///
    /// Valid edges: New -> Assigned -> InReview -> Resolved | Escalated.
    pub fn transition(&mut self, to: LifecycleStatus) -> Result<(), LifecycleError> {
        use LifecycleStatus::{Assigned, Escalated, InReview, New, Resolved};
        let ok = matches!(
            (self.lifecycle_status, to),
            (New, Assigned) | (Assigned, InReview) | (InReview, Resolved) | (InReview, Escalated)
        );
        if ok {
            self.lifecycle_status = to;
            Ok(())
        } else {
            Err(LifecycleError {
                from: self.lifecycle_status,
                to,
            })
        }
    }
}
