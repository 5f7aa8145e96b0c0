//! MatchAllocation model
//!
//! A link from one bank transaction to one invoice or bill, carrying the
//! allocated amount and the ladder tier that produced it.
//!
//! # Critical Invariants
//!
//! 1. Target is an invoice XOR a bill
//! 2. Allocated amount is non-negative
//! 3. Per invoice: sum of allocations never exceeds the invoice amount
//! 4. Per transaction: allocations + fees + writeoffs never exceed |amount|
//!
//! Invariants 3 and 4 are enforced by the repository and proven by the
//! allocation solver; this model enforces 1 and 2.

use crate::models::Cents;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ladder tier that produced an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchTier {
    /// Tier 1: deterministic document-number match
    Deterministic = 1,

    /// Tier 2: amount + date-window rule
    Rule = 2,

    /// Tier 3: similarity suggestion, never auto-applied
    Suggested = 3,

    /// Tier 4: manual link
    Manual = 4,
}

/// Which solver path produced the allocation amounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    /// Exact solve of the constrained program
    Lp,

    /// Degraded path: oversized candidate set or wall-clock cap hit
    Greedy,
}

/// The invoice or bill an allocation points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationTarget {
    Invoice(String),
    Bill(String),
}

impl AllocationTarget {
    /// Row id of the target, regardless of kind
    pub fn row_id(&self) -> &str {
        match self {
            AllocationTarget::Invoice(id) | AllocationTarget::Bill(id) => id,
        }
    }
}

/// Errors raised when constructing or approving allocations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("allocated amount must be non-negative, got {0}")]
    NegativeAmount(Cents),

    #[error("allocation already approved")]
    AlreadyApproved,
}

/// A transaction-to-document link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchAllocation {
    /// Row identifier (UUID)
    id: String,

    transaction_id: String,
    target: AllocationTarget,

    /// Snapshot owning the target document (denormalized for the
    /// immutability guard and variance diffs)
    snapshot_id: String,

    /// Allocated amount (i64 cents, >= 0, transaction currency)
    allocated_amount: Cents,

    tier: MatchTier,
    solver: Option<SolverKind>,

    approved: bool,
    approved_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl MatchAllocation {
    /// Create a new allocation
    pub fn new(
        transaction_id: String,
        target: AllocationTarget,
        snapshot_id: String,
        allocated_amount: Cents,
        tier: MatchTier,
    ) -> Result<Self, AllocationError> {
        if allocated_amount < 0 {
            return Err(AllocationError::NegativeAmount(allocated_amount));
        }
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_id,
            target,
            snapshot_id,
            allocated_amount,
            tier,
            solver: None,
            approved: false,
            approved_by: None,
            created_at: Utc::now(),
        })
    }

    /// Annotate which solver path produced the amount (builder pattern)
    pub fn with_solver(mut self, solver: SolverKind) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Mark auto-applied tiers (1 and 2) as approved at creation (builder)
    pub fn auto_approved(mut self) -> Self {
        self.approved = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn target(&self) -> &AllocationTarget {
        &self.target
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    /// Allocated amount (i64 cents)
    pub fn allocated_amount(&self) -> Cents {
        self.allocated_amount
    }

    pub fn tier(&self) -> MatchTier {
        self.tier
    }

    pub fn solver(&self) -> Option<SolverKind> {
        self.solver
    }

    pub fn is_approved(&self) -> bool {
        self.approved
    }

    pub fn approved_by(&self) -> Option<&str> {
        self.approved_by.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Approve a suggested or manual allocation
    pub fn approve(&mut self, user: String) -> Result<(), AllocationError> {
        if self.approved {
            return Err(AllocationError::AlreadyApproved);
        }
        self.approved = true;
        self.approved_by = Some(user);
        Ok(())
    }
}
