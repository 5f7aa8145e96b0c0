//! Unmatched transaction lifecycle
//!
//! A bank transaction with no allocation starts as `New`. Assignment
//! moves it to `Assigned` and derives the SLA breach date from the
//! matching policy's business-day budget. The later states are
//! user-driven: `InReview -> Resolved | Escalated`.

use crate::core::calendar::add_business_days;
use crate::models::{LifecycleError, LifecycleStatus, MatchingPolicy};
use crate::repo::{RepoError, Repository};
use chrono::NaiveDate;
use thiserror::Error;

/// Lifecycle operation errors
#[derive(Debug, Error, PartialEq)]
pub enum WorkflowError {
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Assign an unmatched transaction to a user
///
/// Derives `sla_breach_at` as `assigned_at + sla_business_days` from the
/// resolved matching policy.
pub fn assign_transaction(
    repo: &mut Repository,
    transaction_id: &str,
    assignee: &str,
    assigned_at: NaiveDate,
) -> Result<NaiveDate, WorkflowError> {
    let txn = repo.bank_transaction(transaction_id)?;
    let policy = MatchingPolicy::resolve(
        repo.matching_policies(),
        txn.entity_id(),
        txn.currency(),
    );
    let sla_breach_at = add_business_days(assigned_at, policy.sla_business_days);

    let mut outcome: Result<(), LifecycleError> = Ok(());
    repo.update_bank_transaction(transaction_id, |txn| {
        outcome = txn.assign(assignee.to_string(), assigned_at, sla_breach_at);
    })?;
    outcome?;
    Ok(sla_breach_at)
}

/// Apply a user-driven lifecycle transition
pub fn transition_transaction(
    repo: &mut Repository,
    transaction_id: &str,
    to: LifecycleStatus,
) -> Result<(), WorkflowError> {
    repo.bank_transaction(transaction_id)?;
    let mut outcome: Result<(), LifecycleError> = Ok(());
    repo.update_bank_transaction(transaction_id, |txn| {
        outcome = txn.transition(to);
    })?;
    outcome?;
    Ok(())
}
