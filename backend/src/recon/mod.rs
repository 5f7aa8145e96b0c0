//! Reconciliation ladder
//!
//! Links bank transactions to invoices and bills through four tiers:
//!
//! 1. **Deterministic** - document number verbatim in the reference,
//!    amount within tolerance, counterparty similar (by policy).
//!    Auto-applied.
//! 2. **Rule** - amount within tolerance and date within the window.
//!    Auto-applied.
//! 3. **Suggested** - similarity-scored candidates. Never auto-applied;
//!    written unapproved and waiting for a human.
//! 4. **Manual** - user-initiated links (created through the engine).
//!
//! Matching runs over blocking indexes, allocates through the constrained
//! solver and returns conservation and no-overmatch proofs per
//! transaction. Re-running the ladder is idempotent: auto-created rows
//! are rebuilt from scratch, manual links and approved suggestions
//! survive.

pub mod blocking;
pub mod lifecycle;
pub mod matching;
pub mod solver;

pub use blocking::{BlockingIndex, MatchTarget, TargetKind};
pub use solver::{ConservationProof, NoOvermatchProof, SolveResult, SolverCandidate};

use crate::models::{
    AllocationTarget, Cents, MatchAllocation, MatchTier, MatchingPolicy, ReconciliationType,
};
use crate::progress::{CancellationToken, ProgressEvent, ProgressSink};
use crate::repo::{RepoError, Repository};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Reconciliation pipeline errors
#[derive(Debug, Error, PartialEq)]
pub enum ReconError {
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("reconciliation cancelled")]
    Cancelled,
}

/// Per-tier application counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TierCounts {
    pub tier1_deterministic: usize,
    pub tier2_rule: usize,
    pub tier3_suggested: usize,
}

/// Solver proofs for one transaction
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TransactionProofs {
    pub transaction_id: String,
    pub conservation: ConservationProof,
    pub no_overmatch: NoOvermatchProof,
    pub solver: crate::models::SolverKind,
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReconcileReport {
    pub counts: TierCounts,
    pub proofs: Vec<TransactionProofs>,
    pub unmatched: usize,
    pub wash_marked: usize,

    /// The deterministic similarity formula in force for this run
    pub similarity_formula: String,
}

/// Run the reconciliation ladder for an entity's transactions against a
/// snapshot's open documents
pub fn reconcile(
    repo: &mut Repository,
    entity_id: &str,
    snapshot_id: &str,
    cancel: &CancellationToken,
    sink: &mut dyn ProgressSink,
) -> Result<ReconcileReport, ReconError> {
    // surface a locked snapshot before any work
    let snapshot = repo.snapshot(snapshot_id)?;
    if snapshot.is_locked() {
        return Err(ReconError::Repo(RepoError::SnapshotLocked {
            snapshot_id: snapshot_id.to_string(),
        }));
    }
    let config = snapshot.config().clone();
    let entity = repo.entity(entity_id)?.clone();
    let snapshot_id = snapshot_id.to_string();
    let entity_id = entity_id.to_string();

    repo.with_transaction(|repo| {
        let mut report = ReconcileReport {
            similarity_formula: matching::SIMILARITY_FORMULA.to_string(),
            ..ReconcileReport::default()
        };

        // Stage 0: wash detection
        let txn_ids: Vec<String> = repo
            .bank_transactions_for_entity(&entity_id)
            .iter()
            .map(|t| t.id().to_string())
            .collect();
        for txn_id in &txn_ids {
            let is_wash = {
                let txn = repo.bank_transaction(txn_id)?;
                entity.is_internal_account(txn.counterparty())
            };
            if is_wash {
                repo.update_bank_transaction(txn_id, |t| t.set_wash(true))?;
                report.wash_marked += 1;
            }
        }

        // Stage 1: idempotency reset - rebuild auto-created rows
        let stale: Vec<String> = repo
            .allocations_for_snapshot(&snapshot_id)
            .iter()
            .filter(|a| {
                matches!(a.tier(), MatchTier::Deterministic | MatchTier::Rule)
                    || (a.tier() == MatchTier::Suggested && !a.is_approved())
            })
            .map(|a| a.id().to_string())
            .collect();
        for id in stale {
            repo.delete_allocation(&id)?;
        }

        // Stage 2: blocking indexes over open documents
        let invoice_index = build_invoice_index(repo, &snapshot_id);
        let bill_index = build_bill_index(repo, &snapshot_id);
        sink.report(ProgressEvent {
            pipeline: "reconcile".to_string(),
            stage: "blocking_index".to_string(),
            processed: invoice_index.targets().len() + bill_index.targets().len(),
            total: None,
        });
        if cancel.is_cancelled() {
            return Err(ReconError::Cancelled);
        }

        // Stage 3: the ladder, one transaction at a time
        for (i, txn_id) in txn_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ReconError::Cancelled);
            }
            run_ladder(
                repo,
                &snapshot_id,
                txn_id,
                &entity,
                &config,
                &invoice_index,
                &bill_index,
                &mut report,
            )?;
            if (i + 1) % 500 == 0 || i + 1 == txn_ids.len() {
                sink.report(ProgressEvent {
                    pipeline: "reconcile".to_string(),
                    stage: "ladder".to_string(),
                    processed: i + 1,
                    total: Some(txn_ids.len()),
                });
            }
        }

        Ok(report)
    })
}

fn build_invoice_index(repo: &Repository, snapshot_id: &str) -> BlockingIndex {
    let mut targets = Vec::new();
    for invoice in repo.invoices_for_snapshot(snapshot_id) {
        if !invoice.is_open() {
            continue;
        }
        targets.push(MatchTarget {
            kind: TargetKind::Invoice,
            target_id: invoice.id().to_string(),
            canonical_id: invoice.canonical_id().to_string(),
            doc_clean: crate::ingest::clean(invoice.document_number()),
            counterparty_key: crate::ingest::clean(invoice.customer()),
            counterparty_raw: invoice.customer().to_string(),
            amount: invoice.amount().abs(),
            open_amount: invoice.amount().abs(),
            expected_date: invoice.expected_due_date(),
            currency: invoice.currency().to_string(),
        });
    }
    targets.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
    BlockingIndex::build(targets)
}

fn build_bill_index(repo: &Repository, snapshot_id: &str) -> BlockingIndex {
    let mut targets = Vec::new();
    for bill in repo.bills_for_snapshot(snapshot_id) {
        targets.push(MatchTarget {
            kind: TargetKind::Bill,
            target_id: bill.id().to_string(),
            canonical_id: bill.canonical_id().to_string(),
            doc_clean: crate::ingest::clean(bill.canonical_id()),
            counterparty_key: crate::ingest::clean(bill.vendor()),
            counterparty_raw: bill.vendor().to_string(),
            amount: bill.amount().abs(),
            open_amount: bill.amount().abs(),
            expected_date: bill.due_date(),
            currency: bill.currency().to_string(),
        });
    }
    targets.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
    BlockingIndex::build(targets)
}

/// Remaining unallocated capacity of a target, live from the repository
fn remaining_capacity(repo: &Repository, target: &MatchTarget) -> Cents {
    let allocation_target = match target.kind {
        TargetKind::Invoice => AllocationTarget::Invoice(target.target_id.clone()),
        TargetKind::Bill => AllocationTarget::Bill(target.target_id.clone()),
    };
    let allocated: Cents = repo
        .allocations_for_target(&allocation_target)
        .iter()
        .map(|a| a.allocated_amount())
        .sum();
    (target.amount - allocated).max(0)
}

/// Remaining unexplained budget of a transaction
fn remaining_budget(repo: &Repository, txn_id: &str) -> Result<Cents, RepoError> {
    let txn = repo.bank_transaction(txn_id)?;
    let consumed: Cents = repo
        .allocations_for_transaction(txn_id)
        .iter()
        .map(|a| a.allocated_amount())
        .sum();
    Ok((txn.abs_amount() - txn.fees() - txn.writeoffs() - consumed).max(0))
}

#[allow(clippy::too_many_arguments)]
fn run_ladder(
    repo: &mut Repository,
    snapshot_id: &str,
    txn_id: &str,
    entity: &crate::models::Entity,
    config: &crate::models::SnapshotConfig,
    invoice_index: &BlockingIndex,
    bill_index: &BlockingIndex,
    report: &mut ReconcileReport,
) -> Result<(), ReconError> {
    let txn = repo.bank_transaction(txn_id)?.clone();
    if txn.is_wash() {
        return Ok(());
    }
    let budget = remaining_budget(repo, txn_id)?;
    if budget <= 0 {
        return Ok(());
    }

    let index = if txn.amount() >= 0 {
        invoice_index
    } else {
        bill_index
    };
    let policy = MatchingPolicy::resolve(repo.matching_policies(), entity.id(), txn.currency());

    // ---- Tier 1: deterministic document-number match --------------------
    let tier1: Vec<usize> = index
        .by_reference(txn.reference())
        .into_iter()
        .filter(|pos| {
            let t = index.target(*pos);
            t.currency == txn.currency()
                && (txn.abs_amount() - t.amount).abs() <= policy.amount_tolerance
                && (!policy.require_counterparty_tier1
                    || matching::counterparty_similar(txn.counterparty(), &t.counterparty_raw))
        })
        .collect();
    if !tier1.is_empty() && policy.auto_reconcile_tier1 {
        apply_tier(
            repo,
            snapshot_id,
            &txn,
            index,
            &tier1,
            MatchTier::Deterministic,
            config,
            &policy,
            report,
        )?;
        report.counts.tier1_deterministic += 1;
        return Ok(());
    }

    // ---- Tier 2: amount within tolerance, date within window ------------
    let amount_block = index.by_amount_range(txn.abs_amount(), policy.amount_tolerance);
    let week_block = index.by_week_window(txn.transaction_date(), policy.date_window_days);
    let tier2: Vec<usize> = amount_block
        .intersection(&week_block)
        .copied()
        .filter(|pos| {
            let t = index.target(*pos);
            t.currency == txn.currency()
                && t.expected_date.is_some_and(|due| {
                    (txn.transaction_date() - due).num_days().abs() <= policy.date_window_days
                })
        })
        .collect();
    if !tier2.is_empty() && policy.auto_reconcile_tier2 {
        apply_tier(
            repo,
            snapshot_id,
            &txn,
            index,
            &tier2,
            MatchTier::Rule,
            config,
            &policy,
            report,
        )?;
        report.counts.tier2_rule += 1;
        return Ok(());
    }

    // ---- Tier 3: similarity suggestions, never auto-applied -------------
    let mut tier3_pool: BTreeSet<usize> = index.by_counterparty(txn.counterparty());
    tier3_pool.extend(amount_block.iter().copied());
    tier3_pool.extend(week_block.iter().copied());

    let mut scored: Vec<(f64, usize)> = tier3_pool
        .into_iter()
        .filter(|pos| index.target(*pos).currency == txn.currency())
        .map(|pos| {
            let t = index.target(pos);
            let score = matching::tier3_score(
                txn.reference(),
                txn.counterparty(),
                &t.doc_clean,
                &t.counterparty_raw,
            );
            (score, pos)
        })
        .filter(|(score, _)| *score >= policy.suggestion_floor)
        .collect();
    scored.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| index.target(a.1).canonical_id.cmp(&index.target(b.1).canonical_id))
    });

    let mut suggested = false;
    for (_, pos) in scored.into_iter().take(3) {
        let target = index.target(pos);
        let capacity = remaining_capacity(repo, target);
        let amount = remaining_budget(repo, txn_id)?.min(capacity);
        if amount <= 0 {
            continue;
        }
        let allocation_target = match target.kind {
            TargetKind::Invoice => AllocationTarget::Invoice(target.target_id.clone()),
            TargetKind::Bill => AllocationTarget::Bill(target.target_id.clone()),
        };
        let alloc = MatchAllocation::new(
            txn.id().to_string(),
            allocation_target,
            snapshot_id.to_string(),
            amount,
            MatchTier::Suggested,
        )
        .map_err(|e| RepoError::Integrity(e.to_string()))?;
        repo.insert_allocation(alloc)?;
        suggested = true;
    }
    if suggested {
        repo.update_bank_transaction(txn_id, |t| {
            t.set_reconciliation(ReconciliationType::Suggested, false);
        })?;
        report.counts.tier3_suggested += 1;
    } else {
        report.unmatched += 1;
    }
    Ok(())
}

/// Allocate a transaction across its qualified tier candidates and write
/// the approved rows
#[allow(clippy::too_many_arguments)]
fn apply_tier(
    repo: &mut Repository,
    snapshot_id: &str,
    txn: &crate::models::BankTransaction,
    index: &BlockingIndex,
    positions: &[usize],
    tier: MatchTier,
    config: &crate::models::SnapshotConfig,
    policy: &MatchingPolicy,
    report: &mut ReconcileReport,
) -> Result<(), ReconError> {
    let candidates: Vec<SolverCandidate> = positions
        .iter()
        .map(|pos| {
            let t = index.target(*pos);
            SolverCandidate {
                target_id: t.target_id.clone(),
                canonical_id: t.canonical_id.clone(),
                open_amount: remaining_capacity(repo, t),
                ref_match: tier == MatchTier::Deterministic,
                amount_match: (txn.abs_amount() - t.amount).abs() <= policy.amount_tolerance,
                date_match: t.expected_date.is_some_and(|due| {
                    (txn.transaction_date() - due).num_days().abs() <= policy.date_window_days
                }),
                counterparty_match: matching::counterparty_similar(
                    txn.counterparty(),
                    &t.counterparty_raw,
                ),
            }
        })
        .collect();

    let result = solver::solve(
        txn.abs_amount(),
        txn.fees(),
        txn.writeoffs(),
        &candidates,
        config.lp_candidate_cap,
        Duration::from_millis(config.lp_timeout_ms),
    );

    let kind_of = |target_id: &str| {
        positions
            .iter()
            .map(|pos| index.target(*pos))
            .find(|t| t.target_id == target_id)
            .map(|t| t.kind)
    };

    for planned in &result.allocations {
        let allocation_target = match kind_of(&planned.target_id) {
            Some(TargetKind::Invoice) => AllocationTarget::Invoice(planned.target_id.clone()),
            Some(TargetKind::Bill) => AllocationTarget::Bill(planned.target_id.clone()),
            None => continue,
        };
        let alloc = MatchAllocation::new(
            txn.id().to_string(),
            allocation_target,
            snapshot_id.to_string(),
            planned.amount,
            tier,
        )
        .map_err(|e| RepoError::Integrity(e.to_string()))?
        .with_solver(result.solver)
        .auto_approved();
        repo.insert_allocation(alloc)?;
    }

    let fully_explained = result.residual_unallocated == 0;
    let recon_type = match tier {
        MatchTier::Deterministic => ReconciliationType::Deterministic,
        MatchTier::Rule => ReconciliationType::Rule,
        MatchTier::Suggested => ReconciliationType::Suggested,
        MatchTier::Manual => ReconciliationType::Manual,
    };
    repo.update_bank_transaction(txn.id(), |t| {
        t.set_reconciliation(recon_type, fully_explained);
    })?;

    report.proofs.push(TransactionProofs {
        transaction_id: txn.id().to_string(),
        conservation: result.conservation,
        no_overmatch: result.no_overmatch,
        solver: result.solver,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BankTransaction, Entity, Invoice, Snapshot, SnapshotConfig};
    use crate::progress::NullSink;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn setup() -> (Repository, String) {
        let mut repo = Repository::new();
        repo.insert_entity(
            Entity::new("E1".to_string(), "EUR".to_string(), 4)
                .with_internal_accounts(vec!["TREASURY-2".to_string()]),
        )
        .unwrap();
        let snapshot = Snapshot::new("E1".to_string(), d(2024, 3, 11), 0, SnapshotConfig::default());
        let sid = snapshot.id().to_string();
        repo.insert_snapshot(snapshot).unwrap();
        (repo, sid)
    }

    fn invoice(sid: &str, doc: &str, customer: &str, amount: Cents, due: NaiveDate) -> Invoice {
        Invoice::new(
            sid.to_string(),
            format!("c-{doc}"),
            "E1".to_string(),
            "invoice".to_string(),
            doc.to_string(),
            customer.to_string(),
            "DE".to_string(),
            "NET30".to_string(),
            amount,
            "EUR".to_string(),
            d(2024, 2, 1),
        )
        .with_due_date(due)
    }

    fn txn(amount: Cents, counterparty: &str, reference: &str) -> BankTransaction {
        BankTransaction::new(
            "E1".to_string(),
            "ACC".to_string(),
            d(2024, 3, 12),
            amount,
            "EUR".to_string(),
            counterparty.to_string(),
            reference.to_string(),
        )
    }

    fn run(repo: &mut Repository, sid: &str) -> ReconcileReport {
        reconcile(repo, "E1", sid, &CancellationToken::new(), &mut NullSink).unwrap()
    }

    #[test]
    fn test_tier1_document_number_in_reference() {
        let (mut repo, sid) = setup();
        let inv = invoice(&sid, "INV-7781", "ACME GmbH", 100_000, d(2024, 3, 10));
        let inv_id = inv.id().to_string();
        repo.insert_invoice(inv).unwrap();
        repo.insert_bank_transaction(txn(100_000, "ACME GmbH", "payment INV-7781"))
            .unwrap();

        let report = run(&mut repo, &sid);
        assert_eq!(report.counts.tier1_deterministic, 1);
        assert_eq!(report.proofs.len(), 1);
        assert!(report.proofs[0].conservation.is_conserved);

        let allocs =
            repo.allocations_for_target(&AllocationTarget::Invoice(inv_id));
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].allocated_amount(), 100_000);
        assert_eq!(allocs[0].tier(), MatchTier::Deterministic);
        assert!(allocs[0].is_approved());
    }

    #[test]
    fn test_tier2_amount_and_date_window() {
        let (mut repo, sid) = setup();
        repo.insert_invoice(invoice(&sid, "INV-1", "ACME GmbH", 55_000, d(2024, 3, 10)))
            .unwrap();
        // reference does not carry the document number
        repo.insert_bank_transaction(txn(55_000, "ACME GmbH", "sammelzahlung"))
            .unwrap();

        let report = run(&mut repo, &sid);
        assert_eq!(report.counts.tier1_deterministic, 0);
        assert_eq!(report.counts.tier2_rule, 1);
    }

    #[test]
    fn test_tier3_is_written_unapproved() {
        let (mut repo, sid) = setup();
        let inv = invoice(&sid, "INV-9", "Mueller Logistics", 70_000, d(2024, 3, 10));
        let inv_id = inv.id().to_string();
        repo.insert_invoice(inv).unwrap();
        // amount off by more than tolerance, but reference and names align
        repo.insert_bank_transaction(txn(
            68_000,
            "Muelelr Logistics GmbH",
            "rechnung INV-9 Mueller Logistics",
        ))
        .unwrap();

        let report = run(&mut repo, &sid);
        assert_eq!(report.counts.tier2_rule, 0);
        assert_eq!(report.counts.tier3_suggested, 1);

        let allocs = repo.allocations_for_target(&AllocationTarget::Invoice(inv_id));
        assert_eq!(allocs.len(), 1);
        assert!(!allocs[0].is_approved());
        assert_eq!(allocs[0].tier(), MatchTier::Suggested);

        let t = repo.bank_transactions_for_entity("E1");
        assert_eq!(
            t[0].reconciliation_type(),
            Some(ReconciliationType::Suggested)
        );
        assert!(!t[0].is_reconciled());
    }

    #[test]
    fn test_combination_payment_splits_across_invoices() {
        let (mut repo, sid) = setup();
        repo.insert_invoice(invoice(&sid, "INV-A", "ACME GmbH", 400_000, d(2024, 3, 10)))
            .unwrap();
        repo.insert_invoice(invoice(&sid, "INV-B", "ACME GmbH", 350_000, d(2024, 3, 12)))
            .unwrap();
        repo.insert_invoice(invoice(&sid, "INV-C", "ACME GmbH", 250_000, d(2024, 3, 14)))
            .unwrap();
        let t = txn(1_000_000, "ACME GmbH", "INV-A INV-B INV-C collective");
        let txn_id = t.id().to_string();
        repo.insert_bank_transaction(t).unwrap();

        // tier-1 amount tolerance would reject each single invoice, so
        // widen tolerance: the reference names all three documents
        repo.set_matching_policy(MatchingPolicy {
            amount_tolerance: 1_000_000,
            ..MatchingPolicy::default()
        });

        let report = run(&mut repo, &sid);
        assert_eq!(report.counts.tier1_deterministic, 1);
        let allocs = repo.allocations_for_transaction(&txn_id);
        let total: Cents = allocs.iter().map(|a| a.allocated_amount()).sum();
        assert_eq!(total, 1_000_000);
        assert!(report.proofs[0].conservation.is_conserved);
        assert!(report.proofs[0].no_overmatch.is_valid);
    }

    #[test]
    fn test_wash_transactions_are_marked_and_skipped() {
        let (mut repo, sid) = setup();
        repo.insert_bank_transaction(txn(500_000, "TREASURY-2", "internal sweep"))
            .unwrap();
        let report = run(&mut repo, &sid);
        assert_eq!(report.wash_marked, 1);
        assert_eq!(report.unmatched, 0);
        assert!(repo.bank_transactions_for_entity("E1")[0].is_wash());
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let (mut repo, sid) = setup();
        repo.insert_invoice(invoice(&sid, "INV-7781", "ACME GmbH", 100_000, d(2024, 3, 10)))
            .unwrap();
        repo.insert_bank_transaction(txn(100_000, "ACME GmbH", "payment INV-7781"))
            .unwrap();

        let first = run(&mut repo, &sid);
        let allocations_after_first = repo.allocations_for_snapshot(&sid).len();
        let second = run(&mut repo, &sid);
        assert_eq!(first.counts, second.counts);
        assert_eq!(repo.allocations_for_snapshot(&sid).len(), allocations_after_first);
    }

    #[test]
    fn test_locked_snapshot_rejects_reconcile() {
        let (mut repo, sid) = setup();
        repo.modify_snapshot(&sid, |s| {
            s.lock(
                crate::models::LockType::Standard,
                "cfo".to_string(),
                None,
                "digest".to_string(),
            )
            .unwrap();
        })
        .unwrap();
        let err = reconcile(
            &mut repo,
            "E1",
            &sid,
            &CancellationToken::new(),
            &mut NullSink,
        )
        .unwrap_err();
        assert!(matches!(err, ReconError::Repo(RepoError::SnapshotLocked { .. })));
    }
}
