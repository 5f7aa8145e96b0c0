//! Constrained many-to-many allocation solver
//!
//! Splits one bank transaction across its candidate documents:
//!
//! ```text
//! maximize   sum(quality_i * x_i)
//! subject to sum(x_i) + fees + writeoffs = |txn.amount|
//!            0 <= x_i <= open_amount_i
//! ```
//!
//! With a single coupling constraint and box bounds, the optimum is the
//! quality-descending waterfill, so the exact solve is cheap and fully
//! deterministic. The program runs in two phases: plan the allocation
//! against candidate capacities (no state changes), then let the caller
//! commit the planned rows atomically. Every solve returns machine-
//! checkable conservation and no-overmatch proofs.
//!
//! Degraded paths are annotated, never silent: an oversized candidate
//! set or a wall-clock cap expiry switches the solver tag to `Greedy`.

use crate::models::{Cents, SolverKind};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Objective weights; pinned by tests so they cannot drift silently
pub const QUALITY_REF_MATCH: f64 = 100.0;
pub const QUALITY_AMOUNT_MATCH: f64 = 50.0;
pub const QUALITY_DATE_MATCH: f64 = 25.0;
pub const QUALITY_COUNTERPARTY_MATCH: f64 = 10.0;

/// Conservation tolerance: one cent
pub const CONSERVATION_TOLERANCE: Cents = 1;

/// One candidate document for a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverCandidate {
    /// Row id of the invoice or bill
    pub target_id: String,
    pub canonical_id: String,

    /// Remaining unallocated capacity (cents, >= 0)
    pub open_amount: Cents,

    pub ref_match: bool,
    pub amount_match: bool,
    pub date_match: bool,
    pub counterparty_match: bool,
}

impl SolverCandidate {
    /// Objective coefficient for this candidate
    pub fn quality(&self) -> f64 {
        let mut q = 0.0;
        if self.ref_match {
            q += QUALITY_REF_MATCH;
        }
        if self.amount_match {
            q += QUALITY_AMOUNT_MATCH;
        }
        if self.date_match {
            q += QUALITY_DATE_MATCH;
        }
        if self.counterparty_match {
            q += QUALITY_COUNTERPARTY_MATCH;
        }
        q
    }
}

/// One planned allocation line (not yet written)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAllocation {
    pub target_id: String,
    pub canonical_id: String,
    pub amount: Cents,
}

/// Machine-checkable witness that the plan conserves the transaction
/// amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConservationProof {
    pub is_conserved: bool,
    pub expected_total: Cents,
    pub actual_total: Cents,
    pub difference: Cents,
    pub proof: String,
}

/// Witness that no candidate received more than its open amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoOvermatchProof {
    pub is_valid: bool,
    pub lines: Vec<String>,
}

/// Full solver outcome for one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveResult {
    pub allocations: Vec<PlannedAllocation>,

    /// Transaction amount left unallocated when candidate capacity ran
    /// out; recorded, never fabricated into an allocation
    pub residual_unallocated: Cents,

    pub solver: SolverKind,
    pub conservation: ConservationProof,
    pub no_overmatch: NoOvermatchProof,
}

/// Solve the allocation for one transaction
///
/// * `txn_abs_amount` - |transaction amount| (cents)
/// * `fees`, `writeoffs` - amounts already explained outside allocations
/// * `candidate_cap` - above this size the greedy path is used
/// * `timeout` - wall-clock cap; expiry degrades the annotation
pub fn solve(
    txn_abs_amount: Cents,
    fees: Cents,
    writeoffs: Cents,
    candidates: &[SolverCandidate],
    candidate_cap: usize,
    timeout: Duration,
) -> SolveResult {
    let started = Instant::now();
    let mut solver = if candidates.len() > candidate_cap {
        SolverKind::Greedy
    } else {
        SolverKind::Lp
    };

    let budget = (txn_abs_amount - fees - writeoffs).max(0);

    // Quality-descending order; canonical id breaks ties so the plan is
    // stable under input shuffling
    let mut ordered: Vec<&SolverCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        b.quality()
            .total_cmp(&a.quality())
            .then_with(|| a.canonical_id.cmp(&b.canonical_id))
    });

    let mut allocations = Vec::new();
    let mut remaining = budget;
    for candidate in ordered {
        if remaining <= 0 {
            break;
        }
        if started.elapsed() > timeout {
            solver = SolverKind::Greedy;
        }
        let take = remaining.min(candidate.open_amount.max(0));
        if take <= 0 {
            continue;
        }
        allocations.push(PlannedAllocation {
            target_id: candidate.target_id.clone(),
            canonical_id: candidate.canonical_id.clone(),
            amount: take,
        });
        remaining -= take;
    }

    let allocated: Cents = allocations.iter().map(|a| a.amount).sum();
    let residual = budget - allocated;
    let actual_total = allocated + fees + writeoffs + residual;
    let difference = txn_abs_amount - actual_total;
    let conservation = ConservationProof {
        is_conserved: difference.abs() <= CONSERVATION_TOLERANCE,
        expected_total: txn_abs_amount,
        actual_total,
        difference,
        proof: format!(
            "allocated={allocated} + fees={fees} + writeoffs={writeoffs} + residual={residual} \
             = {actual_total}, expected |txn| = {txn_abs_amount}"
        ),
    };

    let mut lines = Vec::new();
    let mut overmatch_ok = true;
    for candidate in candidates {
        let given: Cents = allocations
            .iter()
            .filter(|a| a.target_id == candidate.target_id)
            .map(|a| a.amount)
            .sum();
        if given > candidate.open_amount {
            overmatch_ok = false;
        }
        if given > 0 {
            lines.push(format!(
                "target={} allocated={given} open={}",
                candidate.target_id, candidate.open_amount
            ));
        }
    }

    SolveResult {
        allocations,
        residual_unallocated: residual,
        solver,
        conservation,
        no_overmatch: NoOvermatchProof {
            is_valid: overmatch_ok,
            lines,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, open: Cents, quality_flags: (bool, bool, bool, bool)) -> SolverCandidate {
        SolverCandidate {
            target_id: id.to_string(),
            canonical_id: id.to_string(),
            open_amount: open,
            ref_match: quality_flags.0,
            amount_match: quality_flags.1,
            date_match: quality_flags.2,
            counterparty_match: quality_flags.3,
        }
    }

    #[test]
    fn test_objective_weights_are_pinned() {
        let all = candidate("A", 1, (true, true, true, true));
        assert_eq!(all.quality(), 185.0);
        assert_eq!(QUALITY_REF_MATCH, 100.0);
        assert_eq!(QUALITY_AMOUNT_MATCH, 50.0);
        assert_eq!(QUALITY_DATE_MATCH, 25.0);
        assert_eq!(QUALITY_COUNTERPARTY_MATCH, 10.0);
    }

    #[test]
    fn test_exact_fill_across_three_invoices() {
        // 10,000.00 against 4,000 / 3,500 / 2,500: full coverage
        let candidates = vec![
            candidate("A", 400_000, (true, false, true, true)),
            candidate("B", 350_000, (false, true, true, false)),
            candidate("C", 250_000, (false, false, true, false)),
        ];
        let result = solve(
            1_000_000,
            0,
            0,
            &candidates,
            50,
            Duration::from_millis(2000),
        );
        let total: Cents = result.allocations.iter().map(|a| a.amount).sum();
        assert_eq!(total, 1_000_000);
        assert_eq!(result.residual_unallocated, 0);
        assert!(result.conservation.is_conserved);
        assert!(result.no_overmatch.is_valid);
        assert_eq!(result.solver, SolverKind::Lp);
    }

    #[test]
    fn test_over_open_transaction_records_residual() {
        // 15,000.00 against 10,000.00 of capacity
        let candidates = vec![
            candidate("A", 400_000, (true, false, false, false)),
            candidate("B", 350_000, (true, false, false, false)),
            candidate("C", 250_000, (true, false, false, false)),
        ];
        let result = solve(
            1_500_000,
            0,
            0,
            &candidates,
            50,
            Duration::from_millis(2000),
        );
        let total: Cents = result.allocations.iter().map(|a| a.amount).sum();
        assert_eq!(total, 1_000_000);
        assert_eq!(result.residual_unallocated, 500_000);
        assert!(result.conservation.is_conserved);
        assert!(result.no_overmatch.is_valid);
        for (alloc, cand) in result.allocations.iter().zip(&candidates) {
            assert!(alloc.amount <= cand.open_amount);
        }
    }

    #[test]
    fn test_quality_order_decides_who_gets_filled() {
        let candidates = vec![
            candidate("LOW", 500, (false, false, false, true)),
            candidate("HIGH", 500, (true, true, true, true)),
        ];
        let result = solve(600, 0, 0, &candidates, 50, Duration::from_millis(2000));
        assert_eq!(result.allocations[0].target_id, "HIGH");
        assert_eq!(result.allocations[0].amount, 500);
        assert_eq!(result.allocations[1].target_id, "LOW");
        assert_eq!(result.allocations[1].amount, 100);
    }

    #[test]
    fn test_fees_and_writeoffs_reduce_the_budget() {
        let candidates = vec![candidate("A", 10_000, (true, false, false, false))];
        let result = solve(10_000, 300, 200, &candidates, 50, Duration::from_millis(2000));
        let total: Cents = result.allocations.iter().map(|a| a.amount).sum();
        assert_eq!(total, 9_500);
        assert!(result.conservation.is_conserved);
        assert_eq!(result.conservation.actual_total, 10_000);
    }

    #[test]
    fn test_oversized_candidate_set_degrades_to_greedy() {
        let candidates: Vec<SolverCandidate> = (0..60)
            .map(|i| candidate(&format!("C{i:03}"), 100, (false, true, false, false)))
            .collect();
        let result = solve(5_000, 0, 0, &candidates, 50, Duration::from_millis(2000));
        assert_eq!(result.solver, SolverKind::Greedy);
        assert!(result.conservation.is_conserved);
    }

    #[test]
    fn test_tie_break_is_stable_under_shuffle() {
        let a = vec![
            candidate("B", 100, (true, false, false, false)),
            candidate("A", 100, (true, false, false, false)),
        ];
        let b: Vec<SolverCandidate> = a.iter().rev().cloned().collect();
        let ra = solve(150, 0, 0, &a, 50, Duration::from_millis(2000));
        let rb = solve(150, 0, 0, &b, 50, Duration::from_millis(2000));
        assert_eq!(ra.allocations, rb.allocations);
        assert_eq!(ra.allocations[0].target_id, "A");
    }
}
