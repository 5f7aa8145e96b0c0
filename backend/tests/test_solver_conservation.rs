//! Allocation solver conservation tests
//!
//! The solver must return machine-checkable proofs: allocations plus
//! fees, writeoffs and residual always equal the transaction amount, and
//! no candidate ever receives more than its open amount.

use std::time::Duration;
use treasury_core_rs::models::SolverKind;
use treasury_core_rs::recon::solver::{
    solve, SolverCandidate, QUALITY_AMOUNT_MATCH, QUALITY_COUNTERPARTY_MATCH, QUALITY_DATE_MATCH,
    QUALITY_REF_MATCH,
};
use treasury_core_rs::Cents;

fn candidate(id: &str, open: Cents) -> SolverCandidate {
    SolverCandidate {
        target_id: id.to_string(),
        canonical_id: id.to_string(),
        open_amount: open,
        ref_match: true,
        amount_match: false,
        date_match: true,
        counterparty_match: true,
    }
}

const TIMEOUT: Duration = Duration::from_millis(2000);

#[test]
fn test_objective_weights_pinned_against_drift() {
    assert_eq!(QUALITY_REF_MATCH, 100.0);
    assert_eq!(QUALITY_AMOUNT_MATCH, 50.0);
    assert_eq!(QUALITY_DATE_MATCH, 25.0);
    assert_eq!(QUALITY_COUNTERPARTY_MATCH, 10.0);
}

#[test]
fn test_exact_cover_ten_thousand() {
    // 10,000.00 over 4,000 / 3,500 / 2,500, no fees, no writeoffs
    let candidates = vec![
        candidate("A", 400_000),
        candidate("B", 350_000),
        candidate("C", 250_000),
    ];
    let result = solve(1_000_000, 0, 0, &candidates, 50, TIMEOUT);

    let allocated: Cents = result.allocations.iter().map(|a| a.amount).sum();
    assert!((allocated - 1_000_000).abs() <= 1);
    assert_eq!(result.residual_unallocated, 0);
    assert!(result.conservation.is_conserved);
    assert!(!result.conservation.proof.is_empty());
    assert!(result.no_overmatch.is_valid);
    for alloc in &result.allocations {
        let open = candidates
            .iter()
            .find(|c| c.target_id == alloc.target_id)
            .unwrap()
            .open_amount;
        assert!(alloc.amount <= open);
    }
}

#[test]
fn test_over_open_transaction_never_fabricates() {
    // 15,000.00 against 10,000.00 of open capacity
    let candidates = vec![
        candidate("A", 400_000),
        candidate("B", 350_000),
        candidate("C", 250_000),
    ];
    let result = solve(1_500_000, 0, 0, &candidates, 50, TIMEOUT);

    let allocated: Cents = result.allocations.iter().map(|a| a.amount).sum();
    assert_eq!(allocated, 1_000_000);
    assert_eq!(result.residual_unallocated, 500_000);
    assert!(result.conservation.is_conserved);
    assert!(result.no_overmatch.is_valid);
}

#[test]
fn test_partial_capacity_consumption() {
    // an invoice already half-allocated offers only its remainder
    let candidates = vec![candidate("A", 120_000)];
    let result = solve(500_000, 0, 0, &candidates, 50, TIMEOUT);
    assert_eq!(result.allocations[0].amount, 120_000);
    assert_eq!(result.residual_unallocated, 380_000);
    assert!(result.conservation.is_conserved);
}

#[test]
fn test_candidate_cap_triggers_greedy_annotation() {
    let candidates: Vec<SolverCandidate> =
        (0..80).map(|i| candidate(&format!("C{i:03}"), 10_000)).collect();
    let result = solve(200_000, 0, 0, &candidates, 50, TIMEOUT);
    assert_eq!(result.solver, SolverKind::Greedy);
    assert!(result.conservation.is_conserved);
    assert!(result.no_overmatch.is_valid);
}

#[test]
fn test_zero_budget_allocates_nothing() {
    let candidates = vec![candidate("A", 100)];
    let result = solve(500, 300, 200, &candidates, 50, TIMEOUT);
    assert!(result.allocations.is_empty());
    assert_eq!(result.residual_unallocated, 0);
    assert!(result.conservation.is_conserved);
}
