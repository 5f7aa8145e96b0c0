//! End-to-end reconciliation ladder tests through the engine

use chrono::NaiveDate;
use treasury_core_rs::models::{
    AllocationTarget, BankTransaction, Entity, LifecycleStatus, MatchTier, MatchingPolicy,
    ReconciliationType,
};
use treasury_core_rs::{Cents, IngestRecord, TreasuryEngine};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn invoice_record(doc: &str, customer: &str, amount: f64, due: NaiveDate) -> IngestRecord {
    let mut r = IngestRecord::receivable(
        "erp".to_string(),
        "ACME_DE".to_string(),
        doc.to_string(),
        customer.to_string(),
        amount,
        "EUR".to_string(),
        d(2024, 2, 1),
    );
    r.due_date = Some(due);
    r
}

fn txn(amount: Cents, counterparty: &str, reference: &str) -> BankTransaction {
    BankTransaction::new(
        "ACME_DE".to_string(),
        "MAIN-ACC".to_string(),
        d(2024, 3, 12),
        amount,
        "EUR".to_string(),
        counterparty.to_string(),
        reference.to_string(),
    )
}

fn engine_with_snapshot() -> (TreasuryEngine, String) {
    let mut engine = TreasuryEngine::new();
    engine
        .register_entity(Entity::new("ACME_DE".to_string(), "EUR".to_string(), 4))
        .unwrap();
    let lineage = engine
        .create_snapshot("ACME_DE", d(2024, 3, 11), 0, None, "treasurer")
        .unwrap();
    (engine, lineage.snapshot_id)
}

#[test]
fn test_tier1_match_reconciles_and_proves_conservation() {
    let (mut engine, sid) = engine_with_snapshot();
    engine
        .ingest_records(
            &sid,
            &[invoice_record("INV-7781", "ACME GmbH", 1000.0, d(2024, 3, 10))],
            "t",
        )
        .unwrap();
    engine
        .register_bank_transaction(txn(100_000, "ACME GmbH", "payment INV-7781"))
        .unwrap();

    let report = engine.reconcile("ACME_DE", &sid, "analyst").unwrap();
    assert_eq!(report.counts.tier1_deterministic, 1);
    assert_eq!(report.unmatched, 0);
    assert!(report.proofs[0].conservation.is_conserved);
    assert!(report.proofs[0].no_overmatch.is_valid);

    let movements = engine.repository().bank_transactions_for_entity("ACME_DE");
    assert!(movements[0].is_reconciled());
    assert_eq!(
        movements[0].reconciliation_type(),
        Some(ReconciliationType::Deterministic)
    );
}

#[test]
fn test_combination_payment_through_engine() {
    let (mut engine, sid) = engine_with_snapshot();
    engine
        .ingest_records(
            &sid,
            &[
                invoice_record("INV-A1", "ACME GmbH", 4000.0, d(2024, 3, 8)),
                invoice_record("INV-B2", "ACME GmbH", 3500.0, d(2024, 3, 10)),
                invoice_record("INV-C3", "ACME GmbH", 2500.0, d(2024, 3, 12)),
            ],
            "t",
        )
        .unwrap();
    // reference lists all three documents; tolerance widened so the
    // collective amount qualifies
    engine
        .set_matching_policy(
            MatchingPolicy {
                entity_id: Some("ACME_DE".to_string()),
                amount_tolerance: 1_000_000,
                ..MatchingPolicy::default()
            },
            "admin",
        )
        .unwrap();
    let txn_row = txn(1_000_000, "ACME GmbH", "collective INV-A1 INV-B2 INV-C3");
    let txn_id = txn_row.id().to_string();
    engine.register_bank_transaction(txn_row).unwrap();

    let report = engine.reconcile("ACME_DE", &sid, "analyst").unwrap();
    assert_eq!(report.counts.tier1_deterministic, 1);

    let allocations = engine.repository().allocations_for_transaction(&txn_id);
    assert_eq!(allocations.len(), 3);
    let total: Cents = allocations.iter().map(|a| a.allocated_amount()).sum();
    assert_eq!(total, 1_000_000);
}

#[test]
fn test_suggestion_requires_human_approval() {
    let (mut engine, sid) = engine_with_snapshot();
    engine
        .ingest_records(
            &sid,
            &[invoice_record(
                "INV-9",
                "Mueller Logistics",
                700.0,
                d(2024, 3, 10),
            )],
            "t",
        )
        .unwrap();
    let txn_row = txn(68_000, "Muelelr Logistics GmbH", "rechnung INV-9 Mueller Logistics");
    let txn_id = txn_row.id().to_string();
    engine.register_bank_transaction(txn_row).unwrap();

    let report = engine.reconcile("ACME_DE", &sid, "analyst").unwrap();
    assert_eq!(report.counts.tier3_suggested, 1);

    let suggestion_id = {
        let allocations = engine.repository().allocations_for_transaction(&txn_id);
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].tier(), MatchTier::Suggested);
        assert!(!allocations[0].is_approved());
        allocations[0].id().to_string()
    };
    // not reconciled until a human approves
    assert!(!engine.repository().bank_transactions_for_entity("ACME_DE")[0].is_reconciled());

    engine.approve_match(&suggestion_id, "cfo").unwrap();
    let allocations = engine.repository().allocations_for_transaction(&txn_id);
    assert!(allocations[0].is_approved());
    assert_eq!(allocations[0].approved_by(), Some("cfo"));
    // the suggestion covers 680.00 of a 680.00 transaction: reconciled
    assert!(engine.repository().bank_transactions_for_entity("ACME_DE")[0].is_reconciled());
}

#[test]
fn test_manual_match_is_tier4() {
    let (mut engine, sid) = engine_with_snapshot();
    engine
        .ingest_records(
            &sid,
            &[invoice_record("INV-X", "Opaque Corp", 420.0, d(2024, 3, 10))],
            "t",
        )
        .unwrap();
    let txn_row = txn(42_000, "Somebody", "no usable reference");
    let txn_id = txn_row.id().to_string();
    engine.register_bank_transaction(txn_row).unwrap();

    let invoice_id = engine.repository().invoices_for_snapshot(&sid)[0]
        .id()
        .to_string();
    engine
        .create_manual_match(
            &txn_id,
            AllocationTarget::Invoice(invoice_id),
            42_000,
            "analyst",
        )
        .unwrap();

    let movements = engine.repository().bank_transactions_for_entity("ACME_DE");
    assert!(movements[0].is_reconciled());
    assert_eq!(
        movements[0].reconciliation_type(),
        Some(ReconciliationType::Manual)
    );
}

#[test]
fn test_partial_manual_match_does_not_reconcile() {
    let (mut engine, sid) = engine_with_snapshot();
    engine
        .ingest_records(
            &sid,
            &[invoice_record("INV-X", "Opaque Corp", 420.0, d(2024, 3, 10))],
            "t",
        )
        .unwrap();
    let txn_row = txn(42_000, "Somebody", "no usable reference");
    let txn_id = txn_row.id().to_string();
    engine.register_bank_transaction(txn_row).unwrap();
    let invoice_id = engine.repository().invoices_for_snapshot(&sid)[0]
        .id()
        .to_string();

    // a link for less than the full amount must not reconcile
    engine
        .create_manual_match(
            &txn_id,
            AllocationTarget::Invoice(invoice_id.clone()),
            20_000,
            "analyst",
        )
        .unwrap();
    let movement = engine.repository().bank_transaction(&txn_id).unwrap();
    assert!(!movement.is_reconciled());
    assert_eq!(
        movement.reconciliation_type(),
        Some(ReconciliationType::Manual)
    );

    // covering the remainder flips the flag
    engine
        .create_manual_match(
            &txn_id,
            AllocationTarget::Invoice(invoice_id),
            22_000,
            "analyst",
        )
        .unwrap();
    assert!(engine.repository().bank_transaction(&txn_id).unwrap().is_reconciled());
}

#[test]
fn test_unmatched_lifecycle_with_sla() {
    let (mut engine, sid) = engine_with_snapshot();
    let txn_row = txn(33_000, "Mystery Sender", "???");
    let txn_id = txn_row.id().to_string();
    engine.register_bank_transaction(txn_row).unwrap();

    let report = engine.reconcile("ACME_DE", &sid, "analyst").unwrap();
    assert_eq!(report.unmatched, 1);
    assert_eq!(
        engine.repository().bank_transaction(&txn_id).unwrap().lifecycle_status(),
        LifecycleStatus::New
    );

    // Tuesday + 5 business days
    let breach = engine
        .assign_transaction(&txn_id, "analyst", d(2024, 3, 12), "lead")
        .unwrap();
    assert_eq!(breach, d(2024, 3, 19));

    engine
        .transition_transaction(&txn_id, LifecycleStatus::InReview, "analyst")
        .unwrap();
    engine
        .transition_transaction(&txn_id, LifecycleStatus::Escalated, "analyst")
        .unwrap();
    assert_eq!(
        engine.repository().bank_transaction(&txn_id).unwrap().lifecycle_status(),
        LifecycleStatus::Escalated
    );
}

#[test]
fn test_similarity_formula_lands_in_audit_log() {
    let (mut engine, sid) = engine_with_snapshot();
    engine.reconcile("ACME_DE", &sid, "analyst").unwrap();
    let reconcile_event = engine
        .repository()
        .audit_log()
        .events()
        .iter()
        .find(|e| e.action == "reconcile")
        .unwrap();
    let formula = reconcile_event.change_delta["similarity_formula"]
        .as_str()
        .unwrap();
    assert!(formula.contains("jaro_winkler"));
}
