//! Idempotent ingest tests
//!
//! Re-ingesting the same business documents, with cosmetic formatting
//! noise, must not create new rows or change canonical ids.

use chrono::NaiveDate;
use treasury_core_rs::models::Entity;
use treasury_core_rs::{IngestRecord, TreasuryEngine};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn record(doc: &str, customer: &str, amount: f64, due: NaiveDate) -> IngestRecord {
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

fn engine_with_snapshot() -> (TreasuryEngine, String) {
    let mut engine = TreasuryEngine::new();
    engine
        .register_entity(Entity::new("ACME_DE".to_string(), "EUR".to_string(), 4))
        .unwrap();
    let lineage = engine
        .create_snapshot("ACME_DE", d(2024, 3, 4), 0, None, "treasurer")
        .unwrap();
    (engine, lineage.snapshot_id)
}

#[test]
fn test_reingest_with_formatting_noise_keeps_three_rows() {
    let (mut engine, sid) = engine_with_snapshot();

    let batch = vec![
        record("INV-A", "Customer X", 1000.0, d(2024, 3, 10)),
        record("INV-B", "Customer X", 500.0, d(2024, 3, 17)),
        record("INV-C", "Customer Y", 2000.0, d(2024, 3, 24)),
    ];
    let first = engine.ingest_records(&sid, &batch, "treasurer").unwrap();
    assert_eq!(first.inserted, 3);

    let original_ids: Vec<String> = {
        let mut invoices = engine.repository().invoices_for_snapshot(&sid);
        invoices.sort_by_key(|i| i.amount());
        invoices
            .iter()
            .map(|i| i.canonical_id().to_string())
            .collect()
    };

    // same file again: trailing whitespace on the document number,
    // different case on the customer
    let noisy = vec![
        record("INV-A  ", "CUSTOMER X", 1000.0, d(2024, 3, 10)),
        record("inv-b", "customer x", 500.0, d(2024, 3, 17)),
        record(" INV-C ", "Customer Y", 2000.0, d(2024, 3, 24)),
    ];
    let second = engine.ingest_records(&sid, &noisy, "treasurer").unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.skipped, 3);

    let mut invoices = engine.repository().invoices_for_snapshot(&sid);
    assert_eq!(invoices.len(), 3);
    invoices.sort_by_key(|i| i.amount());
    let ids_after: Vec<String> = invoices
        .iter()
        .map(|i| i.canonical_id().to_string())
        .collect();
    assert_eq!(ids_after, original_ids);
}

#[test]
fn test_double_ingest_equals_single_ingest() {
    let (mut engine, sid) = engine_with_snapshot();
    let batch = vec![
        record("INV-1", "X", 10.5, d(2024, 3, 12)),
        record("INV-2", "Y", 99.99, d(2024, 3, 13)),
    ];
    engine.ingest_records(&sid, &batch, "t").unwrap();
    let rows_once: usize = engine.repository().invoices_for_snapshot(&sid).len();

    engine.ingest_records(&sid, &batch, "t").unwrap();
    engine.ingest_records(&sid, &batch, "t").unwrap();
    assert_eq!(engine.repository().invoices_for_snapshot(&sid).len(), rows_once);
}

#[test]
fn test_update_arrives_in_place() {
    let (mut engine, sid) = engine_with_snapshot();
    let open = record("INV-1", "X", 750.0, d(2024, 3, 12));
    engine.ingest_records(&sid, &[open.clone()], "t").unwrap();

    let mut paid = open;
    paid.payment_date = Some(d(2024, 3, 15));
    let summary = engine.ingest_records(&sid, &[paid], "t").unwrap();
    assert_eq!(summary.updated, 1);

    let invoices = engine.repository().invoices_for_snapshot(&sid);
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].payment_date(), Some(d(2024, 3, 15)));
}

#[test]
fn test_external_id_collision_is_reported_not_merged() {
    let (mut engine, sid) = engine_with_snapshot();
    // a tuple-identified row first
    let plain = record("INV-1", "X", 750.0, d(2024, 3, 12));
    engine.ingest_records(&sid, &[plain.clone()], "t").unwrap();

    // the same tuple arrives again under an external identity
    let mut external = plain;
    external.external_id = Some("SAP-42".to_string());
    let summary = engine.ingest_records(&sid, &[external], "t").unwrap();

    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.possible_collisions.len(), 1);
    assert_eq!(engine.repository().invoices_for_snapshot(&sid).len(), 2);
}
