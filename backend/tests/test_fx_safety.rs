//! FX safety tests
//!
//! A missing rate is a data gap, not a 1.0: the forecast completes, the
//! affected amount routes to the Unknown bucket, and explicit conversion
//! raises.

use chrono::NaiveDate;
use treasury_core_rs::models::Entity;
use treasury_core_rs::workspace::Direction;
use treasury_core_rs::{
    Cents, EngineError, FxError, IngestRecord, TreasuryEngine, UnknownReason,
};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn engine_with_usd_invoice() -> (TreasuryEngine, String) {
    let mut engine = TreasuryEngine::new();
    engine
        .register_entity(Entity::new("ACME_DE".to_string(), "EUR".to_string(), 4))
        .unwrap();
    let lineage = engine
        .create_snapshot("ACME_DE", d(2024, 3, 11), 0, None, "treasurer")
        .unwrap();

    let mut usd = IngestRecord::receivable(
        "erp".to_string(),
        "ACME_DE".to_string(),
        "INV-US-1".to_string(),
        "US Customer".to_string(),
        10_000.0,
        "USD".to_string(),
        d(2024, 2, 1),
    );
    usd.due_date = Some(d(2024, 3, 20));
    engine
        .ingest_records(&lineage.snapshot_id, &[usd], "treasurer")
        .unwrap();
    (engine, lineage.snapshot_id)
}

#[test]
fn test_missing_rate_routes_to_unknown_not_to_inflow() {
    let (mut engine, sid) = engine_with_usd_invoice();

    // the forecast completes despite the unconvertible invoice
    let report = engine.run_forecast(&sid, "treasurer").unwrap();
    assert_eq!(report.predicted_invoices, 1);

    let grid = engine.get_workspace_13w(&sid).unwrap();
    let total_inflow: Cents = grid.rows.iter().map(|r| r.inflow).sum();
    assert_eq!(total_inflow, 0, "the $10,000 must not enter the grid");

    assert_eq!(grid.unknown_items.len(), 1);
    assert_eq!(grid.unknown_items[0].reason, UnknownReason::MissingFx);
    assert_eq!(grid.unknown_items[0].amount, 1_000_000);
    assert_eq!(grid.unknown_items[0].currency, "USD");
}

#[test]
fn test_convert_currency_raises_for_missing_pair() {
    let (engine, sid) = engine_with_usd_invoice();
    let err = engine
        .convert_currency(&sid, 100_000, "USD", "EUR", d(2024, 3, 12))
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::Fx(FxError::Missing {
            from: "USD".to_string(),
            to: "EUR".to_string(),
        })
    );
}

#[test]
fn test_configured_rate_restores_the_flow() {
    let (mut engine, sid) = engine_with_usd_invoice();
    engine
        .set_fx_rates(
            &sid,
            &[("USD".to_string(), "EUR".to_string(), d(2024, 3, 11), 0.92)],
            "treasurer",
        )
        .unwrap();
    engine.run_forecast(&sid, "treasurer").unwrap();

    let grid = engine.get_workspace_13w(&sid).unwrap();
    assert!(grid.unknown_items.is_empty());
    let total_inflow: Cents = grid.rows.iter().map(|r| r.inflow).sum();
    // $10,000.00 at 0.92 = 920,000 cents
    assert_eq!(total_inflow, 920_000);
}

#[test]
fn test_missing_fx_surfaces_in_trust_report() {
    let (mut engine, sid) = engine_with_usd_invoice();
    engine.run_forecast(&sid, "treasurer").unwrap();

    let report = engine.get_trust_report(&sid).unwrap();
    assert_eq!(report.unknown.total, 1_000_000);
    assert_eq!(
        report.unknown.by_reason.get(&UnknownReason::MissingFx),
        Some(&1_000_000)
    );
    // the only invoice is unconvertible: exposure is 100%
    assert!(report.missing_fx_exposure_pct > 99.0);
    assert!(!report.lock_eligibility.passed);

    // and the drilldown for every inflow cell stays empty
    for week in 0..13 {
        assert!(engine
            .get_drilldown(&sid, week, Direction::Inflow)
            .unwrap()
            .is_empty());
    }
}
