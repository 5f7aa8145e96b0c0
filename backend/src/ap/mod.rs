//! AP cash-exit projection
//!
//! Projects vendor bills onto the weekly grid through the entity's
//! payment-run cadence. A bill's cash-exit date is, in order of
//! precedence: its scheduled payment date, an approved off-cycle
//! exception, or the next entity payment-run day on or after its due
//! date.
//!
//! Held bills and unapproved bills (when policy requires approval) are
//! not outflows: they route to the Unknown bucket. Template-generated
//! bills are suppressed whenever a concrete bill already occupies the
//! same (vendor, category, week) slot — concrete bills always win.

use crate::core::calendar::{grid_week, next_run_day, week_index};
use crate::fx::FxTable;
use crate::models::{Cents, Entity, UnknownReason, VendorBill};
use crate::repo::{RepoError, Repository};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// AP projection errors
#[derive(Debug, Error, PartialEq)]
pub enum ApError {
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),
}

/// One projected cash exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApContribution {
    pub bill_id: String,
    pub canonical_id: String,

    /// Signed week index relative to the anchor; in-grid exits are 0..13
    pub week_index: i64,

    /// Outflow in entity base currency (cents, positive)
    pub amount: Cents,

    pub cash_exit_date: NaiveDate,

    /// Committed = non-discretionary, not held, approved
    pub committed: bool,
}

/// A bill routed to the Unknown bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApUnknown {
    pub bill_id: String,
    pub canonical_id: String,
    pub reason: UnknownReason,

    /// Document-currency amount (cents); FX may itself be the reason
    pub amount: Cents,
}

/// A template entry suppressed by a concrete bill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressedTemplate {
    pub bill_id: String,
    pub template_id: String,
    pub vendor: String,
    pub category: String,
    pub week_index: i64,
}

/// Full AP projection for a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApProjection {
    pub contributions: Vec<ApContribution>,
    pub beyond_horizon: Vec<ApContribution>,
    pub unknowns: Vec<ApUnknown>,
    pub suppressed: Vec<SuppressedTemplate>,
}

/// Cash-exit date for one bill, before suppression
fn cash_exit_date(
    repo: &Repository,
    snapshot_id: &str,
    entity: &Entity,
    bill: &VendorBill,
) -> Result<NaiveDate, UnknownReason> {
    if let Some(scheduled) = bill.scheduled_payment_date() {
        return Ok(scheduled);
    }
    if let Some(exception) = repo.payment_run_exception(snapshot_id, bill.canonical_id()) {
        return Ok(exception.override_date);
    }
    match bill.due_date() {
        Some(due) => Ok(next_run_day(due, entity.payment_run_day())),
        None => Err(UnknownReason::MissingDueDate),
    }
}

/// Project all open bills of a snapshot onto the grid
///
/// `open_amount` per bill is its amount minus any approved allocations
/// (already-paid portions come through bank transactions instead).
pub fn project(
    repo: &Repository,
    snapshot_id: &str,
    entity: &Entity,
    fx: &FxTable,
    anchor: NaiveDate,
) -> Result<ApProjection, ApError> {
    let config = repo.snapshot(snapshot_id)?.config().clone();
    let base_currency = entity.base_currency();
    let mut projection = ApProjection::default();

    // Pass 1: concrete bills claim their (vendor, category, week) slots
    let mut bills = repo.bills_for_snapshot(snapshot_id);
    bills.sort_by(|a, b| a.canonical_id().cmp(b.canonical_id()));

    let mut claimed: std::collections::BTreeSet<(String, String, i64)> =
        std::collections::BTreeSet::new();
    let mut projected: Vec<(&VendorBill, NaiveDate, i64)> = Vec::new();

    for &bill in &bills {
        let open_amount = open_amount(repo, bill);
        if open_amount <= 0 {
            continue;
        }

        if bill.is_held() {
            projection.unknowns.push(unknown(bill, UnknownReason::HeldBill));
            continue;
        }
        if config.require_ap_approval && !bill.is_approved() {
            projection
                .unknowns
                .push(unknown(bill, UnknownReason::MissingApproval));
            continue;
        }

        let exit = match cash_exit_date(repo, snapshot_id, entity, bill) {
            Ok(date) => date,
            Err(reason) => {
                projection.unknowns.push(unknown(bill, reason));
                continue;
            }
        };
        let week = week_index(anchor, exit);
        if !bill.is_template_generated() {
            claimed.insert((
                bill.vendor().to_string(),
                bill.category().to_string(),
                week,
            ));
        }
        projected.push((bill, exit, week));
    }

    // Pass 2: emit contributions; template entries lose occupied slots
    for (bill, exit, week) in projected {
        if bill.is_template_generated() {
            let slot = (
                bill.vendor().to_string(),
                bill.category().to_string(),
                week,
            );
            if claimed.contains(&slot) {
                projection.suppressed.push(SuppressedTemplate {
                    bill_id: bill.id().to_string(),
                    template_id: bill
                        .recurring_template_id()
                        .unwrap_or_default()
                        .to_string(),
                    vendor: slot.0,
                    category: slot.1,
                    week_index: week,
                });
                continue;
            }
        }

        let open = open_amount(repo, bill);
        let amount = match fx.convert(open, bill.currency(), base_currency, exit) {
            Ok(amount) => amount.abs(),
            Err(_) => {
                projection
                    .unknowns
                    .push(unknown(bill, UnknownReason::MissingFx));
                continue;
            }
        };

        let contribution = ApContribution {
            bill_id: bill.id().to_string(),
            canonical_id: bill.canonical_id().to_string(),
            week_index: week,
            amount,
            cash_exit_date: exit,
            committed: !bill.is_discretionary() && !bill.is_held() && bill.is_approved(),
        };
        match grid_week(anchor, exit) {
            Some(idx) => projection.contributions.push(ApContribution {
                week_index: idx,
                ..contribution
            }),
            None => projection.beyond_horizon.push(contribution),
        }
    }

    Ok(projection)
}

fn open_amount(repo: &Repository, bill: &VendorBill) -> Cents {
    let allocated: Cents = repo
        .allocations_for_target(&crate::models::AllocationTarget::Bill(bill.id().to_string()))
        .iter()
        .filter(|a| a.is_approved())
        .map(|a| a.allocated_amount())
        .sum();
    bill.amount().abs() - allocated
}

fn unknown(bill: &VendorBill, reason: UnknownReason) -> ApUnknown {
    ApUnknown {
        bill_id: bill.id().to_string(),
        canonical_id: bill.canonical_id().to_string(),
        reason,
        amount: bill.amount().abs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Snapshot, SnapshotConfig};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn setup() -> (Repository, String, Entity) {
        let mut repo = Repository::new();
        // payment runs on Friday (4)
        let entity = Entity::new("E1".to_string(), "EUR".to_string(), 4);
        repo.insert_entity(entity.clone()).unwrap();
        let snapshot = Snapshot::new("E1".to_string(), d(2024, 3, 11), 0, SnapshotConfig::default());
        let sid = snapshot.id().to_string();
        repo.insert_snapshot(snapshot).unwrap();
        (repo, sid, entity)
    }

    fn bill(sid: &str, canonical: &str, vendor: &str, due: NaiveDate) -> VendorBill {
        VendorBill::new(
            sid.to_string(),
            canonical.to_string(),
            vendor.to_string(),
            80_000,
            "EUR".to_string(),
            d(2024, 3, 1),
            "services".to_string(),
        )
        .with_due_date(due)
        .approved_on(d(2024, 3, 5))
    }

    fn run(repo: &Repository, sid: &str, entity: &Entity) -> ApProjection {
        let fx = FxTable::load(repo, sid);
        project(repo, sid, entity, &fx, d(2024, 3, 11)).unwrap()
    }

    #[test]
    fn test_due_date_rolls_to_next_run_day() {
        let (mut repo, sid, entity) = setup();
        // due Wednesday 2024-03-13; Friday run -> exits 2024-03-15
        repo.insert_bill(bill(&sid, "B1", "HOSTCO", d(2024, 3, 13)))
            .unwrap();
        let projection = run(&repo, &sid, &entity);
        assert_eq!(projection.contributions.len(), 1);
        let c = &projection.contributions[0];
        assert_eq!(c.cash_exit_date, d(2024, 3, 15));
        assert_eq!(c.week_index, 0);
        assert!(c.committed);
    }

    #[test]
    fn test_scheduled_date_wins_over_run_day() {
        let (mut repo, sid, entity) = setup();
        let b = bill(&sid, "B1", "HOSTCO", d(2024, 3, 13))
            .with_scheduled_payment(d(2024, 3, 25));
        repo.insert_bill(b).unwrap();
        let projection = run(&repo, &sid, &entity);
        assert_eq!(projection.contributions[0].cash_exit_date, d(2024, 3, 25));
        assert_eq!(projection.contributions[0].week_index, 2);
    }

    #[test]
    fn test_held_bill_routes_to_unknown() {
        let (mut repo, sid, entity) = setup();
        repo.insert_bill(bill(&sid, "B1", "HOSTCO", d(2024, 3, 13)).held())
            .unwrap();
        let projection = run(&repo, &sid, &entity);
        assert!(projection.contributions.is_empty());
        assert_eq!(projection.unknowns[0].reason, UnknownReason::HeldBill);
    }

    #[test]
    fn test_unapproved_bill_routes_to_unknown_when_policy_requires() {
        let (mut repo, sid, entity) = setup();
        let unapproved = VendorBill::new(
            sid.clone(),
            "B1".to_string(),
            "HOSTCO".to_string(),
            80_000,
            "EUR".to_string(),
            d(2024, 3, 1),
            "services".to_string(),
        )
        .with_due_date(d(2024, 3, 13));
        repo.insert_bill(unapproved).unwrap();
        let projection = run(&repo, &sid, &entity);
        assert_eq!(
            projection.unknowns[0].reason,
            UnknownReason::MissingApproval
        );
    }

    #[test]
    fn test_off_cycle_exception_overrides_run_day() {
        let (mut repo, sid, entity) = setup();
        repo.insert_bill(bill(&sid, "B1", "HOSTCO", d(2024, 3, 13)))
            .unwrap();
        repo.insert_payment_run_exception(crate::models::PaymentRunException {
            bill_canonical_id: "B1".to_string(),
            snapshot_id: sid.clone(),
            override_date: d(2024, 3, 12),
            approved_by: "treasurer".to_string(),
        })
        .unwrap();
        let projection = run(&repo, &sid, &entity);
        assert_eq!(projection.contributions[0].cash_exit_date, d(2024, 3, 12));
    }

    #[test]
    fn test_concrete_bill_suppresses_template_entry() {
        let (mut repo, sid, entity) = setup();
        repo.insert_bill(bill(&sid, "B1", "HOSTCO", d(2024, 3, 13)))
            .unwrap();
        let template = bill(&sid, "B2", "HOSTCO", d(2024, 3, 14)).from_template("TPL-1".to_string());
        repo.insert_bill(template).unwrap();

        let projection = run(&repo, &sid, &entity);
        assert_eq!(projection.contributions.len(), 1);
        assert_eq!(projection.contributions[0].canonical_id, "B1");
        assert_eq!(projection.suppressed.len(), 1);
        assert_eq!(projection.suppressed[0].template_id, "TPL-1");
    }

    #[test]
    fn test_template_survives_in_free_slot() {
        let (mut repo, sid, entity) = setup();
        repo.insert_bill(bill(&sid, "B1", "HOSTCO", d(2024, 3, 13)))
            .unwrap();
        // different week: both Friday runs but a week apart
        let template = bill(&sid, "B2", "HOSTCO", d(2024, 3, 20)).from_template("TPL-1".to_string());
        repo.insert_bill(template).unwrap();

        let projection = run(&repo, &sid, &entity);
        assert_eq!(projection.contributions.len(), 2);
        assert!(projection.suppressed.is_empty());
    }

    #[test]
    fn test_discretionary_bill_is_not_committed() {
        let (mut repo, sid, entity) = setup();
        repo.insert_bill(bill(&sid, "B1", "HOSTCO", d(2024, 3, 13)).discretionary())
            .unwrap();
        let projection = run(&repo, &sid, &entity);
        assert!(!projection.contributions[0].committed);
    }
}
