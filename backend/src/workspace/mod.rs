//! 13-week workspace aggregator
//!
//! Sums forecast and actual contributions into 13 weekly rows anchored at
//! the snapshot's as-of week. Every cell is decomposable: the drilldown
//! for a cell returns the exact contributions whose sum equals the cell
//! value, each tagged with a truth label.
//!
//! # Critical Invariants
//!
//! 1. Cash math: `close = open + inflow - outflow` per week, and
//!    `open_{w+1} = close_w`
//! 2. Drilldown sum equals the cell value exactly (integer cents, no
//!    tolerance needed)
//! 3. Unknown amounts never leak into inflow/outflow; they are surfaced
//!    in `unknown_in` / `unknown_out` and the unknown item list

use crate::ap::{self, ApError};
use crate::core::calendar::{anchor_week, week_index, week_of_index, HORIZON_WEEKS};
use crate::forecast::{allocate, ArOutcome};
use crate::fx::FxTable;
use crate::models::{AllocationTarget, Cents, TruthLabel, UnknownReason};
use crate::repo::{RepoError, Repository};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Aggregation errors
#[derive(Debug, Error, PartialEq)]
pub enum WorkspaceError {
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("AP projection error: {0}")]
    Ap(#[from] ApError),
}

/// Cash direction of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inflow,
    Outflow,
}

/// What kind of record a contribution came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionSource {
    Invoice,
    Bill,
    Transaction,
}

/// One drilldown line: a single record's share of a cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellContribution {
    pub source: ContributionSource,
    pub record_id: String,
    pub canonical_id: Option<String>,

    /// Contribution in entity base currency (cents, positive)
    pub amount: Cents,

    /// Mixture weight for forecast legs, 1.0 for actuals
    pub weight: f64,

    pub truth_label: TruthLabel,
    pub date_used: Option<NaiveDate>,
}

/// An item routed to the Unknown bucket during aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownItem {
    pub source: ContributionSource,
    pub record_id: String,
    pub canonical_id: String,
    pub direction: Direction,
    pub reason: UnknownReason,

    /// Document-currency cents: when the reason is missing FX there is,
    /// by definition, no base conversion for this amount
    pub amount: Cents,
    pub currency: String,

    /// Grid week the item would have landed in, when a date exists
    pub week_index: Option<i64>,
}

/// One weekly row of the workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekRow {
    pub week_index: i64,
    pub week_start: NaiveDate,
    pub open_balance: Cents,
    pub inflow: Cents,
    pub outflow: Cents,
    pub close_balance: Cents,

    /// Unknown exposure surfaced per week (advisory, not in cash math)
    pub unknown_in: Cents,
    pub unknown_out: Cents,

    /// Amount per truth label across both directions
    pub truth_mix: BTreeMap<TruthLabel, Cents>,
}

/// The aggregated 13-week workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceGrid {
    pub snapshot_id: String,
    pub anchor: NaiveDate,
    pub rows: Vec<WeekRow>,

    /// Per-cell drilldown contributions
    contributions: BTreeMap<(i64, Direction), Vec<CellContribution>>,

    pub unknown_items: Vec<UnknownItem>,

    /// Forecast legs past week 12, kept visible rather than dropped
    pub beyond_horizon: Vec<CellContribution>,

    /// Truth labels assigned to invoices/bills during this aggregation
    item_labels: BTreeMap<String, TruthLabel>,
}

impl WorkspaceGrid {
    /// Exact decomposition of one cell; the sum of returned amounts
    /// equals the cell value
    pub fn drilldown(&self, week: i64, direction: Direction) -> &[CellContribution] {
        self.contributions
            .get(&(week, direction))
            .map_or(&[], Vec::as_slice)
    }

    /// Truth labels assigned to invoice/bill rows during aggregation,
    /// keyed by row id. The engine persists these while the snapshot is
    /// still mutable.
    pub fn item_labels(&self) -> &BTreeMap<String, TruthLabel> {
        &self.item_labels
    }

    /// Total unknown exposure (document-currency cents summed as-is)
    pub fn unknown_total(&self) -> Cents {
        self.unknown_items.iter().map(|u| u.amount.abs()).sum()
    }
}

/// Build the 13-week workspace for a snapshot
pub fn build(repo: &Repository, snapshot_id: &str) -> Result<WorkspaceGrid, WorkspaceError> {
    let snapshot = repo.snapshot(snapshot_id)?;
    let entity = repo.entity(snapshot.entity_id())?;
    let anchor = anchor_week(snapshot.as_of());
    let base_currency = entity.base_currency().to_string();
    let fx = FxTable::load(repo, snapshot_id);

    let mut grid = WorkspaceGrid {
        snapshot_id: snapshot_id.to_string(),
        anchor,
        rows: Vec::new(),
        contributions: BTreeMap::new(),
        unknown_items: Vec::new(),
        beyond_horizon: Vec::new(),
        item_labels: BTreeMap::new(),
    };

    aggregate_bank_transactions(repo, entity.id(), anchor, &mut grid);
    aggregate_invoices(repo, snapshot_id, &fx, &base_currency, anchor, &mut grid)?;
    aggregate_bills(repo, snapshot_id, entity, &fx, anchor, &mut grid)?;

    build_rows(snapshot.opening_balance(), anchor, &mut grid);
    Ok(grid)
}

fn push(
    grid: &mut WorkspaceGrid,
    week: i64,
    direction: Direction,
    contribution: CellContribution,
) {
    grid.contributions
        .entry((week, direction))
        .or_default()
        .push(contribution);
}

/// Actual bank movements within the horizon. A transaction is Reconciled
/// evidence only when it is fully explained (approved allocations plus
/// fees and writeoffs cover the whole amount — the same rule the trust
/// report and the unexplained-cash gate read); anything less stays
/// Bank-True. Wash movements are internal transfers and never cash flow.
fn aggregate_bank_transactions(
    repo: &Repository,
    entity_id: &str,
    anchor: NaiveDate,
    grid: &mut WorkspaceGrid,
) {
    for txn in repo.bank_transactions_for_entity(entity_id) {
        if txn.is_wash() {
            continue;
        }
        let week = week_index(anchor, txn.transaction_date());
        if !(0..HORIZON_WEEKS).contains(&week) {
            continue;
        }
        let label = if txn.is_reconciled() {
            TruthLabel::Reconciled
        } else {
            TruthLabel::BankTrue
        };
        let direction = if txn.amount() >= 0 {
            Direction::Inflow
        } else {
            Direction::Outflow
        };
        push(
            grid,
            week,
            direction,
            CellContribution {
                source: ContributionSource::Transaction,
                record_id: txn.id().to_string(),
                canonical_id: None,
                amount: txn.abs_amount(),
                weight: 1.0,
                truth_label: label,
                date_used: Some(txn.transaction_date()),
            },
        );
    }
}

/// Open invoices contribute their unallocated remainder through the
/// forecast mixture; fully allocated invoices are Reconciled and add
/// nothing (their cash is already in the bank rows).
fn aggregate_invoices(
    repo: &Repository,
    snapshot_id: &str,
    fx: &FxTable,
    base_currency: &str,
    anchor: NaiveDate,
    grid: &mut WorkspaceGrid,
) -> Result<(), WorkspaceError> {
    let mut invoices = repo.invoices_for_snapshot(snapshot_id);
    invoices.sort_by(|a, b| a.canonical_id().cmp(b.canonical_id()));

    for invoice in invoices {
        if !invoice.is_open() {
            continue;
        }
        let allocated: Cents = repo
            .allocations_for_target(&AllocationTarget::Invoice(invoice.id().to_string()))
            .iter()
            .filter(|a| a.is_approved())
            .map(|a| a.allocated_amount())
            .sum();
        let open_amount = invoice.amount() - allocated;
        if open_amount <= 0 {
            grid.item_labels
                .insert(invoice.id().to_string(), TruthLabel::Reconciled);
            continue;
        }

        match allocate(invoice, open_amount, fx, base_currency, anchor) {
            ArOutcome::Allocated {
                contributions,
                beyond_horizon,
            } => {
                // a partially reconciled remainder is still modeled cash
                let label = TruthLabel::Modeled;
                grid.item_labels.insert(invoice.id().to_string(), label);
                for leg in contributions {
                    push(
                        grid,
                        leg.week_index,
                        Direction::Inflow,
                        CellContribution {
                            source: ContributionSource::Invoice,
                            record_id: leg.invoice_id,
                            canonical_id: Some(leg.canonical_id),
                            amount: leg.amount,
                            weight: leg.weight,
                            truth_label: label,
                            date_used: Some(leg.predicted_date_used),
                        },
                    );
                }
                for leg in beyond_horizon {
                    grid.beyond_horizon.push(CellContribution {
                        source: ContributionSource::Invoice,
                        record_id: leg.invoice_id,
                        canonical_id: Some(leg.canonical_id),
                        amount: leg.amount,
                        weight: leg.weight,
                        truth_label: label,
                        date_used: Some(leg.predicted_date_used),
                    });
                }
            }
            ArOutcome::Unknown(reason) => {
                grid.item_labels
                    .insert(invoice.id().to_string(), TruthLabel::Unknown);
                let week = invoice
                    .predicted_payment_date()
                    .or(invoice.expected_due_date())
                    .map(|d| week_index(anchor, d).clamp(0, HORIZON_WEEKS - 1));
                grid.unknown_items.push(UnknownItem {
                    source: ContributionSource::Invoice,
                    record_id: invoice.id().to_string(),
                    canonical_id: invoice.canonical_id().to_string(),
                    direction: Direction::Inflow,
                    reason,
                    amount: open_amount,
                    currency: invoice.currency().to_string(),
                    week_index: week,
                });
            }
        }
    }
    Ok(())
}

fn aggregate_bills(
    repo: &Repository,
    snapshot_id: &str,
    entity: &crate::models::Entity,
    fx: &FxTable,
    anchor: NaiveDate,
    grid: &mut WorkspaceGrid,
) -> Result<(), WorkspaceError> {
    let projection = ap::project(repo, snapshot_id, entity, fx, anchor)?;

    for leg in projection.contributions {
        grid.item_labels
            .insert(leg.bill_id.clone(), TruthLabel::Modeled);
        push(
            grid,
            leg.week_index,
            Direction::Outflow,
            CellContribution {
                source: ContributionSource::Bill,
                record_id: leg.bill_id,
                canonical_id: Some(leg.canonical_id),
                amount: leg.amount,
                weight: 1.0,
                truth_label: TruthLabel::Modeled,
                date_used: Some(leg.cash_exit_date),
            },
        );
    }
    for leg in projection.beyond_horizon {
        grid.item_labels
            .insert(leg.bill_id.clone(), TruthLabel::Modeled);
        grid.beyond_horizon.push(CellContribution {
            source: ContributionSource::Bill,
            record_id: leg.bill_id,
            canonical_id: Some(leg.canonical_id),
            amount: leg.amount,
            weight: 1.0,
            truth_label: TruthLabel::Modeled,
            date_used: Some(leg.cash_exit_date),
        });
    }
    for unknown in projection.unknowns {
        grid.item_labels
            .insert(unknown.bill_id.clone(), TruthLabel::Unknown);
        let bill = repo.bill(&unknown.bill_id)?;
        let week = bill
            .scheduled_payment_date()
            .or(bill.due_date())
            .map(|d| week_index(anchor, d).clamp(0, HORIZON_WEEKS - 1));
        grid.unknown_items.push(UnknownItem {
            source: ContributionSource::Bill,
            record_id: unknown.bill_id,
            canonical_id: unknown.canonical_id,
            direction: Direction::Outflow,
            reason: unknown.reason,
            amount: unknown.amount,
            currency: bill.currency().to_string(),
            week_index: week,
        });
    }
    Ok(())
}

fn build_rows(opening_balance: Cents, anchor: NaiveDate, grid: &mut WorkspaceGrid) {
    let mut open = opening_balance;
    for week in 0..HORIZON_WEEKS {
        let sum = |direction: Direction, grid: &WorkspaceGrid| -> Cents {
            grid.drilldown(week, direction)
                .iter()
                .map(|c| c.amount)
                .sum()
        };
        let inflow = sum(Direction::Inflow, grid);
        let outflow = sum(Direction::Outflow, grid);
        let close = open + inflow - outflow;

        let mut truth_mix: BTreeMap<TruthLabel, Cents> = BTreeMap::new();
        for direction in [Direction::Inflow, Direction::Outflow] {
            for c in grid.drilldown(week, direction) {
                *truth_mix.entry(c.truth_label).or_insert(0) += c.amount;
            }
        }

        let unknown_in: Cents = grid
            .unknown_items
            .iter()
            .filter(|u| u.week_index == Some(week) && u.direction == Direction::Inflow)
            .map(|u| u.amount.abs())
            .sum();
        let unknown_out: Cents = grid
            .unknown_items
            .iter()
            .filter(|u| u.week_index == Some(week) && u.direction == Direction::Outflow)
            .map(|u| u.amount.abs())
            .sum();
        if unknown_in + unknown_out > 0 {
            *truth_mix.entry(TruthLabel::Unknown).or_insert(0) += unknown_in + unknown_out;
        }

        grid.rows.push(WeekRow {
            week_index: week,
            week_start: week_of_index(anchor, week),
            open_balance: open,
            inflow,
            outflow,
            close_balance: close,
            unknown_in,
            unknown_out,
            truth_mix,
        });
        open = close;
    }
}
