//! Variance engine
//!
//! Set-based diff over canonical ids between two snapshots. Because the
//! diff runs on content-addressed identity, it is insensitive to ingest
//! ordering and needs no state beyond the two snapshots themselves.
//!
//! Every differing canonical id lands in exactly one of four categories,
//! so the category deltas sum to the total delta exactly:
//!
//! 1. **New items** - ids added, removed, or restated to a different
//!    amount
//! 2. **Timing shifts** - same amount, different weeks, no policy cause
//! 3. **Reconciliation changes** - the allocation set behind the id
//!    changed
//! 4. **Policy changes** - same amount, different weeks, attributable to
//!    segment-stats or FX movement between the snapshots

use crate::fx::FxTable;
use crate::models::{AllocationTarget, Cents};
use crate::repo::{RepoError, Repository};
use crate::workspace::{self, ContributionSource, Direction, WorkspaceError, WorkspaceGrid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Variance computation errors
#[derive(Debug, Error, PartialEq)]
pub enum VarianceError {
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// How an id entered or left the forecast population
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemChange {
    /// Present in B, absent in A
    Added,

    /// Present in A, absent in B
    Removed,

    /// Present in both with a different amount
    Restated,
}

/// Category 1 entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub canonical_id: String,
    pub change: ItemChange,
    pub delta: Cents,
}

/// Category 2 entry: same amount, moved weeks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingShift {
    pub canonical_id: String,
    pub amount: Cents,
    pub weeks_a: Vec<i64>,
    pub weeks_b: Vec<i64>,
}

/// Category 3 entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationChange {
    pub canonical_id: String,
    pub delta: Cents,
}

/// Category 4 entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyChange {
    pub canonical_id: String,
    pub amount: Cents,
    pub weeks_a: Vec<i64>,
    pub weeks_b: Vec<i64>,

    /// What moved: "segment_stats" or "fx"
    pub cause: String,
}

/// Four-category decomposition between snapshot A (prior) and B (current)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceReport {
    pub snapshot_a: String,
    pub snapshot_b: String,

    /// Net delta over all canonical items (B minus A, signed cents)
    pub total_delta: Cents,

    /// Net item delta per week index
    pub per_week: BTreeMap<i64, Cents>,

    pub new_items: Vec<NewItem>,
    pub timing_shifts: Vec<TimingShift>,
    pub reconciliation_changes: Vec<ReconciliationChange>,
    pub policy_changes: Vec<PolicyChange>,
}

impl VarianceReport {
    /// Sum of category deltas; equals `total_delta` exactly
    pub fn category_delta_sum(&self) -> Cents {
        let new: Cents = self.new_items.iter().map(|i| i.delta).sum();
        let recon: Cents = self.reconciliation_changes.iter().map(|i| i.delta).sum();
        // timing and policy shifts move cash between weeks at constant
        // amount: their total delta is zero by construction
        new + recon
    }
}

/// Signed weekly cash vector of one canonical item
#[derive(Debug, Clone, Default, PartialEq)]
struct ItemVector {
    by_week: BTreeMap<i64, Cents>,
}

impl ItemVector {
    fn add(&mut self, week: i64, amount: Cents) {
        *self.by_week.entry(week).or_insert(0) += amount;
    }

    fn total(&self) -> Cents {
        self.by_week.values().sum()
    }

    fn weeks(&self) -> Vec<i64> {
        self.by_week
            .iter()
            .filter(|(_, amount)| **amount != 0)
            .map(|(week, _)| *week)
            .collect()
    }
}

/// Collect per-canonical weekly vectors from a grid (forecast items only;
/// bank transactions are shared between snapshots and cancel in the diff)
fn item_vectors(grid: &WorkspaceGrid) -> BTreeMap<String, ItemVector> {
    let mut vectors: BTreeMap<String, ItemVector> = BTreeMap::new();
    let mut collect = |contributions: &[workspace::CellContribution]| {
        for c in contributions {
            let Some(canonical) = &c.canonical_id else {
                continue;
            };
            let signed = match c.source {
                ContributionSource::Invoice => c.amount,
                ContributionSource::Bill => -c.amount,
                ContributionSource::Transaction => continue,
            };
            let week = week_of(grid, c);
            vectors.entry(canonical.clone()).or_default().add(week, signed);
        }
    };
    for week in 0..crate::core::calendar::HORIZON_WEEKS {
        collect(grid.drilldown(week, Direction::Inflow));
        collect(grid.drilldown(week, Direction::Outflow));
    }
    collect(&grid.beyond_horizon);
    vectors
}

fn week_of(grid: &WorkspaceGrid, c: &workspace::CellContribution) -> i64 {
    c.date_used
        .map(|d| crate::core::calendar::week_index(grid.anchor, d).max(0))
        .unwrap_or(0)
}

/// Allocation fingerprint behind one canonical id in one snapshot
fn allocation_set(repo: &Repository, snapshot_id: &str, canonical_id: &str) -> BTreeSet<(String, Cents, bool)> {
    let mut set = BTreeSet::new();
    let target = repo
        .invoice_by_canonical(snapshot_id, canonical_id)
        .map(|i| AllocationTarget::Invoice(i.id().to_string()))
        .or_else(|| {
            repo.bill_by_canonical(snapshot_id, canonical_id)
                .map(|b| AllocationTarget::Bill(b.id().to_string()))
        });
    if let Some(target) = target {
        for alloc in repo.allocations_for_target(&target) {
            set.insert((
                alloc.transaction_id().to_string(),
                alloc.allocated_amount(),
                alloc.is_approved(),
            ));
        }
    }
    set
}

/// Attribute a week move to a policy cause, if one exists
fn policy_cause(
    repo: &Repository,
    snapshot_a: &str,
    snapshot_b: &str,
    canonical_id: &str,
) -> Option<String> {
    let inv_a = repo.invoice_by_canonical(snapshot_a, canonical_id);
    let inv_b = repo.invoice_by_canonical(snapshot_b, canonical_id);
    if let (Some(a), Some(b)) = (inv_a, inv_b) {
        if a.prediction_segment() != b.prediction_segment() {
            return Some("segment_stats".to_string());
        }
        // same segment: did the frozen FX move between the snapshots?
        if let (Some(date_a), Some(date_b)) =
            (a.predicted_payment_date(), b.predicted_payment_date())
        {
            let entity_base = repo
                .entity(a.entity_id())
                .map(|e| e.base_currency().to_string())
                .ok()?;
            let fx_a = FxTable::load(repo, snapshot_a);
            let fx_b = FxTable::load(repo, snapshot_b);
            let rate_a = fx_a.rate(a.currency(), &entity_base, date_a);
            let rate_b = fx_b.rate(b.currency(), &entity_base, date_b);
            if rate_a != rate_b {
                return Some("fx".to_string());
            }
        }
    }
    None
}

/// Compute the four-category variance between two snapshots
pub fn compute_variance(
    repo: &Repository,
    snapshot_a: &str,
    snapshot_b: &str,
) -> Result<VarianceReport, VarianceError> {
    let grid_a = workspace::build(repo, snapshot_a)?;
    let grid_b = workspace::build(repo, snapshot_b)?;
    let vectors_a = item_vectors(&grid_a);
    let vectors_b = item_vectors(&grid_b);

    let mut report = VarianceReport {
        snapshot_a: snapshot_a.to_string(),
        snapshot_b: snapshot_b.to_string(),
        total_delta: 0,
        per_week: BTreeMap::new(),
        new_items: Vec::new(),
        timing_shifts: Vec::new(),
        reconciliation_changes: Vec::new(),
        policy_changes: Vec::new(),
    };

    let empty = ItemVector::default();
    let ids: BTreeSet<&String> = vectors_a.keys().chain(vectors_b.keys()).collect();
    for id in ids {
        let a = vectors_a.get(id).unwrap_or(&empty);
        let b = vectors_b.get(id).unwrap_or(&empty);
        if a == b {
            // unchanged forecast: still check for pure reconciliation
            // movement behind the same cash profile
            if allocation_set(repo, snapshot_a, id) != allocation_set(repo, snapshot_b, id) {
                report
                    .reconciliation_changes
                    .push(ReconciliationChange {
                        canonical_id: id.clone(),
                        delta: 0,
                    });
            }
            continue;
        }

        let delta = b.total() - a.total();
        report.total_delta += delta;
        for week in a.by_week.keys().chain(b.by_week.keys()) {
            let wa = a.by_week.get(week).copied().unwrap_or(0);
            let wb = b.by_week.get(week).copied().unwrap_or(0);
            if wb != wa {
                *report.per_week.entry(*week).or_insert(0) += wb - wa;
            }
        }

        let in_a = vectors_a.contains_key(id);
        let in_b = vectors_b.contains_key(id);
        if !in_a {
            report.new_items.push(NewItem {
                canonical_id: id.clone(),
                change: ItemChange::Added,
                delta,
            });
            continue;
        }
        if !in_b {
            report.new_items.push(NewItem {
                canonical_id: id.clone(),
                change: ItemChange::Removed,
                delta,
            });
            continue;
        }
        if allocation_set(repo, snapshot_a, id) != allocation_set(repo, snapshot_b, id) {
            report.reconciliation_changes.push(ReconciliationChange {
                canonical_id: id.clone(),
                delta,
            });
            continue;
        }
        if a.total() == b.total() {
            match policy_cause(repo, snapshot_a, snapshot_b, id) {
                Some(cause) => report.policy_changes.push(PolicyChange {
                    canonical_id: id.clone(),
                    amount: b.total(),
                    weeks_a: a.weeks(),
                    weeks_b: b.weeks(),
                    cause,
                }),
                None => report.timing_shifts.push(TimingShift {
                    canonical_id: id.clone(),
                    amount: b.total(),
                    weeks_a: a.weeks(),
                    weeks_b: b.weeks(),
                }),
            }
            continue;
        }
        // same id, different amount: a restatement
        report.new_items.push(NewItem {
            canonical_id: id.clone(),
            change: ItemChange::Restated,
            delta,
        });
    }

    Ok(report)
}
