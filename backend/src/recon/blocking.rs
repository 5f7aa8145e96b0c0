//! Blocking indexes for candidate retrieval
//!
//! Matching 50k transactions against 200k open documents cannot afford
//! O(n*m) comparisons. Before the ladder runs, the open documents are
//! indexed four ways: by cleaned document number, by amount bucket
//! (cents), by counterparty key and by due-date week. Tier lookups probe
//! the relevant blocks and work on the intersection, bounding the
//! per-transaction cost by the block sizes.

use crate::core::calendar::week_start;
use crate::ingest::clean;
use crate::models::Cents;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Which ledger side a match target represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Invoice,
    Bill,
}

/// Flattened view of one matchable document
#[derive(Debug, Clone)]
pub struct MatchTarget {
    pub kind: TargetKind,

    /// Row id of the underlying invoice/bill
    pub target_id: String,
    pub canonical_id: String,

    /// Cleaned document number (lowercase alphanumerics)
    pub doc_clean: String,

    /// Cleaned counterparty name
    pub counterparty_key: String,
    pub counterparty_raw: String,

    /// Document amount, absolute cents
    pub amount: Cents,

    /// Remaining unallocated capacity, absolute cents
    pub open_amount: Cents,

    pub expected_date: Option<NaiveDate>,
    pub currency: String,
}

/// The four blocking indexes over one target set
#[derive(Debug, Default)]
pub struct BlockingIndex {
    targets: Vec<MatchTarget>,

    /// cleaned document number -> target positions
    by_doc: HashMap<String, Vec<usize>>,

    /// exact amount in cents -> target positions (range-probed with the
    /// policy tolerance)
    by_amount: BTreeMap<Cents, Vec<usize>>,

    /// cleaned counterparty -> target positions
    by_counterparty: HashMap<String, Vec<usize>>,

    /// ISO week start of the expected date -> target positions
    by_week: BTreeMap<NaiveDate, Vec<usize>>,
}

impl BlockingIndex {
    /// Build all four indexes in one pass
    pub fn build(targets: Vec<MatchTarget>) -> Self {
        let mut index = BlockingIndex {
            targets,
            ..BlockingIndex::default()
        };
        for (pos, target) in index.targets.iter().enumerate() {
            if !target.doc_clean.is_empty() {
                index
                    .by_doc
                    .entry(target.doc_clean.clone())
                    .or_default()
                    .push(pos);
            }
            index.by_amount.entry(target.amount).or_default().push(pos);
            if !target.counterparty_key.is_empty() {
                index
                    .by_counterparty
                    .entry(target.counterparty_key.clone())
                    .or_default()
                    .push(pos);
            }
            if let Some(date) = target.expected_date {
                index
                    .by_week
                    .entry(week_start(date))
                    .or_default()
                    .push(pos);
            }
        }
        index
    }

    pub fn targets(&self) -> &[MatchTarget] {
        &self.targets
    }

    pub fn target(&self, pos: usize) -> &MatchTarget {
        &self.targets[pos]
    }

    /// Positions whose cleaned document number appears as a token or
    /// substring of the cleaned reference
    pub fn by_reference(&self, reference: &str) -> BTreeSet<usize> {
        let ref_clean = clean(reference);
        let mut hits = BTreeSet::new();

        // token probe: each raw token cleans to a potential doc number
        for token in reference.split(|c: char| !c.is_alphanumeric() && c != '-') {
            let token_clean = clean(token);
            if token_clean.is_empty() {
                continue;
            }
            if let Some(positions) = self.by_doc.get(&token_clean) {
                hits.extend(positions.iter().copied());
            }
        }

        // substring probe over blocks already keyed: catches document
        // numbers glued to surrounding text
        for (doc, positions) in &self.by_doc {
            if doc.len() >= 4 && ref_clean.contains(doc.as_str()) {
                hits.extend(positions.iter().copied());
            }
        }
        hits
    }

    /// Positions with amount within +-tolerance of `amount`
    pub fn by_amount_range(&self, amount: Cents, tolerance: Cents) -> BTreeSet<usize> {
        self.by_amount
            .range(amount - tolerance..=amount + tolerance)
            .flat_map(|(_, positions)| positions.iter().copied())
            .collect()
    }

    /// Positions with the same cleaned counterparty
    pub fn by_counterparty(&self, counterparty: &str) -> BTreeSet<usize> {
        self.by_counterparty
            .get(&clean(counterparty))
            .map(|positions| positions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Positions whose expected week is within +-1 week of the date's
    /// week, widened to the policy date window
    pub fn by_week_window(&self, date: NaiveDate, window_days: i64) -> BTreeSet<usize> {
        let weeks = (window_days / 7).max(1);
        let center = week_start(date);
        let lo = center - chrono::Duration::weeks(weeks);
        let hi = center + chrono::Duration::weeks(weeks);
        self.by_week
            .range(lo..=hi)
            .flat_map(|(_, positions)| positions.iter().copied())
            .collect()
    }
}
