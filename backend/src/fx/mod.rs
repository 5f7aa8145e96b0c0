//! FX service
//!
//! Converts document-currency amounts into the entity base currency using
//! the snapshot-frozen weekly rate table. There is no silent `1.0`
//! fallback: a missing pair is a distinct `Missing` outcome, and
//! `convert` fails with [`FxError::Missing`] unless `from == to`.
//!
//! The table is loaded once per pipeline run ([`FxTable::load`]), which is
//! also the per-snapshot memoization the read path needs: repeated lookups
//! hit the in-memory map, never the repository.

use crate::models::Cents;
use crate::repo::Repository;
use chrono::NaiveDate;
use std::collections::HashMap;
use thiserror::Error;

/// FX conversion errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FxError {
    /// No rate configured for the pair; never defaulted to 1.0
    #[error("no FX rate configured for {from}->{to}")]
    Missing { from: String, to: String },
}

/// Outcome of a rate lookup; `Missing` is a sentinel, not 1.0
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLookup {
    Found(f64),
    Missing,
}

impl RateLookup {
    pub fn is_missing(&self) -> bool {
        matches!(self, RateLookup::Missing)
    }
}

/// Snapshot-scoped FX table, memoized for a pipeline run
#[derive(Debug, Clone)]
pub struct FxTable {
    /// (from, to) -> week bands sorted ascending by week start
    bands: HashMap<(String, String), Vec<(NaiveDate, f64)>>,
}

impl FxTable {
    /// Load and index all rates of a snapshot
    pub fn load(repo: &Repository, snapshot_id: &str) -> Self {
        let mut bands: HashMap<(String, String), Vec<(NaiveDate, f64)>> = HashMap::new();
        for rate in repo.fx_rates_for_snapshot(snapshot_id) {
            bands
                .entry((rate.from_currency.clone(), rate.to_currency.clone()))
                .or_default()
                .push((rate.effective_week_start, rate.rate));
        }
        for series in bands.values_mut() {
            series.sort_by_key(|(week, _)| *week);
        }
        Self { bands }
    }

    /// Rate for a pair at an effective date
    ///
    /// Picks the most recent band with `effective_week_start <= date`.
    /// When every configured band starts after the date (the single
    /// as-of-rate setup), the earliest band applies. `from == to` is
    /// always 1.0.
    pub fn rate(&self, from: &str, to: &str, date: NaiveDate) -> RateLookup {
        if from == to {
            return RateLookup::Found(1.0);
        }
        let Some(series) = self.bands.get(&(from.to_string(), to.to_string())) else {
            return RateLookup::Missing;
        };
        let mut chosen: Option<f64> = None;
        for (week, rate) in series {
            if *week <= date {
                chosen = Some(*rate);
            } else {
                break;
            }
        }
        match chosen.or_else(|| series.first().map(|(_, r)| *r)) {
            Some(rate) => RateLookup::Found(rate),
            None => RateLookup::Missing,
        }
    }

    /// Convert an amount (cents), rounding half-away-from-zero once
    pub fn convert(
        &self,
        amount: Cents,
        from: &str,
        to: &str,
        date: NaiveDate,
    ) -> Result<Cents, FxError> {
        match self.rate(from, to, date) {
            RateLookup::Found(rate) => {
                let converted = (amount as f64) * rate;
                Ok(converted.round() as Cents)
            }
            RateLookup::Missing => Err(FxError::Missing {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }

    /// True when the pair is resolvable at the given date
    pub fn can_convert(&self, from: &str, to: &str, date: NaiveDate) -> bool {
        !self.rate(from, to, date).is_missing()
    }
}
