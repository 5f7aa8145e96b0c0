//! Matching policy
//!
//! Tolerances and switches for the reconciliation ladder. Policies are a
//! tagged lookup, not a hierarchy: resolution tries `(entity, currency)`,
//! then `(entity, *)`, then the global default. Policy changes are audited
//! by the engine.

use crate::models::Cents;
use serde::{Deserialize, Serialize};

/// Reconciliation tolerances for one (entity, currency) scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingPolicy {
    /// `None` = applies to all entities (global default)
    pub entity_id: Option<String>,

    /// `None` = applies to all currencies of the entity
    pub currency: Option<String>,

    /// Max |txn.amount - invoice.amount| for tiers 1 and 2 (cents)
    pub amount_tolerance: Cents,

    /// Max |txn.date - expected_due_date| for tier 2 (days)
    pub date_window_days: i64,

    /// Tier 1 additionally requires counterparty similarity
    pub require_counterparty_tier1: bool,

    pub auto_reconcile_tier1: bool,
    pub auto_reconcile_tier2: bool,

    /// Minimum tier-3 similarity score to emit a suggestion
    pub suggestion_floor: f64,

    /// Business days before an unmatched transaction breaches SLA
    pub sla_business_days: u32,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        Self {
            entity_id: None,
            currency: None,
            amount_tolerance: 1,
            date_window_days: 30,
            require_counterparty_tier1: true,
            auto_reconcile_tier1: true,
            auto_reconcile_tier2: true,
            suggestion_floor: 0.65,
            sla_business_days: 5,
        }
    }
}

impl MatchingPolicy {
    /// Scope a policy to an entity (builder pattern)
    pub fn for_entity(mut self, entity_id: String) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Scope a policy to a currency (builder pattern)
    pub fn for_currency(mut self, currency: String) -> Self {
        self.currency = Some(currency);
        self
    }

    /// Resolve the applicable policy: (entity, currency) -> (entity, *) ->
    /// global default
    pub fn resolve<'a>(
        policies: &'a [MatchingPolicy],
        entity_id: &str,
        currency: &str,
    ) -> MatchingPolicy {
        let exact = policies.iter().find(|p| {
            p.entity_id.as_deref() == Some(entity_id) && p.currency.as_deref() == Some(currency)
        });
        let entity_wide = policies
            .iter()
            .find(|p| p.entity_id.as_deref() == Some(entity_id) && p.currency.is_none());
        let global: Option<&'a MatchingPolicy> = policies
            .iter()
            .find(|p| p.entity_id.is_none() && p.currency.is_none());

        exact
            .or(entity_wide)
            .or(global)
            .cloned()
            .unwrap_or_default()
    }
}
