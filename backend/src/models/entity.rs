//! Entity model
//!
//! A legal or operating unit: owns bank transactions, defines the base
//! currency every forecast converts into, and carries the weekly payment-run
//! cadence for AP cash exits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A legal/operating unit
///
/// # Example
/// ```
/// use treasury_core_rs::models::Entity;
///
/// let entity = Entity::new("ACME_DE".to_string(), "EUR".to_string(), 4);
/// assert_eq!(entity.base_currency(), "EUR");
/// assert_eq!(entity.payment_run_day(), 4); // Friday
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Unique entity identifier (e.g., "ACME_DE")
    id: String,

    /// Reporting currency all grid amounts are converted into
    base_currency: String,

    /// Day of week AP payment runs are dispatched (0 = Monday .. 6 = Sunday)
    payment_run_day: u8,

    /// Identifiers of the entity's own bank accounts; transfers between
    /// these are wash movements, not cash flow
    internal_account_ids: BTreeSet<String>,
}

impl Entity {
    /// Create a new entity
    ///
    /// # Panics
    /// Panics if `payment_run_day > 6`.
    pub fn new(id: String, base_currency: String, payment_run_day: u8) -> Self {
        assert!(payment_run_day <= 6, "payment_run_day must be 0..=6");
        Self {
            id,
            base_currency,
            payment_run_day,
            internal_account_ids: BTreeSet::new(),
        }
    }

    /// Register internal account ids (builder pattern)
    pub fn with_internal_accounts<I>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.internal_account_ids.extend(accounts);
        self
    }

    /// Get entity ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get base (reporting) currency
    pub fn base_currency(&self) -> &str {
        &self.base_currency
    }

    /// Get payment run day (0 = Monday .. 6 = Sunday)
    pub fn payment_run_day(&self) -> u8 {
        self.payment_run_day
    }

    /// Check whether an account/counterparty key belongs to this entity
    pub fn is_internal_account(&self, key: &str) -> bool {
        self.internal_account_ids.contains(key)
    }

    /// Get the internal account set
    pub fn internal_account_ids(&self) -> &BTreeSet<String> {
        &self.internal_account_ids
    }
}
