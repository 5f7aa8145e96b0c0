//! Canonical identity
//!
//! Content-addressed fingerprinting of business documents. The same
//! document re-ingested with cosmetic differences (whitespace, case,
//! punctuation, trailing zeros) must produce the same `canonical_id`, so
//! identity is computed over a normalized tuple, hashed with SHA-256 and
//! truncated to 32 hex chars.
//!
//! When the source system provides a stable `external_id`, external
//! identity always wins and replaces the component tuple.

use crate::models::Cents;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which ledger a record lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// AR: becomes an [`crate::models::Invoice`]
    Receivable,

    /// AP: becomes a [`crate::models::VendorBill`]
    Payable,
}

/// One canonical record handed to ingest
///
/// Producers (spreadsheet and bank-file parsers) live outside the core;
/// they emit these records with source formatting intact. Normalization
/// happens here, once, at identity time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub kind: RecordKind,
    pub source_system: String,
    pub entity_id: String,

    /// Stable source identity; wins over the component tuple when present
    pub external_id: Option<String>,

    pub document_type: String,
    pub document_number: String,

    /// Customer (AR) or vendor (AP)
    pub counterparty: String,
    pub counterparty_id: Option<String>,

    pub country: String,
    pub terms_of_payment: String,

    /// Decimal amount as parsed from the source; quantized to cents here
    pub amount: f64,
    pub currency: String,

    pub document_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub line_id: Option<String>,

    // AR-only
    pub payment_date: Option<NaiveDate>,
    pub parent_document_number: Option<String>,
    pub relationship_type: crate::models::RelationshipType,

    // AP-only
    pub scheduled_payment_date: Option<NaiveDate>,
    pub on_hold: bool,
    pub approval_date: Option<NaiveDate>,
    pub is_discretionary: bool,
    pub category: String,
    pub recurring_template_id: Option<String>,
}

impl IngestRecord {
    /// Minimal receivable record; optional fields via struct update
    pub fn receivable(
        source_system: String,
        entity_id: String,
        document_number: String,
        customer: String,
        amount: f64,
        currency: String,
        document_date: NaiveDate,
    ) -> Self {
        Self {
            kind: RecordKind::Receivable,
            source_system,
            entity_id,
            external_id: None,
            document_type: "invoice".to_string(),
            document_number,
            counterparty: customer,
            counterparty_id: None,
            country: String::new(),
            terms_of_payment: String::new(),
            amount,
            currency,
            document_date,
            due_date: None,
            line_id: None,
            payment_date: None,
            parent_document_number: None,
            relationship_type: crate::models::RelationshipType::Original,
            scheduled_payment_date: None,
            on_hold: false,
            approval_date: None,
            is_discretionary: false,
            category: String::new(),
            recurring_template_id: None,
        }
    }

    /// Minimal payable record; optional fields via struct update
    pub fn payable(
        source_system: String,
        entity_id: String,
        document_number: String,
        vendor: String,
        amount: f64,
        currency: String,
        document_date: NaiveDate,
    ) -> Self {
        Self {
            kind: RecordKind::Payable,
            document_type: "vendor_bill".to_string(),
            ..Self::receivable(
                source_system,
                entity_id,
                document_number,
                vendor,
                amount,
                currency,
                document_date,
            )
        }
    }

    /// Quantized amount in cents
    pub fn amount_cents(&self) -> Cents {
        quantize_cents(self.amount)
    }

    /// Canonical id for this record: external identity when present,
    /// component tuple otherwise
    pub fn canonical_id(&self) -> String {
        match &self.external_id {
            Some(ext) => fingerprint(&[
                "ext",
                &self.source_system,
                &self.entity_id,
                &clean(ext),
            ]),
            None => self.tuple_fingerprint(),
        }
    }

    /// Component-tuple fingerprint, regardless of external identity.
    /// Used to surface possible collisions when both identities exist.
    pub fn tuple_fingerprint(&self) -> String {
        let amount = format_cents(self.amount_cents());
        let due = self.due_date.map(|d| d.to_string()).unwrap_or_default();
        let line = self.line_id.as_deref().unwrap_or_default();
        fingerprint(&[
            "tuple",
            &self.source_system,
            &self.entity_id,
            &clean(&self.document_type),
            &clean(&self.document_number),
            &clean(&self.counterparty),
            &self.currency,
            &amount,
            &self.document_date.to_string(),
            &due,
            line,
        ])
    }
}

/// Normalize a free-form field for identity purposes: lowercase, keep
/// alphanumerics only (drops whitespace and punctuation in one pass)
pub fn clean(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Round a source decimal to 2 places, as integer cents
pub fn quantize_cents(amount: f64) -> Cents {
    (amount * 100.0).round() as Cents
}

/// Render cents as a fixed 2-decimal string for hashing
fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// SHA-256 over the joined parts, truncated to 32 hex chars
fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]); // unit separator so fields cannot bleed
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    hex[..32].to_string()
}
