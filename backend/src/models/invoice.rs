//! Invoice (AR) model
//!
//! An open or paid receivable owned by exactly one snapshot. Identity is
//! content-addressed: `(snapshot_id, canonical_id)` is unique, so
//! re-ingesting the same business document can only update the existing
//! row.
//!
//! CRITICAL: All money values are i64 (cents)

use crate::models::{Cents, TruthLabel};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// How a document relates to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Original,
    CreditNote,
    Rebill,
    Partial,
    Adjustment,
}

/// Predicted payment quantile dates (P25/P50/P75/P90)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceDates {
    pub p25: NaiveDate,
    pub p50: NaiveDate,
    pub p75: NaiveDate,
    pub p90: NaiveDate,
}

/// An open or paid receivable
///
/// Mutable fields (amount, dates, prediction outputs) change only through
/// the repository layer, which rejects writes once the owning snapshot is
/// locked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    /// Row identifier (UUID)
    id: String,

    /// Owning snapshot
    snapshot_id: String,

    /// Content-addressed identity, stable across re-ingests
    canonical_id: String,

    entity_id: String,
    document_type: String,
    document_number: String,
    customer: String,
    counterparty_id: Option<String>,
    country: String,
    terms_of_payment: String,

    /// Original document amount (i64 cents, document currency)
    amount: Cents,
    currency: String,

    document_date: NaiveDate,
    expected_due_date: Option<NaiveDate>,

    /// Set when the receivable has actually been paid
    payment_date: Option<NaiveDate>,

    /// Forecast outputs, populated by the segment delay model
    predicted_payment_date: Option<NaiveDate>,
    confidence: Option<ConfidenceDates>,
    prediction_segment: Option<String>,

    /// Assigned during aggregation; exactly one label per evaluation
    truth_label: Option<TruthLabel>,

    /// Canonical id of the parent document, for credit notes / rebills
    parent_invoice_id: Option<String>,
    relationship_type: RelationshipType,
}

impl Invoice {
    /// Create a new invoice row
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        snapshot_id: String,
        canonical_id: String,
        entity_id: String,
        document_type: String,
        document_number: String,
        customer: String,
        country: String,
        terms_of_payment: String,
        amount: Cents,
        currency: String,
        document_date: NaiveDate,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            snapshot_id,
            canonical_id,
            entity_id,
            document_type,
            document_number,
            customer,
            counterparty_id: None,
            country,
            terms_of_payment,
            amount,
            currency,
            document_date,
            expected_due_date: None,
            payment_date: None,
            predicted_payment_date: None,
            confidence: None,
            prediction_segment: None,
            truth_label: None,
            parent_invoice_id: None,
            relationship_type: RelationshipType::Original,
        }
    }

    /// Set the expected due date (builder pattern)
    pub fn with_due_date(mut self, due: NaiveDate) -> Self {
        self.expected_due_date = Some(due);
        self
    }

    /// Set the payment date (builder pattern)
    pub fn with_payment_date(mut self, paid: NaiveDate) -> Self {
        self.payment_date = Some(paid);
        self
    }

    /// Set the counterparty id (builder pattern)
    pub fn with_counterparty(mut self, counterparty_id: String) -> Self {
        self.counterparty_id = Some(counterparty_id);
        self
    }

    /// Set parent linkage (builder pattern)
    pub fn with_parent(mut self, parent_canonical_id: String, rel: RelationshipType) -> Self {
        self.parent_invoice_id = Some(parent_canonical_id);
        self.relationship_type = rel;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub fn canonical_id(&self) -> &str {
        &self.canonical_id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn document_type(&self) -> &str {
        &self.document_type
    }

    pub fn document_number(&self) -> &str {
        &self.document_number
    }

    pub fn customer(&self) -> &str {
        &self.customer
    }

    pub fn counterparty_id(&self) -> Option<&str> {
        self.counterparty_id.as_deref()
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    pub fn terms_of_payment(&self) -> &str {
        &self.terms_of_payment
    }

    /// Original amount (i64 cents, document currency)
    pub fn amount(&self) -> Cents {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn document_date(&self) -> NaiveDate {
        self.document_date
    }

    pub fn expected_due_date(&self) -> Option<NaiveDate> {
        self.expected_due_date
    }

    pub fn payment_date(&self) -> Option<NaiveDate> {
        self.payment_date
    }

    /// An invoice is open until a payment date is recorded
    pub fn is_open(&self) -> bool {
        self.payment_date.is_none()
    }

    /// Observed payment delay in days, for paid invoices with a due date
    pub fn delay_days(&self) -> Option<i64> {
        match (self.payment_date, self.expected_due_date) {
            (Some(paid), Some(due)) => Some((paid - due).num_days()),
            _ => None,
        }
    }

    pub fn predicted_payment_date(&self) -> Option<NaiveDate> {
        self.predicted_payment_date
    }

    pub fn confidence(&self) -> Option<&ConfidenceDates> {
        self.confidence.as_ref()
    }

    pub fn prediction_segment(&self) -> Option<&str> {
        self.prediction_segment.as_deref()
    }

    pub fn truth_label(&self) -> Option<TruthLabel> {
        self.truth_label
    }

    pub fn parent_invoice_id(&self) -> Option<&str> {
        self.parent_invoice_id.as_deref()
    }

    pub fn relationship_type(&self) -> RelationshipType {
        self.relationship_type
    }

    /// Apply a re-ingest update: only business-mutable fields move
    pub fn apply_update(
        &mut self,
        amount: Cents,
        document_date: NaiveDate,
        expected_due_date: Option<NaiveDate>,
        payment_date: Option<NaiveDate>,
    ) {
        self.amount = amount;
        self.document_date = document_date;
        self.expected_due_date = expected_due_date;
        self.payment_date = payment_date;
    }

    /// Record forecast outputs
    pub fn set_prediction(
        &mut self,
        predicted: NaiveDate,
        confidence: ConfidenceDates,
        segment: String,
    ) {
        self.predicted_payment_date = Some(predicted);
        self.confidence = Some(confidence);
        self.prediction_segment = Some(segment);
    }

    /// Clear forecast outputs (item routed to Unknown)
    pub fn clear_prediction(&mut self) {
        self.predicted_payment_date = None;
        self.confidence = None;
        self.prediction_segment = None;
    }

    /// Record the truth label assigned during aggregation
    pub fn set_truth_label(&mut self, label: TruthLabel) {
        self.truth_label = Some(label);
    }

    /// Link to a parent document resolved after the batch is in
    pub fn set_parent(&mut self, parent_canonical_id: String, rel: RelationshipType) {
        self.parent_invoice_id = Some(parent_canonical_id);
        self.relationship_type = rel;
    }
}
