//! VendorBill (AP) model
//!
//! A payable owned by exactly one snapshot. Cash exit timing follows the
//! entity's payment-run cadence unless a scheduled date or an approved
//! off-cycle exception overrides it.
//!
//! CRITICAL: All money values are i64 (cents)

use crate::models::{Cents, TruthLabel};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Payment hold state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    /// Normal processing
    Active,

    /// Payment blocked; routed to the Unknown bucket
    Held,
}

/// Approved off-cycle payment exception
///
/// Overrides the payment-run rule for a single bill, with the approval
/// stamp that authorized it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRunException {
    /// Canonical id of the bill being overridden
    pub bill_canonical_id: String,

    /// Snapshot scope of the exception
    pub snapshot_id: String,

    /// The off-cycle date the payment will be dispatched
    pub override_date: NaiveDate,

    /// Who approved the exception
    pub approved_by: String,
}

/// A payable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorBill {
    /// Row identifier (UUID)
    id: String,

    /// Owning snapshot
    snapshot_id: String,

    /// Content-addressed identity, stable across re-ingests
    canonical_id: String,

    vendor: String,

    /// Bill amount (i64 cents, document currency)
    amount: Cents,
    currency: String,

    bill_date: NaiveDate,
    due_date: Option<NaiveDate>,

    /// Explicit dispatch date; wins over the payment-run rule
    scheduled_payment_date: Option<NaiveDate>,

    hold_status: HoldStatus,
    approval_date: Option<NaiveDate>,
    is_discretionary: bool,
    category: String,

    /// Set when this row was generated from a recurring template
    recurring_template_id: Option<String>,

    /// Assigned during aggregation; exactly one label per evaluation
    truth_label: Option<TruthLabel>,
}

impl VendorBill {
    /// Create a new vendor bill row
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        snapshot_id: String,
        canonical_id: String,
        vendor: String,
        amount: Cents,
        currency: String,
        bill_date: NaiveDate,
        category: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            snapshot_id,
            canonical_id,
            vendor,
            amount,
            currency,
            bill_date,
            due_date: None,
            scheduled_payment_date: None,
            hold_status: HoldStatus::Active,
            approval_date: None,
            is_discretionary: false,
            category,
            recurring_template_id: None,
            truth_label: None,
        }
    }

    /// Set the due date (builder pattern)
    pub fn with_due_date(mut self, due: NaiveDate) -> Self {
        self.due_date = Some(due);
        self
    }

    /// Set an explicit scheduled payment date (builder pattern)
    pub fn with_scheduled_payment(mut self, date: NaiveDate) -> Self {
        self.scheduled_payment_date = Some(date);
        self
    }

    /// Put the bill on hold (builder pattern)
    pub fn held(mut self) -> Self {
        self.hold_status = HoldStatus::Held;
        self
    }

    /// Record approval (builder pattern)
    pub fn approved_on(mut self, date: NaiveDate) -> Self {
        self.approval_date = Some(date);
        self
    }

    /// Mark the bill discretionary (builder pattern)
    pub fn discretionary(mut self) -> Self {
        self.is_discretionary = true;
        self
    }

    /// Mark the bill as generated from a recurring template (builder)
    pub fn from_template(mut self, template_id: String) -> Self {
        self.recurring_template_id = Some(template_id);
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

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Bill amount (i64 cents, document currency)
    pub fn amount(&self) -> Cents {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn bill_date(&self) -> NaiveDate {
        self.bill_date
    }

    pub fn due_date(&self) -> Option<NaiveDate> {
        self.due_date
    }

    pub fn scheduled_payment_date(&self) -> Option<NaiveDate> {
        self.scheduled_payment_date
    }

    pub fn hold_status(&self) -> HoldStatus {
        self.hold_status
    }

    pub fn is_held(&self) -> bool {
        self.hold_status == HoldStatus::Held
    }

    pub fn approval_date(&self) -> Option<NaiveDate> {
        self.approval_date
    }

    pub fn is_approved(&self) -> bool {
        self.approval_date.is_some()
    }

    pub fn is_discretionary(&self) -> bool {
        self.is_discretionary
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn recurring_template_id(&self) -> Option<&str> {
        self.recurring_template_id.as_deref()
    }

    /// True when this row came from a recurring template rather than a
    /// concrete document
    pub fn is_template_generated(&self) -> bool {
        self.recurring_template_id.is_some()
    }

    pub fn truth_label(&self) -> Option<TruthLabel> {
        self.truth_label
    }

    /// Record the truth label assigned during aggregation
    pub fn set_truth_label(&mut self, label: TruthLabel) {
        self.truth_label = Some(label);
    }

    /// Apply a re-ingest update: only business-mutable fields move
    pub fn apply_update(
        &mut self,
        amount: Cents,
        due_date: Option<NaiveDate>,
        scheduled_payment_date: Option<NaiveDate>,
        hold_status: HoldStatus,
        approval_date: Option<NaiveDate>,
    ) {
        self.amount = amount;
        self.due_date = due_date;
        self.scheduled_payment_date = scheduled_payment_date;
        self.hold_status = hold_status;
        self.approval_date = approval_date;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_generated_flag() {
        let bill = VendorBill::new(
            "S1".to_string(),
            "C1".to_string(),
            "HOSTCO".to_string(),
            50_000,
            "EUR".to_string(),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            "hosting".to_string(),
        )
        .from_template("TPL-7".to_string());

        assert!(bill.is_template_generated());
        assert_eq!(bill.recurring_template_id(), Some("TPL-7"));
    }
}
