//! Truth labels and Unknown-bucket reason codes
//!
//! Every amount that reaches an aggregate carries exactly one truth label,
//! so each headline number is decomposable into evidence classes. Data
//! gaps are not errors: they route into the Unknown bucket with a reason
//! code and are surfaced in the trust report.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Provenance class of an aggregated amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TruthLabel {
    /// Actual bank movement with no forecast component
    BankTrue,

    /// Invoice/bill fully allocated to bank transactions
    Reconciled,

    /// Open item contributing through the forecast distribution
    Modeled,

    /// Non-forecastable: see [`UnknownReason`]
    Unknown,
}

impl fmt::Display for TruthLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TruthLabel::BankTrue => "Bank-True",
            TruthLabel::Reconciled => "Reconciled",
            TruthLabel::Modeled => "Modeled",
            TruthLabel::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Why an item landed in the Unknown bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    /// No FX rate configured for the item's currency pair
    MissingFx,

    /// Item has no due date to forecast from
    MissingDueDate,

    /// Vendor bill is on payment hold
    HeldBill,

    /// Approval required by policy but no approval date present
    MissingApproval,
}

impl fmt::Display for UnknownReason {
    // Mirrors the serde snake_case names so reason codes in audit deltas
    // and reports agree.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnknownReason::MissingFx => "missing_fx",
            UnknownReason::MissingDueDate => "missing_due_date",
            UnknownReason::HeldBill => "held_bill",
            UnknownReason::MissingApproval => "missing_approval",
        };
        f.write_str(s)
    }
}
