//! Idempotent ingest pipeline
//!
//! Writes canonical records into a snapshot. Identity is content-addressed
//! (see [`canonical`]); `(snapshot_id, canonical_id)` is unique, so running
//! the same batch twice yields byte-identical repository state: the second
//! run counts every row as skipped.
//!
//! Ingest is polymorphic over record producers: parsers for spreadsheets
//! and bank formats live outside the core and only need to emit
//! [`IngestRecord`]s.
//!
//! # Critical Invariants
//!
//! 1. Idempotency: `ingest(S, R); ingest(S, R)` == `ingest(S, R)`
//! 2. Re-ingest updates mutable business fields in place, never identity
//! 3. The whole batch commits or nothing does
//! 4. A locked snapshot rejects the batch with `SnapshotLocked`

pub mod canonical;

pub use canonical::{clean, quantize_cents, IngestRecord, RecordKind};

use crate::models::{HoldStatus, Invoice, VendorBill};
use crate::progress::{CancellationToken, ProgressEvent, ProgressSink};
use crate::repo::{RepoError, Repository};
use thiserror::Error;

/// Ingest pipeline errors
#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    /// Cancelled between batches; the transaction rolled back, nothing
    /// was written
    #[error("ingest cancelled")]
    Cancelled,
}

/// Possible identity collision: a record's external id and its component
/// tuple resolve to different existing rows. Never auto-merged.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PossibleCollision {
    pub canonical_id: String,
    pub tuple_fingerprint: String,
    pub document_number: String,
}

/// Outcome of one ingest batch
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IngestSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,

    /// Canonical ids whose parent reference did not resolve within the
    /// snapshot; flagged for reporting, not an error
    pub unresolved_parents: Vec<String>,

    /// External-id records whose tuple matched a different row
    pub possible_collisions: Vec<PossibleCollision>,
}

/// Ingest a batch of canonical records into a snapshot
///
/// For each record: compute the canonical id; update mutable fields in
/// place if `(snapshot_id, canonical_id)` exists, insert otherwise.
/// Parent references are resolved once the whole batch is in.
pub fn ingest(
    repo: &mut Repository,
    snapshot_id: &str,
    records: &[IngestRecord],
    cancel: &CancellationToken,
    sink: &mut dyn ProgressSink,
) -> Result<IngestSummary, IngestError> {
    // Surface SnapshotLocked before doing any work
    let snapshot = repo.snapshot(snapshot_id)?;
    if snapshot.is_locked() {
        return Err(IngestError::Repo(RepoError::SnapshotLocked {
            snapshot_id: snapshot_id.to_string(),
        }));
    }

    let snapshot_id = snapshot_id.to_string();
    repo.with_transaction(|repo| {
        let mut summary = IngestSummary::default();

        for (i, record) in records.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            upsert_record(repo, &snapshot_id, record, &mut summary)?;
            if (i + 1) % 1000 == 0 || i + 1 == records.len() {
                sink.report(ProgressEvent {
                    pipeline: "ingest".to_string(),
                    stage: "upsert".to_string(),
                    processed: i + 1,
                    total: Some(records.len()),
                });
            }
        }

        resolve_parents(repo, &snapshot_id, records, &mut summary)?;
        Ok(summary)
    })
}

fn upsert_record(
    repo: &mut Repository,
    snapshot_id: &str,
    record: &IngestRecord,
    summary: &mut IngestSummary,
) -> Result<(), IngestError> {
    let canonical_id = record.canonical_id();

    // External identity wins, but when the component tuple points at a
    // different existing row the conflict is surfaced, never merged.
    if record.external_id.is_some() {
        let tuple = record.tuple_fingerprint();
        let tuple_row_exists = match record.kind {
            RecordKind::Receivable => repo.invoice_by_canonical(snapshot_id, &tuple).is_some(),
            RecordKind::Payable => repo.bill_by_canonical(snapshot_id, &tuple).is_some(),
        };
        if tuple != canonical_id && tuple_row_exists {
            summary.possible_collisions.push(PossibleCollision {
                canonical_id: canonical_id.clone(),
                tuple_fingerprint: tuple,
                document_number: record.document_number.clone(),
            });
        }
    }

    match record.kind {
        RecordKind::Receivable => upsert_invoice(repo, snapshot_id, record, canonical_id, summary),
        RecordKind::Payable => upsert_bill(repo, snapshot_id, record, canonical_id, summary),
    }
}

fn upsert_invoice(
    repo: &mut Repository,
    snapshot_id: &str,
    record: &IngestRecord,
    canonical_id: String,
    summary: &mut IngestSummary,
) -> Result<(), IngestError> {
    let amount = record.amount_cents();

    if let Some(existing) = repo.invoice_by_canonical(snapshot_id, &canonical_id) {
        let changed = existing.amount() != amount
            || existing.document_date() != record.document_date
            || existing.expected_due_date() != record.due_date
            || existing.payment_date() != record.payment_date;
        if changed {
            let id = existing.id().to_string();
            repo.update_invoice(&id, |inv| {
                inv.apply_update(amount, record.document_date, record.due_date, record.payment_date);
            })?;
            summary.updated += 1;
        } else {
            summary.skipped += 1;
        }
        return Ok(());
    }

    let mut invoice = Invoice::new(
        snapshot_id.to_string(),
        canonical_id,
        record.entity_id.clone(),
        record.document_type.clone(),
        record.document_number.clone(),
        record.counterparty.clone(),
        record.country.clone(),
        record.terms_of_payment.clone(),
        amount,
        record.currency.clone(),
        record.document_date,
    );
    if let Some(due) = record.due_date {
        invoice = invoice.with_due_date(due);
    }
    if let Some(paid) = record.payment_date {
        invoice = invoice.with_payment_date(paid);
    }
    if let Some(cp) = &record.counterparty_id {
        invoice = invoice.with_counterparty(cp.clone());
    }
    repo.insert_invoice(invoice)?;
    summary.inserted += 1;
    Ok(())
}

fn upsert_bill(
    repo: &mut Repository,
    snapshot_id: &str,
    record: &IngestRecord,
    canonical_id: String,
    summary: &mut IngestSummary,
) -> Result<(), IngestError> {
    let amount = record.amount_cents();
    let hold = if record.on_hold {
        HoldStatus::Held
    } else {
        HoldStatus::Active
    };

    if let Some(existing) = repo.bill_by_canonical(snapshot_id, &canonical_id) {
        let changed = existing.amount() != amount
            || existing.due_date() != record.due_date
            || existing.scheduled_payment_date() != record.scheduled_payment_date
            || existing.hold_status() != hold
            || existing.approval_date() != record.approval_date;
        if changed {
            let id = existing.id().to_string();
            repo.update_bill(&id, |bill| {
                bill.apply_update(
                    amount,
                    record.due_date,
                    record.scheduled_payment_date,
                    hold,
                    record.approval_date,
                );
            })?;
            summary.updated += 1;
        } else {
            summary.skipped += 1;
        }
        return Ok(());
    }

    let mut bill = VendorBill::new(
        snapshot_id.to_string(),
        canonical_id,
        record.counterparty.clone(),
        amount,
        record.currency.clone(),
        record.document_date,
        record.category.clone(),
    );
    if let Some(due) = record.due_date {
        bill = bill.with_due_date(due);
    }
    if let Some(scheduled) = record.scheduled_payment_date {
        bill = bill.with_scheduled_payment(scheduled);
    }
    if record.on_hold {
        bill = bill.held();
    }
    if let Some(approved) = record.approval_date {
        bill = bill.approved_on(approved);
    }
    if record.is_discretionary {
        bill = bill.discretionary();
    }
    if let Some(tpl) = &record.recurring_template_id {
        bill = bill.from_template(tpl.clone());
    }
    repo.insert_bill(bill)?;
    summary.inserted += 1;
    Ok(())
}

/// Resolve parent document references within the snapshot. Parents are
/// matched on cleaned document number; unresolved references are flagged,
/// not failed.
fn resolve_parents(
    repo: &mut Repository,
    snapshot_id: &str,
    records: &[IngestRecord],
    summary: &mut IngestSummary,
) -> Result<(), IngestError> {
    use std::collections::BTreeMap;

    // cleaned document number -> canonical id, for this snapshot
    let by_doc: BTreeMap<String, String> = repo
        .invoices_for_snapshot(snapshot_id)
        .iter()
        .map(|inv| (clean(inv.document_number()), inv.canonical_id().to_string()))
        .collect();

    for record in records {
        let Some(parent_doc) = &record.parent_document_number else {
            continue;
        };
        let canonical_id = record.canonical_id();
        let Some(child) = repo.invoice_by_canonical(snapshot_id, &canonical_id) else {
            continue;
        };
        let child_id = child.id().to_string();
        match by_doc.get(&clean(parent_doc)) {
            Some(parent_canonical) if *parent_canonical != canonical_id => {
                let parent_canonical = parent_canonical.clone();
                let rel = record.relationship_type;
                repo.update_invoice(&child_id, |inv| {
                    inv.set_parent(parent_canonical, rel);
                })?;
            }
            _ => summary.unresolved_parents.push(canonical_id),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, Snapshot, SnapshotConfig};
    use crate::progress::NullSink;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn setup() -> (Repository, String) {
        let mut repo = Repository::new();
        repo.insert_entity(Entity::new("E1".to_string(), "EUR".to_string(), 4))
            .unwrap();
        let snapshot = Snapshot::new("E1".to_string(), d(2024, 3, 11), 0, SnapshotConfig::default());
        let sid = snapshot.id().to_string();
        repo.insert_snapshot(snapshot).unwrap();
        (repo, sid)
    }

    fn rec(doc: &str, amount: f64) -> IngestRecord {
        IngestRecord::receivable(
            "erp".to_string(),
            "E1".to_string(),
            doc.to_string(),
            "ACME".to_string(),
            amount,
            "EUR".to_string(),
            d(2024, 2, 1),
        )
    }

    #[test]
    fn test_second_run_skips_everything() {
        let (mut repo, sid) = setup();
        let records = vec![rec("INV-1", 100.0), rec("INV-2", 200.0)];
        let cancel = CancellationToken::new();

        let first = ingest(&mut repo, &sid, &records, &cancel, &mut NullSink).unwrap();
        assert_eq!((first.inserted, first.updated, first.skipped), (2, 0, 0));

        let second = ingest(&mut repo, &sid, &records, &cancel, &mut NullSink).unwrap();
        assert_eq!((second.inserted, second.updated, second.skipped), (0, 0, 2));
        assert_eq!(repo.invoices_for_snapshot(&sid).len(), 2);
    }

    #[test]
    fn test_amount_change_updates_in_place() {
        let (mut repo, sid) = setup();
        let cancel = CancellationToken::new();
        ingest(&mut repo, &sid, &[rec("INV-1", 100.0)], &cancel, &mut NullSink).unwrap();

        // same identity tuple except amount: that is a new document
        let restated = rec("INV-1", 150.0);
        let out = ingest(&mut repo, &sid, &[restated], &cancel, &mut NullSink).unwrap();
        assert_eq!(out.inserted, 1);

        // same identity with a payment date arriving later: update in place
        let mut paid = rec("INV-1", 100.0);
        paid.payment_date = Some(d(2024, 3, 1));
        let out = ingest(&mut repo, &sid, &[paid], &cancel, &mut NullSink).unwrap();
        assert_eq!(out.updated, 1);
    }

    #[test]
    fn test_cancellation_rolls_back() {
        let (mut repo, sid) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err =
            ingest(&mut repo, &sid, &[rec("INV-1", 100.0)], &cancel, &mut NullSink).unwrap_err();
        assert_eq!(err, IngestError::Cancelled);
        assert!(repo.invoices_for_snapshot(&sid).is_empty());
    }

    #[test]
    fn test_unresolved_parent_is_flagged() {
        let (mut repo, sid) = setup();
        let cancel = CancellationToken::new();
        let mut credit = rec("CN-9", -20.0);
        credit.parent_document_number = Some("INV-404".to_string());
        credit.relationship_type = crate::models::RelationshipType::CreditNote;

        let out = ingest(&mut repo, &sid, &[credit.clone()], &cancel, &mut NullSink).unwrap();
        assert_eq!(out.unresolved_parents, vec![credit.canonical_id()]);
    }

    #[test]
    fn test_parent_resolves_within_snapshot() {
        let (mut repo, sid) = setup();
        let cancel = CancellationToken::new();
        let parent = rec("INV-1", 100.0);
        let mut credit = rec("CN-1", -20.0);
        credit.parent_document_number = Some("inv 1".to_string());
        credit.relationship_type = crate::models::RelationshipType::CreditNote;

        let out = ingest(
            &mut repo,
            &sid,
            &[parent.clone(), credit.clone()],
            &cancel,
            &mut NullSink,
        )
        .unwrap();
        assert!(out.unresolved_parents.is_empty());

        let child = repo
            .invoice_by_canonical(&sid, &credit.canonical_id())
            .unwrap();
        assert_eq!(child.parent_invoice_id(), Some(parent.canonical_id().as_str()));
    }
}
