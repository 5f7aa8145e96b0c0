//! Append-only audit log
//!
//! Records every state-changing operation with a structured change delta.
//! The log is append-only and sequence numbers are strictly monotonic;
//! recorded timestamps never go backwards even if the wall clock does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audited state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Strictly monotonic sequence number
    pub seq: u64,

    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub entity_id: String,
    pub snapshot_id: Option<String>,

    /// Operation name, e.g. "ingest_records", "lock_snapshot"
    pub action: String,

    pub resource_type: String,
    pub resource_id: String,

    /// Structured before/after or summary payload
    pub change_delta: serde_json::Value,

    pub ip_address: Option<String>,
}

/// Append-only event log
///
/// # Example
/// ```
/// use treasury_core_rs::models::AuditLog;
///
/// let mut log = AuditLog::new();
/// log.append(
///     "cfo".to_string(),
///     "ACME_DE".to_string(),
///     None,
///     "create_snapshot".to_string(),
///     "snapshot".to_string(),
///     "S1".to_string(),
///     serde_json::json!({"as_of": "2024-03-11"}),
/// );
/// assert_eq!(log.len(), 1);
/// assert_eq!(log.events()[0].seq, 0);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditLog {
    events: Vec<AuditEvent>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event; sequence and timestamp monotonicity are enforced
    /// here, not trusted from the caller
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        user: String,
        entity_id: String,
        snapshot_id: Option<String>,
        action: String,
        resource_type: String,
        resource_id: String,
        change_delta: serde_json::Value,
    ) -> u64 {
        let seq = self.events.len() as u64;
        let mut timestamp = Utc::now();
        if let Some(last) = self.events.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }
        self.events.push(AuditEvent {
            seq,
            timestamp,
            user,
            entity_id,
            snapshot_id,
            action,
            resource_type,
            resource_id,
            change_delta,
            ip_address: None,
        });
        seq
    }

    /// All events in append order
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events touching a given snapshot
    pub fn for_snapshot<'a>(
        &'a self,
        snapshot_id: &'a str,
    ) -> impl Iterator<Item = &'a AuditEvent> + 'a {
        self.events
            .iter()
            .filter(move |e| e.snapshot_id.as_deref() == Some(snapshot_id))
    }
}
