//! Progress reporting and cancellation for long pipelines
//!
//! Ingest, reconciliation, forecast calibration and variance diffs can run
//! for seconds on realistic volumes. Each is structured as a batch
//! pipeline that emits progress events and polls a cancellation token
//! between stages. Cancellation discards partial work: the pipelines are
//! idempotent and run inside repository transactions, so a cancelled run
//! leaves no trace.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag
///
/// Cloned tokens share the flag. The outer layer cancels; pipelines poll
/// between stages, never mid-row.
///
/// # Example
/// ```
/// use treasury_core_rs::progress::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handle = token.clone();
/// assert!(!token.is_cancelled());
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Stage-level progress emitted by batch pipelines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Pipeline name, e.g. "ingest", "reconcile"
    pub pipeline: String,

    /// Stage within the pipeline, e.g. "blocking_index", "tier_2"
    pub stage: String,

    /// Rows processed so far in this stage
    pub processed: usize,

    /// Total rows in this stage, when known up front
    pub total: Option<usize>,
}

/// Sink for progress events
///
/// The outer layer can forward events to its task runner; the default
/// sink drops them.
pub trait ProgressSink {
    fn report(&mut self, event: ProgressEvent);
}

/// Sink that discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&mut self, _event: ProgressEvent) {}
}

/// Sink that records events, used by tests and the trust report
#[derive(Debug, Clone, Default)]
pub struct VecSink {
    pub events: Vec<ProgressEvent>,
}

impl ProgressSink for VecSink {
    fn report(&mut self, event: ProgressEvent) {
        self.events.push(event);
    }
}
