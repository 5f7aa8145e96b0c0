//! Treasury Core - 13-week cash-flow forecasting and reconciliation
//!
//! Deterministic core of a treasury forecasting engine: canonical
//! identity and idempotent ingest, a probabilistic AR delay model with
//! split-conformal calibration, payment-run-aware AP projection, a
//! four-tier reconciliation ladder with a constrained allocation solver,
//! an immutable snapshot state machine and a complete variance
//! decomposition. Every aggregate number is traceable to the row ids
//! behind it.
//!
//! # Architecture
//!
//! - **core**: calendar math for the weekly horizon
//! - **models**: domain types (Snapshot, Invoice, VendorBill,
//!   BankTransaction, MatchAllocation, ...)
//! - **repo**: in-memory tabular repository; the single write choke
//!   point where lock immutability is enforced
//! - **ingest**: content-addressed identity and idempotent upsert
//! - **fx**: snapshot-frozen weekly FX with an explicit Missing sentinel
//! - **forecast**: segment delay model, calibration, regime detection,
//!   weekly allocation
//! - **ap**: payment-run cash-exit projection
//! - **workspace**: the 13-week grid with exact drilldowns
//! - **recon**: blocking indexes, the matching ladder, the allocation
//!   solver with conservation proofs, unmatched workflow
//! - **locking**: lock gates, state machine, lock-time digest
//! - **truth**: truth labels, Unknown bucket, trust report
//! - **variance**: four-category snapshot diff
//! - **orchestrator**: the `TreasuryEngine` facade a transport layer
//!   wraps
//!
//! # Critical Invariants
//!
//! 1. All money values are i64 (cents)
//! 2. Re-running any pipeline is idempotent
//! 3. A locked snapshot, and everything it owns, is immutable
//! 4. No silent FX fallback: a missing pair is an error, never 1.0
//! 5. Every grid cell equals the sum of its drilldown exactly

// Module declarations
pub mod ap;
pub mod core;
pub mod forecast;
pub mod fx;
pub mod ingest;
pub mod locking;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod recon;
pub mod repo;
pub mod truth;
pub mod variance;
pub mod workspace;

// Re-exports for convenience
pub use fx::{FxError, FxTable};
pub use ingest::{IngestRecord, IngestSummary, RecordKind};
pub use models::{
    BankTransaction, Cents, Entity, Invoice, MatchAllocation, MatchingPolicy, Snapshot,
    SnapshotConfig, SnapshotStatus, TruthLabel, UnknownReason, VendorBill,
};
pub use orchestrator::{EngineError, SnapshotLineage, TreasuryEngine};
pub use progress::{CancellationToken, NullSink, ProgressEvent, ProgressSink};
pub use repo::{RepoError, Repository};
