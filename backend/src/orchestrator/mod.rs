//! Orchestrator - the engine facade over the treasury pipelines
//!
//! See `engine.rs` for the full operation surface.

pub mod engine;

// Re-export main types for convenience
pub use engine::{EngineError, SnapshotLineage, TreasuryEngine};
