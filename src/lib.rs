//! Request orchestration and usage accounting for AI completions.
//!
//! One logical "ask a model" call becomes an ordered chain of provider
//! attempts driven by live, operator-editable settings:
//! - [`agents`] holds the provider catalogue, settings resolution, candidate
//!   chain construction, pricing and the per-provider HTTP adapters.
//! - [`orchestrator`] runs the attempt loop and the single-provider probe.
//! - [`usage`] records one row per attempt and answers aggregate queries.
//! - [`db`] initialises the SQLite database and applies migrations.
//! - [`errors`] keeps the error catalogue with human friendly metadata.
//! - [`logging`] writes structured diagnostics to the event log table.
//! - [`api`] exposes the JSON-friendly command surface used by the host app.

pub mod agents;
pub mod api;
pub mod db;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod usage;

pub use orchestrator::{AiOrchestrator, AiResult, ProbeOutcome};
