//! Windowed, checkpointed processing of conversational event streams.
//!
//! Events are planned into windows, windows already journaled are skipped,
//! and each remaining window runs through a chain of schema-checked views
//! before a generation agent turns it into documents. Documents, journals
//! and run lineage all live in one SQLite store.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod events;
pub mod ir;
pub mod retry;
pub mod schema;
pub mod stage;
pub mod store;
pub mod tracking;
pub mod views;
pub mod windowing;

pub use agent::{DigestAgent, Generation, GenerationAgent, GenerationRequest, PriorContext, Usage};
pub use checkpoint::CheckpointJournal;
pub use config::{PipelineConfig, RetryConfig, StageSpec};
pub use engine::{BatchReport, CancelHandle, PipelineRunner, WindowOutcome, WindowReport};
pub use events::{EventEmitter, PipelineEvent};
pub use ir::canonical_registry;
pub use retry::{retry_generation, Backoff};
pub use schema::{structural_diff, SchemaDefinition, SchemaRegistry};
pub use stage::{validated, FnTransform, StageContext, Transform, ValidatedStage};
pub use store::Store;
pub use tracking::{fingerprint_table, FailedWindow, PartialRun, RunTracker};
pub use views::{builtin_views, SqlView, ViewRegistry};
pub use windowing::{DateRange, WindowPlanner, WindowPolicy, WindowUnit, Windows};
