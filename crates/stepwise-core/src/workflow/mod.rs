//! Workflow engine core: durable checkpointing and sequential execution.
//!
//! - `checkpoint` -- `CheckpointStore` port and the in-memory store
//! - `engine` -- `WorkflowEngine`: execute, resume, rollback, history, health

pub mod checkpoint;
pub mod engine;

pub use checkpoint::{CheckpointError, CheckpointStore, InMemoryCheckpointStore};
pub use engine::{EngineError, HealthReport, WorkflowEngine, WorkflowOutcome};
