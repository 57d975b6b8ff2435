//! Shared domain types for Stepwise.
//!
//! Workflow definitions and execution state, checkpoints, bus envelopes,
//! circuit breaker stats, runtime configuration, and their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod checkpoint;
pub mod circuit;
pub mod config;
pub mod error;
pub mod message;
pub mod workflow;
