//! Per-agent failure isolation.

pub mod breaker;

pub use breaker::{CircuitBreaker, CircuitError};
