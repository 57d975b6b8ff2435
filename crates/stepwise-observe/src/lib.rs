//! Observability setup for Stepwise: structured logging plus optional
//! OpenTelemetry span export.

pub mod tracing_setup;
