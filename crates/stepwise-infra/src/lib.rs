//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the ports defined in `stepwise-core`: the
//! SQLite checkpoint store, the broker-backed message bus and HTTP/echo
//! agents, plus config loading and the `build_runtime` composition root.

pub mod agent;
pub mod bus;
pub mod config;
pub mod runtime;
pub mod sqlite;
