//! Orchestration logic and port definitions for Stepwise.
//!
//! This crate defines the "ports" (agent, message bus and checkpoint store
//! traits) that the infrastructure layer implements, plus the engine that
//! drives workflows over them. It depends only on `stepwise-types` -- never on
//! `stepwise-infra` or any database/IO crate.

pub mod agent;
pub mod bus;
pub mod circuit;
pub mod workflow;
