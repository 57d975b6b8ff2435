//! Network-backed `MessageBus` adapters.

pub mod broker;

pub use broker::BrokerMessageBus;
