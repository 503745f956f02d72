//! Freight automation: turns synced Gmail messages into freight operations.

pub mod automation;
pub mod config;
pub mod error;
pub mod store;
