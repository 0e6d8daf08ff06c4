//! # fanout-server
//!
//! The Fanout gateway: a WebSocket front door over the subscription
//! registry, backed by Redis pub/sub (or the in-memory bus for development).

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
