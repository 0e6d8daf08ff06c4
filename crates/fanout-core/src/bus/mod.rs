//! Upstream bus adapters.
//!
//! The gateway holds a single subscriber connection to an external pub/sub
//! service. [`UpstreamBus`] is the seam the registry and dispatch loop talk
//! through; [`MemoryBus`] and [`RedisBus`] implement it.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use bytes::Bytes;
use fanout_protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::Message;

pub use memory::MemoryBus;
pub use redis::{RedisBus, RedisConfig};

/// Upstream bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus connection is down (possibly reconnecting).
    #[error("Upstream bus disconnected")]
    Disconnected,

    /// The bus did not answer in time.
    #[error("Upstream bus timed out after {0:?}")]
    Timeout(Duration),

    /// The bus answered with an error.
    #[error("Upstream bus rejected command: {0}")]
    Rejected(String),

    /// I/O error on the bus connection.
    #[error("Upstream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bus sent something we could not parse.
    #[error("Upstream protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// `events()` was already called.
    #[error("Upstream event stream already taken")]
    EventsTaken,

    /// The adapter has shut down.
    #[error("Upstream bus adapter closed")]
    Closed,
}

impl BusError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Disconnected | BusError::Timeout(_) | BusError::Io(_)
        )
    }

    /// Whether the command may have reached the bus and taken effect even
    /// though the call failed.
    #[must_use]
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            BusError::Disconnected | BusError::Timeout(_) | BusError::Io(_) | BusError::Protocol(_)
        )
    }
}

/// An event from the upstream bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A message published on a channel we are subscribed to.
    Message(Message),
    /// The adapter established a fresh connection; all upstream
    /// subscriptions were lost and must be re-issued.
    Reconnected,
}

/// The single incoming event stream of a bus adapter.
pub type BusEvents = mpsc::Receiver<BusEvent>;

/// An upstream publish/subscribe service.
///
/// `subscribe` and `unsubscribe` are idempotent: subscribing twice never
/// duplicates delivery and unsubscribing an unknown channel is a no-op.
#[async_trait]
pub trait UpstreamBus: Send + Sync {
    /// Start receiving messages published on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<(), BusError>;

    /// Stop receiving messages published on `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;

    /// Publish `payload` on `channel`, returning the receiver count the bus reports.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError>;

    /// Take the event stream. It can be taken once; later calls fail with
    /// [`BusError::EventsTaken`].
    fn events(&self) -> Result<BusEvents, BusError>;

    /// Adapter name for logs.
    fn name(&self) -> &'static str;
}

/// Take a receiver out of a once-only slot.
pub(crate) fn take_events(
    slot: &std::sync::Mutex<Option<BusEvents>>,
) -> Result<BusEvents, BusError> {
    slot.lock()
        .map_err(|_| BusError::Closed)?
        .take()
        .ok_or(BusError::EventsTaken)
}
