//! Messages received from the upstream bus.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::channel::ChannelId;

/// A unique message identifier.
pub type MessageId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A message published upstream on a channel.
#[derive(Debug, Clone)]
pub struct Message {
    /// Local identifier, for tracing only.
    pub id: MessageId,
    /// Channel the message was published on.
    pub channel: ChannelId,
    /// The payload exactly as published.
    pub payload: Bytes,
    /// When the gateway read it off the bus.
    pub received_at: Instant,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(channel: impl Into<ChannelId>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            channel: channel.into(),
            payload: payload.into(),
            received_at: Instant::now(),
        }
    }

    /// Time since the message was received.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}
