//! In-process bus.
//!
//! Behaves like a single-node broker: publishing on a channel the adapter is
//! subscribed to yields an event, anything else is dropped.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{take_events, BusError, BusEvent, BusEvents, UpstreamBus};
use crate::channel::ChannelId;
use crate::message::Message;

/// Default event buffer capacity.
const DEFAULT_EVENT_BUFFER: usize = 1024;

/// An in-memory [`UpstreamBus`].
pub struct MemoryBus {
    subscribed: DashSet<ChannelId>,
    events_tx: mpsc::Sender<BusEvent>,
    events_rx: Mutex<Option<BusEvents>>,
}

impl MemoryBus {
    /// Create a new bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_BUFFER)
    }

    /// Create a new bus buffering up to `capacity` undelivered events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        Self {
            subscribed: DashSet::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Whether the adapter currently holds a subscription to `channel`.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscribed.contains(channel)
    }

    /// Channels the adapter is subscribed to, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<ChannelId> {
        let mut channels: Vec<_> = self.subscribed.iter().map(|c| c.clone()).collect();
        channels.sort();
        channels
    }

    /// Behave as if the connection dropped and came back: every
    /// subscription is forgotten and [`BusEvent::Reconnected`] is emitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the event stream was dropped.
    pub async fn simulate_reconnect(&self) -> Result<(), BusError> {
        self.subscribed.clear();
        info!("Memory bus reconnected");
        self.events_tx
            .send(BusEvent::Reconnected)
            .await
            .map_err(|_| BusError::Closed)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamBus for MemoryBus {
    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        if self.subscribed.insert(channel.to_string()) {
            debug!(channel = %channel, "Memory bus subscribed");
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        if self.subscribed.remove(channel).is_some() {
            debug!(channel = %channel, "Memory bus unsubscribed");
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        if !self.subscribed.contains(channel) {
            return Ok(0);
        }
        self.events_tx
            .send(BusEvent::Message(Message::new(channel, payload)))
            .await
            .map_err(|_| BusError::Closed)?;
        Ok(1)
    }

    fn events(&self) -> Result<BusEvents, BusError> {
        take_events(&self.events_rx)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_only_reaches_subscribed_channels() {
        let bus = MemoryBus::new();
        let mut events = bus.events().unwrap();

        assert_eq!(bus.publish("a", Bytes::from_static(b"dropped")).await.unwrap(), 0);

        bus.subscribe("a").await.unwrap();
        assert_eq!(bus.publish("a", Bytes::from_static(b"kept")).await.unwrap(), 1);

        match events.recv().await {
            Some(BusEvent::Message(msg)) => {
                assert_eq!(msg.channel, "a");
                assert_eq!(&msg.payload[..], b"kept");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_are_idempotent() {
        let bus = MemoryBus::new();
        let mut events = bus.events().unwrap();

        bus.subscribe("a").await.unwrap();
        bus.subscribe("a").await.unwrap();
        bus.publish("a", Bytes::from_static(b"once")).await.unwrap();
        assert!(events.recv().await.is_some());
        assert!(events.try_recv().is_err());

        bus.unsubscribe("a").await.unwrap();
        bus.unsubscribe("a").await.unwrap();
        bus.unsubscribe("never").await.unwrap();
        assert!(bus.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_events_can_only_be_taken_once() {
        let bus = MemoryBus::new();
        assert!(bus.events().is_ok());
        assert!(matches!(bus.events(), Err(BusError::EventsTaken)));
    }

    #[tokio::test]
    async fn test_simulated_reconnect_forgets_subscriptions() {
        let bus = MemoryBus::new();
        let mut events = bus.events().unwrap();
        bus.subscribe("a").await.unwrap();

        bus.simulate_reconnect().await.unwrap();

        assert!(!bus.is_subscribed("a"));
        assert!(matches!(events.recv().await, Some(BusEvent::Reconnected)));
    }
}
