//! Upstream-to-client dispatch.
//!
//! Consumes the bus event stream, encodes each message once and hands the
//! frame to every session subscribed to its channel at that moment.

use fanout_protocol::{encode, ServerFrame};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

use crate::bus::{BusEvent, BusEvents};
use crate::channel::ChannelId;
use crate::message::Message;
use crate::registry::Registry;
use crate::session::DeliveryOutcome;

/// What one message dispatch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Channel the message was published on.
    pub channel: ChannelId,
    /// Subscribers found for the channel.
    pub recipients: usize,
    /// Sessions the frame was queued to.
    pub delivered: usize,
    /// Sessions disconnected because their queue was full.
    pub overflowed: usize,
    /// Encoded frame size in bytes.
    pub bytes: usize,
    /// Time from reading the message off the bus to queueing it everywhere.
    pub latency: Duration,
}

/// Fans bus messages out to subscribed sessions.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    /// Create a dispatcher delivering through `registry`.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Deliver one message to the channel's current subscribers.
    ///
    /// Never waits on a client: a session whose queue is full is closed
    /// instead.
    pub fn dispatch(&self, message: &Message) -> FanOut {
        let recipients = self.registry.subscribers_of(&message.channel);
        let mut fan_out = FanOut {
            channel: message.channel.clone(),
            recipients: recipients.len(),
            ..FanOut::default()
        };
        if recipients.is_empty() {
            trace!(channel = %message.channel, "No subscribers, dropping message");
            return fan_out;
        }

        let frame: Arc<str> = match encode(&ServerFrame::delivery(
            message.channel.as_str(),
            &message.payload,
        )) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                error!(channel = %message.channel, error = %e, "Failed to encode delivery");
                return fan_out;
            }
        };
        fan_out.bytes = frame.len();

        for outbound in &recipients {
            match outbound.deliver(Arc::clone(&frame)) {
                DeliveryOutcome::Queued => fan_out.delivered += 1,
                DeliveryOutcome::Overflow => fan_out.overflowed += 1,
                DeliveryOutcome::Closed => {}
            }
        }
        fan_out.latency = message.age();

        debug!(
            channel = %message.channel,
            message_id = message.id,
            delivered = fan_out.delivered,
            overflowed = fan_out.overflowed,
            "Dispatched"
        );
        fan_out
    }

    /// Run until the event stream ends.
    pub async fn run(self, events: BusEvents) {
        self.run_with(events, |_| {}).await;
    }

    /// Run until the event stream ends, reporting every dispatch to `observe`.
    pub async fn run_with<F>(self, mut events: BusEvents, mut observe: F)
    where
        F: FnMut(&FanOut) + Send,
    {
        info!("Dispatcher started");
        while let Some(event) = events.recv().await {
            match event {
                BusEvent::Message(message) => {
                    let fan_out = self.dispatch(&message);
                    observe(&fan_out);
                }
                BusEvent::Reconnected => {
                    // Resubscribing waits on the bus, which may be waiting
                    // on us to drain events
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        let report = registry.resubscribe_all().await;
                        if !report.failed.is_empty() {
                            error!(channels = ?report.failed, "Channels not resubscribed after reconnect");
                        }
                    });
                }
            }
        }
        info!("Bus event stream ended, dispatcher stopped");
    }
}
