//! Client sessions.
//!
//! A [`Session`] owns one client connection for its whole life: it turns
//! control frames into registry calls, writes queued deliveries out, and
//! removes the connection from the registry exactly once when it ends.
//!
//! Deliveries reach a session through its [`Outbound`] handle, a bounded
//! queue. A client too slow to drain that queue is disconnected rather than
//! allowed to hold memory or stall dispatch for everyone else.
//!
//! Registry calls can wait on the upstream bus, so a control frame runs as
//! an in-flight operation next to the queue instead of blocking it. At most
//! one is in flight; the next inbound frame is read once it finishes.

use fanout_protocol::codec::MAX_FRAME_SIZE;
use fanout_protocol::{ControlFrame, FrameCodec, ServerFrame};
use fanout_transport::{Connection, ConnectionId};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::registry::Registry;

/// Default capacity of a session's outbound queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Result of handing a frame to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The frame is queued for writing.
    Queued,
    /// The queue was full; the session has been told to close.
    Overflow,
    /// The session is gone or closing.
    Closed,
}

/// Sending half of a session: what the registry stores per subscription.
#[derive(Debug, Clone)]
pub struct Outbound {
    id: ConnectionId,
    queue: mpsc::Sender<Arc<str>>,
    close: Arc<watch::Sender<bool>>,
}

/// Receiving half of an [`Outbound`].
#[derive(Debug)]
pub struct OutboundReceiver {
    queue: mpsc::Receiver<Arc<str>>,
    closed: watch::Receiver<bool>,
}

impl Outbound {
    /// Create a handle with a queue of `capacity` frames and its receiver.
    #[must_use]
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, OutboundReceiver) {
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(false);
        let outbound = Self {
            id,
            queue: queue_tx,
            close: Arc::new(close_tx),
        };
        let receiver = OutboundReceiver {
            queue: queue_rx,
            closed: close_rx,
        };
        (outbound, receiver)
    }

    /// The connection this handle writes to.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue an encoded frame without waiting.
    pub fn deliver(&self, frame: Arc<str>) -> DeliveryOutcome {
        if self.is_closed() {
            return DeliveryOutcome::Closed;
        }
        match self.queue.try_send(frame) {
            Ok(()) => DeliveryOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = %self.id, "Outbound queue full, disconnecting slow client");
                self.close();
                DeliveryOutcome::Overflow
            }
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Closed,
        }
    }

    /// Ask the session to close.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    /// Whether the session was asked to close or has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.close.borrow() || self.queue.is_closed()
    }
}

impl OutboundReceiver {
    /// Wait for the next queued frame.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.queue.recv().await
    }

    /// Take a frame if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.queue.try_recv().ok()
    }

    /// Whether [`Outbound::close`] was called.
    #[must_use]
    pub fn is_close_requested(&self) -> bool {
        *self.closed.borrow()
    }
}

async fn close_requested(closed: &mut watch::Receiver<bool>) {
    if closed.wait_for(|requested| *requested).await.is_err() {
        // Every handle is gone; nobody can ask us to close any more
        std::future::pending::<()>().await;
    }
}

/// A registry call started by a control frame. Resolves to the reason to
/// report back to the client, if any.
type ControlOp = BoxFuture<'static, Option<String>>;

async fn in_flight(op: &mut Option<ControlOp>) -> Option<String> {
    match op {
        Some(op) => op.await,
        None => std::future::pending().await,
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frames that may wait for the client before it is disconnected.
    pub outbound_buffer: usize,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet registered.
    Connecting,
    /// Registered and serving frames.
    Open,
    /// Releasing subscriptions.
    Closing,
    /// Done.
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection.
    ClientClosed,
    /// Reading from the client failed.
    TransportError,
    /// Writing to the client failed.
    WriteFailed,
    /// The gateway closed it (slow client or shutdown).
    Forced,
}

/// What a finished session did.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Frames received from the client.
    pub frames_in: u64,
    /// Frames written to the client.
    pub frames_out: u64,
    /// Inbound frames answered with an error.
    pub rejected: u64,
    /// Why the session ended.
    pub reason: CloseReason,
}

/// A client session.
pub struct Session {
    id: ConnectionId,
    registry: Arc<Registry>,
    outbound: Outbound,
    queue: mpsc::Receiver<Arc<str>>,
    closed: watch::Receiver<bool>,
    codec: FrameCodec,
    state: SessionState,
    cleaned: bool,
    frames_in: u64,
    frames_out: u64,
    rejected: u64,
}

impl Session {
    /// Create a session for connection `id`.
    #[must_use]
    pub fn new(id: ConnectionId, registry: Arc<Registry>, config: SessionConfig) -> Self {
        let (outbound, receiver) = Outbound::channel(id.clone(), config.outbound_buffer);
        Self {
            id,
            registry,
            outbound,
            queue: receiver.queue,
            closed: receiver.closed,
            codec: FrameCodec::with_max_frame_size(config.max_message_size),
            state: SessionState::Connecting,
            cleaned: false,
            frames_in: 0,
            frames_out: 0,
            rejected: 0,
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle used to deliver frames to this session.
    #[must_use]
    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Serve `conn` until either side closes it.
    pub async fn run<C: Connection>(mut self, mut conn: C) -> SessionSummary {
        self.registry.register(self.outbound.clone());
        self.state = SessionState::Open;
        debug!(connection = %self.id, remote = ?conn.remote_addr(), "Session opened");

        let mut control: Option<ControlOp> = None;

        let reason = loop {
            tokio::select! {
                biased;

                _ = close_requested(&mut self.closed) => {
                    debug!(connection = %self.id, "Close requested");
                    break CloseReason::Forced;
                }

                frame = self.queue.recv() => {
                    let Some(frame) = frame else {
                        break CloseReason::Forced;
                    };
                    // A client that stops reading must not pin us in send
                    let sent = tokio::select! {
                        biased;
                        _ = close_requested(&mut self.closed) => break CloseReason::Forced,
                        sent = conn.send(frame.to_string()) => sent,
                    };
                    if let Err(e) = sent {
                        debug!(connection = %self.id, error = %e, "Write failed");
                        break CloseReason::WriteFailed;
                    }
                    self.frames_out += 1;
                }

                refused = in_flight(&mut control), if control.is_some() => {
                    control = None;
                    let reply = refused.and_then(|reason| self.reject(reason));
                    if let Some(reply) = reply {
                        if let Err(e) = conn.send(reply).await {
                            debug!(connection = %self.id, error = %e, "Write failed");
                            break CloseReason::WriteFailed;
                        }
                        self.frames_out += 1;
                    }
                }

                inbound = conn.recv(), if control.is_none() => {
                    match inbound {
                        Ok(Some(data)) => {
                            self.frames_in += 1;
                            match self.start_control(&data) {
                                Ok(op) => control = Some(op),
                                Err(reason) => {
                                    if let Some(reply) = self.reject(reason) {
                                        if let Err(e) = conn.send(reply).await {
                                            debug!(connection = %self.id, error = %e, "Write failed");
                                            break CloseReason::WriteFailed;
                                        }
                                        self.frames_out += 1;
                                    }
                                }
                            }
                        }
                        Ok(None) => break CloseReason::ClientClosed,
                        Err(e) => {
                            warn!(connection = %self.id, error = %e, "Transport error");
                            break CloseReason::TransportError;
                        }
                    }
                }
            }
        };

        // Let a started registry call settle before releasing everything
        if let Some(op) = control.take() {
            op.await;
        }

        self.state = SessionState::Closing;
        self.cleanup().await;
        if let Err(e) = conn.close().await {
            debug!(connection = %self.id, error = %e, "Close failed");
        }
        self.state = SessionState::Closed;

        info!(
            connection = %self.id,
            reason = ?reason,
            frames_in = self.frames_in,
            frames_out = self.frames_out,
            "Session closed"
        );

        SessionSummary {
            id: self.id.clone(),
            frames_in: self.frames_in,
            frames_out: self.frames_out,
            rejected: self.rejected,
            reason,
        }
    }

    /// Decode one inbound frame into a registry call, or the reason it was
    /// rejected.
    fn start_control(&mut self, data: &[u8]) -> Result<ControlOp, String> {
        let frame = self.codec.decode(data).map_err(|e| {
            warn!(connection = %self.id, error = %e, "Rejected inbound frame");
            e.to_string()
        })?;

        let registry = Arc::clone(&self.registry);
        let id = self.id.clone();
        Ok(Box::pin(async move {
            match frame {
                ControlFrame::Subscribe { channel } => {
                    debug!(connection = %id, channel = %channel, "Subscribe request");
                    match registry.add_subscription(&id, &channel).await {
                        Ok(()) => None,
                        Err(e) if e.is_client_error() => {
                            debug!(connection = %id, channel = %channel, error = %e, "Subscribe refused");
                            Some(e.to_string())
                        }
                        Err(e) => {
                            error!(connection = %id, channel = %channel, error = %e, "Subscribe failed");
                            None
                        }
                    }
                }
                ControlFrame::Unsubscribe { channel } => {
                    debug!(connection = %id, channel = %channel, "Unsubscribe request");
                    if let Err(e) = registry.remove_subscription(&id, &channel).await {
                        error!(connection = %id, channel = %channel, error = %e, "Unsubscribe failed");
                    }
                    None
                }
            }
        }))
    }

    fn reject(&mut self, reason: String) -> Option<String> {
        self.rejected += 1;
        match self.codec.encode(&ServerFrame::error(reason)) {
            Ok(text) => Some(text),
            Err(e) => {
                error!(connection = %self.id, error = %e, "Failed to encode error frame");
                None
            }
        }
    }

    async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        self.outbound.close();

        match self.registry.remove_connection(&self.id).await {
            Ok(removed) => debug!(connection = %self.id, removed, "Released subscriptions"),
            Err(e) => error!(connection = %self.id, error = %e, "Failed to release subscriptions"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        self.outbound.close();

        let registry = Arc::clone(&self.registry);
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = registry.remove_connection(&id).await {
                        error!(connection = %id, error = %e, "Failed to release subscriptions");
                    }
                });
            }
            Err(_) => {
                warn!(connection = %self.id, "Session dropped outside a runtime, subscriptions not released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, BusEvents, MemoryBus, UpstreamBus};
    use crate::registry::RegistryConfig;
    use async_trait::async_trait;
    use bytes::Bytes;
    use fanout_transport::memory::{pair, MemoryClient};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    /// Bus whose subscribe to one channel takes a while.
    struct SlowBus {
        inner: MemoryBus,
        slow: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl UpstreamBus for SlowBus {
        async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
            if channel == self.slow {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.subscribe(channel).await
        }

        async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
            self.inner.unsubscribe(channel).await
        }

        async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
            self.inner.publish(channel, payload).await
        }

        fn events(&self) -> Result<BusEvents, BusError> {
            self.inner.events()
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn setup() -> (Arc<MemoryBus>, Arc<Registry>) {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(Registry::new(bus.clone()));
        (bus, registry)
    }

    fn open(
        registry: &Arc<Registry>,
        config: SessionConfig,
    ) -> (ConnectionId, MemoryClient, JoinHandle<SessionSummary>) {
        let (conn, client) = pair();
        let id = conn.id().clone();
        let session = Session::new(id.clone(), registry.clone(), config);
        assert_eq!(session.state(), SessionState::Connecting);
        let handle = tokio::spawn(session.run(conn));
        (id, client, handle)
    }

    #[test]
    fn test_outbound_overflow_requests_close() {
        let (outbound, mut rx) = Outbound::channel(ConnectionId::new("c"), 2);

        assert_eq!(outbound.deliver(Arc::from("1")), DeliveryOutcome::Queued);
        assert_eq!(outbound.deliver(Arc::from("2")), DeliveryOutcome::Queued);
        assert_eq!(outbound.deliver(Arc::from("3")), DeliveryOutcome::Overflow);

        assert!(outbound.is_closed());
        assert!(rx.is_close_requested());
        assert_eq!(outbound.deliver(Arc::from("4")), DeliveryOutcome::Closed);

        assert_eq!(rx.try_recv().as_deref(), Some("1"));
        assert_eq!(rx.try_recv().as_deref(), Some("2"));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_outbound_to_dropped_receiver_is_closed() {
        let (outbound, rx) = Outbound::channel(ConnectionId::new("c"), 2);
        drop(rx);
        assert_eq!(outbound.deliver(Arc::from("x")), DeliveryOutcome::Closed);
    }

    #[tokio::test]
    async fn test_subscribe_deliver_and_client_close() {
        let (bus, registry) = setup();
        let (id, mut client, handle) = open(&registry, SessionConfig::default());

        client
            .send_text(r#"{"action":"subscribe","channel":"metrics:dashboard"}"#)
            .unwrap();
        eventually(|| registry.subscriber_count("metrics:dashboard") == 1).await;
        assert!(bus.is_subscribed("metrics:dashboard"));

        for outbound in registry.subscribers_of("metrics:dashboard") {
            assert_eq!(outbound.id(), &id);
            outbound.deliver(Arc::from(r#"{"channel":"metrics:dashboard","message":"hi"}"#));
        }
        assert_eq!(
            client.recv().await.unwrap(),
            r#"{"channel":"metrics:dashboard","message":"hi"}"#
        );

        client.close();
        let summary = handle.await.unwrap();
        assert_eq!(summary.reason, CloseReason::ClientClosed);
        assert_eq!(summary.frames_in, 1);
        assert_eq!(summary.frames_out, 1);

        assert_eq!(registry.connection_count(), 0);
        assert!(!bus.is_subscribed("metrics:dashboard"));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_and_session_stays_open() {
        let (_bus, registry) = setup();
        let (_id, mut client, handle) = open(&registry, SessionConfig::default());

        client.send_text("not json").unwrap();
        let reply: serde_json::Value = serde_json::from_str(&client.recv().await.unwrap()).unwrap();
        assert!(reply["error"].is_string());

        client.send_text(r#"{"action":"publish","channel":"x"}"#).unwrap();
        assert!(client.recv().await.unwrap().contains("error"));

        client.send_text(r#"{"action":"subscribe","channel":""}"#).unwrap();
        assert!(client.recv().await.unwrap().contains("error"));

        // Still serving
        client.send_text(r#"{"action":"subscribe","channel":"x"}"#).unwrap();
        eventually(|| registry.subscriber_count("x") == 1).await;

        client.close();
        let summary = handle.await.unwrap();
        assert_eq!(summary.rejected, 3);
        assert_eq!(summary.frames_in, 4);
    }

    #[tokio::test]
    async fn test_invalid_channel_and_limit_are_reported() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(Registry::with_config(
            bus,
            RegistryConfig {
                max_subscriptions_per_connection: 1,
                ..Default::default()
            },
        ));
        let (_id, mut client, handle) = open(&registry, SessionConfig::default());

        client.send_text(r#"{"action":"subscribe","channel":"$sys"}"#).unwrap();
        assert!(client.recv().await.unwrap().contains("reserved"));

        client.send_text(r#"{"action":"subscribe","channel":"a"}"#).unwrap();
        client.send_text(r#"{"action":"subscribe","channel":"b"}"#).unwrap();
        assert!(client.recv().await.unwrap().contains("Maximum subscriptions"));
        assert_eq!(registry.subscriber_count("a"), 1);

        client.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_is_silent() {
        let (bus, registry) = setup();
        let (_id, mut client, handle) = open(&registry, SessionConfig::default());

        client.send_text(r#"{"action":"unsubscribe","channel":"never"}"#).unwrap();
        client.send_text(r#"{"action":"subscribe","channel":"x"}"#).unwrap();
        eventually(|| bus.is_subscribed("x")).await;
        client.send_text(r#"{"action":"unsubscribe","channel":"x"}"#).unwrap();
        eventually(|| !bus.is_subscribed("x")).await;

        assert!(client.try_recv().is_none());
        client.close();
        assert_eq!(handle.await.unwrap().rejected, 0);
    }

    #[tokio::test]
    async fn test_slow_client_is_disconnected() {
        let (bus, registry) = setup();
        let (conn, mut client) = fanout_transport::memory::pair_with_capacity(1);
        let id = conn.id().clone();
        let config = SessionConfig {
            outbound_buffer: 2,
            ..Default::default()
        };
        let handle = tokio::spawn(Session::new(id, registry.clone(), config).run(conn));

        client.send_text(r#"{"action":"subscribe","channel":"x"}"#).unwrap();
        eventually(|| registry.subscriber_count("x") == 1).await;

        // Client never reads: the transport fills, then the queue
        let mut overflowed = false;
        for i in 0..16 {
            let outcomes: Vec<_> = registry
                .subscribers_of("x")
                .iter()
                .map(|o| o.deliver(Arc::from(format!("frame {}", i))))
                .collect();
            if outcomes.contains(&DeliveryOutcome::Overflow) {
                overflowed = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(overflowed);

        let summary = handle.await.unwrap();
        assert_eq!(summary.reason, CloseReason::Forced);
        assert_eq!(registry.connection_count(), 0);
        assert!(!bus.is_subscribed("x"));
        assert!(client.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_slow_subscribe_keeps_deliveries_flowing() {
        let bus = Arc::new(SlowBus {
            inner: MemoryBus::new(),
            slow: "slow",
            delay: Duration::from_millis(500),
        });
        let registry = Arc::new(Registry::new(bus.clone()));
        let config = SessionConfig {
            outbound_buffer: 8,
            ..Default::default()
        };
        let (_id, mut client, handle) = open(&registry, config);

        client.send_text(r#"{"action":"subscribe","channel":"busy"}"#).unwrap();
        eventually(|| registry.subscriber_count("busy") == 1).await;

        client.send_text(r#"{"action":"subscribe","channel":"slow"}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Twice the queue size while the upstream subscribe is pending
        for i in 0..16 {
            let frame = format!(r#"{{"channel":"busy","message":"{}"}}"#, i);
            for outbound in registry.subscribers_of("busy") {
                assert_eq!(outbound.deliver(Arc::from(frame.as_str())), DeliveryOutcome::Queued);
            }
            let received = tokio::time::timeout(Duration::from_millis(200), client.recv())
                .await
                .unwrap();
            assert_eq!(received.as_deref(), Some(frame.as_str()));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.subscriber_count("slow"), 0);

        eventually(|| registry.subscriber_count("slow") == 1).await;
        assert!(bus.inner.is_subscribed("slow"));

        client.close();
        let summary = handle.await.unwrap();
        assert_eq!(summary.reason, CloseReason::ClientClosed);
        assert_eq!(summary.frames_out, 16);
    }

    #[tokio::test]
    async fn test_control_frames_apply_in_order() {
        let bus = Arc::new(SlowBus {
            inner: MemoryBus::new(),
            slow: "x",
            delay: Duration::from_millis(50),
        });
        let registry = Arc::new(Registry::new(bus.clone()));
        let (_id, mut client, handle) = open(&registry, SessionConfig::default());

        client.send_text(r#"{"action":"subscribe","channel":"x"}"#).unwrap();
        client.send_text(r#"{"action":"unsubscribe","channel":"x"}"#).unwrap();
        client.send_text(r#"{"action":"subscribe","channel":"$bad"}"#).unwrap();

        // The error reply comes only after both earlier frames were applied
        let reply = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.contains("error"));
        assert_eq!(registry.subscriber_count("x"), 0);
        assert!(!bus.inner.is_subscribed("x"));

        client.close();
        assert_eq!(handle.await.unwrap().rejected, 1);
    }

    #[tokio::test]
    async fn test_close_all_forces_sessions_closed() {
        let (_bus, registry) = setup();
        let (_a, _client_a, handle_a) = open(&registry, SessionConfig::default());
        let (_b, _client_b, handle_b) = open(&registry, SessionConfig::default());
        eventually(|| registry.connection_count() == 2).await;

        registry.close_all();

        assert_eq!(handle_a.await.unwrap().reason, CloseReason::Forced);
        assert_eq!(handle_b.await.unwrap().reason, CloseReason::Forced);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_aborted_session_still_releases_subscriptions() {
        let (bus, registry) = setup();
        let (_id, client, handle) = open(&registry, SessionConfig::default());

        client.send_text(r#"{"action":"subscribe","channel":"x"}"#).unwrap();
        eventually(|| bus.is_subscribed("x")).await;

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        eventually(|| registry.connection_count() == 0).await;
        eventually(|| !bus.is_subscribed("x")).await;
    }
}
