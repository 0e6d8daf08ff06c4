//! Subscription registry.
//!
//! Maps connections to the channels they want and channels to the
//! connections that want them, and decides when the gateway itself must
//! subscribe to or unsubscribe from the upstream bus.
//!
//! ## Locking
//!
//! Each channel has a slot with two locks:
//!
//! - an async *gate* serializing reference-count transitions of that channel.
//!   It is held across the upstream call that a 0→1 or 1→0 transition
//!   triggers, so a transition commits only once the bus confirmed it.
//!   Other channels have their own gates and never wait on it.
//! - a short read/write lock over the member map, which dispatch reads to
//!   copy out recipients. It is never held across an await.
//!
//! A connection becomes visible to dispatch only after the upstream
//! subscription is confirmed. A slot is removed from the map (and marked
//! retired, so late waiters retry) when its last member leaves and the
//! upstream unsubscribe succeeded.
//!
//! A bus call that timed out or lost its connection may still have taken
//! effect. Such slots are treated as possibly subscribed upstream and kept
//! until an unsubscribe succeeds, either right away or in [`Registry::reconcile`].

use dashmap::DashMap;
use fanout_transport::ConnectionId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, UpstreamBus};
use crate::channel::{validate_channel_name, ChannelId, ChannelInfo, ConnectionInfo};
use crate::retry::RetryPolicy;
use crate::session::Outbound;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// The connection is not registered (or already removed).
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Maximum subscriptions per connection reached.
    #[error("Maximum subscriptions reached ({0})")]
    MaxSubscriptionsReached(usize),

    /// The upstream bus call behind a transition failed; the request did not
    /// take effect.
    #[error("Upstream {op} failed for channel {channel}: {source}")]
    Bus {
        /// `subscribe` or `unsubscribe`.
        op: &'static str,
        /// Channel whose transition failed.
        channel: ChannelId,
        /// Underlying bus error.
        #[source]
        source: BusError,
    },

    /// Connection removal finished but these channels are still subscribed
    /// upstream with no local subscribers.
    #[error("Upstream subscriptions leaked for channels: {0:?}")]
    UpstreamLeak(Vec<ChannelId>),
}

impl RegistryError {
    /// Whether the error was caused by the client's request rather than by
    /// the gateway or the bus.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RegistryError::InvalidChannel(_) | RegistryError::MaxSubscriptionsReached(_)
        )
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Retry policy for upstream subscribe/unsubscribe calls.
    pub retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of active channels.
    pub channel_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

/// Outcome of a reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Channels (re)subscribed upstream.
    pub subscribed: Vec<ChannelId>,
    /// Stale upstream subscriptions released.
    pub released: Vec<ChannelId>,
    /// Channels whose upstream state could not be fixed.
    pub failed: Vec<ChannelId>,
}

struct SlotState {
    retired: bool,
}

struct ChannelSlot {
    name: ChannelId,
    gate: Arc<Mutex<SlotState>>,
    members: RwLock<HashMap<ConnectionId, Outbound>>,
    upstream: AtomicBool,
}

impl ChannelSlot {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            gate: Arc::new(Mutex::new(SlotState { retired: false })),
            members: RwLock::new(HashMap::new()),
            upstream: AtomicBool::new(false),
        }
    }

    fn members(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Outbound>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn members_mut(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Outbound>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn member_count(&self) -> usize {
        self.members().len()
    }

    fn is_upstream(&self) -> bool {
        self.upstream.load(Ordering::SeqCst)
    }

    fn set_upstream(&self, active: bool) {
        self.upstream.store(active, Ordering::SeqCst);
    }
}

struct ConnectionEntry {
    outbound: Outbound,
    channels: HashSet<ChannelId>,
}

type Gate = OwnedMutexGuard<SlotState>;

/// The subscription registry.
pub struct Registry {
    bus: Arc<dyn UpstreamBus>,
    slots: DashMap<ChannelId, Arc<ChannelSlot>>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    config: RegistryConfig,
}

impl Registry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new(bus: Arc<dyn UpstreamBus>) -> Self {
        Self::with_config(bus, RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(bus: Arc<dyn UpstreamBus>, config: RegistryConfig) -> Self {
        info!(bus = bus.name(), "Creating registry with config: {:?}", config);
        Self {
            bus,
            slots: DashMap::new(),
            connections: DashMap::new(),
            config,
        }
    }

    /// The upstream bus this registry drives.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn UpstreamBus> {
        &self.bus
    }

    /// Make a connection known. Re-registering an ID replaces its handle and
    /// keeps its subscriptions.
    pub fn register(&self, outbound: Outbound) {
        let id = outbound.id().clone();
        self.connections
            .entry(id.clone())
            .and_modify(|entry| entry.outbound = outbound.clone())
            .or_insert_with(|| ConnectionEntry {
                outbound,
                channels: HashSet::new(),
            });
        debug!(connection = %id, "Registered connection");
    }

    /// Subscribe a connection to a channel.
    ///
    /// On the channel's first subscriber the upstream subscription is made
    /// (with retries) before the connection can receive anything. Adding a
    /// subscription the connection already holds is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, limits are exceeded, the
    /// connection is unknown, or the upstream subscribe failed. In every
    /// error case the registry is left as it was.
    pub async fn add_subscription(
        &self,
        connection: &ConnectionId,
        channel: &str,
    ) -> Result<(), RegistryError> {
        validate_channel_name(channel).map_err(RegistryError::InvalidChannel)?;
        self.check_can_add(connection, channel)?;

        let (slot, mut gate) = self.acquire(channel).await;

        let outbound = match self.connections.get(connection) {
            Some(entry) if entry.channels.contains(channel) => return Ok(()),
            Some(entry) => entry.outbound.clone(),
            None => {
                self.discard_if_unused(&slot, &mut gate);
                return Err(RegistryError::UnknownConnection(connection.clone()));
            }
        };

        let first = slot.member_count() == 0;
        if first && !slot.is_upstream() {
            let subscribed = self
                .config
                .retry
                .run("subscribe", channel, || self.bus.subscribe(channel))
                .await;
            if let Err(source) = subscribed {
                warn!(channel = %channel, error = %source, "Upstream subscribe failed");
                if source.outcome_unknown() {
                    // The bus may hold the subscription anyway
                    slot.set_upstream(true);
                    self.release_if_unused(&slot, &mut gate).await;
                } else {
                    self.discard_if_unused(&slot, &mut gate);
                }
                return Err(RegistryError::Bus {
                    op: "subscribe",
                    channel: channel.to_string(),
                    source,
                });
            }
            slot.set_upstream(true);
            info!(channel = %channel, "Upstream subscribed");
        }

        // Commit: connection view first, then dispatch becomes aware of it
        let committed = match self.connections.get_mut(connection) {
            Some(mut entry) => {
                if entry.channels.len() >= self.config.max_subscriptions_per_connection {
                    Err(RegistryError::MaxSubscriptionsReached(
                        self.config.max_subscriptions_per_connection,
                    ))
                } else {
                    entry.channels.insert(channel.to_string());
                    Ok(())
                }
            }
            None => Err(RegistryError::UnknownConnection(connection.clone())),
        };

        if let Err(e) = committed {
            // The connection went away (or raced past its limit) while we
            // waited on the bus
            if first {
                self.release_if_unused(&slot, &mut gate).await;
            }
            return Err(e);
        }

        slot.members_mut().insert(connection.clone(), outbound);
        debug!(
            channel = %channel,
            connection = %connection,
            subscribers = slot.member_count(),
            "Subscribed"
        );
        Ok(())
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Returns `true` if the subscription existed. On the channel's last
    /// subscriber the upstream subscription is released (with retries).
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream unsubscribe failed; the subscription
    /// is then kept, so the request simply did not take effect.
    pub async fn remove_subscription(
        &self,
        connection: &ConnectionId,
        channel: &str,
    ) -> Result<bool, RegistryError> {
        let Some((slot, mut gate)) = self.acquire_existing(channel).await else {
            return Ok(false);
        };

        let Some(outbound) = slot.members_mut().remove(connection) else {
            return Ok(false);
        };
        if let Some(mut entry) = self.connections.get_mut(connection) {
            entry.channels.remove(channel);
        }
        debug!(
            channel = %channel,
            connection = %connection,
            subscribers = slot.member_count(),
            "Unsubscribed"
        );

        if slot.member_count() > 0 {
            return Ok(true);
        }

        match self.release_upstream(channel).await {
            Ok(()) => {
                self.retire(&slot, &mut gate);
                Ok(true)
            }
            Err(source) => {
                // Put it back so local state matches the bus
                let restored = match self.connections.get_mut(connection) {
                    Some(mut entry) => {
                        entry.channels.insert(channel.to_string());
                        true
                    }
                    None => false,
                };
                if restored {
                    slot.members_mut().insert(connection.clone(), outbound);
                    if source.outcome_unknown() {
                        self.restore_upstream(&slot).await;
                    }
                } else {
                    warn!(channel = %channel, "Connection gone during failed unsubscribe, upstream left stale");
                }
                Err(RegistryError::Bus {
                    op: "unsubscribe",
                    channel: channel.to_string(),
                    source,
                })
            }
        }
    }

    /// Remove a connection and every subscription it holds.
    ///
    /// Each channel left without subscribers is released upstream exactly
    /// once. Returns the number of subscriptions removed; calling it again
    /// returns `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UpstreamLeak`] listing channels whose
    /// upstream unsubscribe failed. The local removal still happened; those
    /// channels are retried by [`Registry::reconcile`].
    pub async fn remove_connection(&self, connection: &ConnectionId) -> Result<usize, RegistryError> {
        let Some((_, entry)) = self.connections.remove(connection) else {
            return Ok(0);
        };

        let mut removed = 0;
        let mut leaked = Vec::new();

        for channel in entry.channels {
            let Some((slot, mut gate)) = self.acquire_existing(&channel).await else {
                continue;
            };
            if slot.members_mut().remove(connection).is_none() {
                continue;
            }
            removed += 1;

            if slot.member_count() > 0 {
                continue;
            }
            match self.release_upstream(&channel).await {
                Ok(()) => self.retire(&slot, &mut gate),
                Err(e) => {
                    error!(channel = %channel, error = %e, "Upstream unsubscribe failed, subscription left stale");
                    leaked.push(channel);
                }
            }
        }

        debug!(connection = %connection, removed, "Removed connection");

        if leaked.is_empty() {
            Ok(removed)
        } else {
            Err(RegistryError::UpstreamLeak(leaked))
        }
    }

    /// Point-in-time snapshot of the connections subscribed to a channel.
    #[must_use]
    pub fn subscribers_of(&self, channel: &str) -> Vec<Outbound> {
        let Some(slot) = self.slots.get(channel).map(|s| Arc::clone(s.value())) else {
            return Vec::new();
        };
        let recipients = slot.members().values().cloned().collect();
        recipients
    }

    /// Re-issue every upstream subscription after the bus reconnected.
    ///
    /// The bus forgets subscriptions across connections, so every channel
    /// with subscribers is subscribed again and every stale slot is dropped.
    pub async fn resubscribe_all(&self) -> ReconcileReport {
        let slots = self.snapshot_slots();
        let mut report = ReconcileReport::default();

        for slot in slots {
            let mut gate = slot.gate.clone().lock_owned().await;
            if gate.retired {
                continue;
            }
            slot.set_upstream(false);
            self.reconcile_slot(&slot, &mut gate, &mut report).await;
        }

        info!(
            subscribed = report.subscribed.len(),
            failed = report.failed.len(),
            "Resubscribed after bus reconnect"
        );
        report
    }

    /// Bring every channel back to `upstream == (subscribers > 0)`.
    ///
    /// Fixes what earlier bus failures left behind: stale upstream
    /// subscriptions and channels whose re-subscription failed.
    pub async fn reconcile(&self) -> ReconcileReport {
        let slots = self.snapshot_slots();
        let mut report = ReconcileReport::default();

        for slot in slots {
            let mut gate = slot.gate.clone().lock_owned().await;
            if gate.retired {
                continue;
            }
            self.reconcile_slot(&slot, &mut gate, &mut report).await;
        }

        if report != ReconcileReport::default() {
            info!(
                subscribed = report.subscribed.len(),
                released = report.released.len(),
                failed = report.failed.len(),
                "Reconciled upstream subscriptions"
            );
        }
        report
    }

    /// Signal every session to close.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.outbound.close();
        }
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            channel_count: self.slots.len(),
            connection_count: self.connections.len(),
            total_subscriptions: self.connections.iter().map(|c| c.channels.len()).sum(),
        }
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.slots
            .get(channel)
            .map(|s| s.member_count())
            .unwrap_or(0)
    }

    /// Whether the registry holds an upstream subscription for a channel.
    #[must_use]
    pub fn is_upstream_active(&self, channel: &str) -> bool {
        self.slots
            .get(channel)
            .map(|s| s.is_upstream())
            .unwrap_or(false)
    }

    /// Get the channels a connection is subscribed to, sorted.
    #[must_use]
    pub fn connection_channels(&self, connection: &ConnectionId) -> Vec<ChannelId> {
        let mut channels: Vec<_> = self
            .connections
            .get(connection)
            .map(|e| e.channels.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Every registered connection with its channels, sorted by ID.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self
            .connections
            .iter()
            .map(|e| {
                let mut channels: Vec<_> = e.channels.iter().cloned().collect();
                channels.sort();
                ConnectionInfo {
                    id: e.key().to_string(),
                    channels,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Every active channel, sorted by name.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<_> = self
            .slots
            .iter()
            .map(|s| ChannelInfo {
                name: s.key().clone(),
                subscribers: s.member_count(),
                upstream: s.is_upstream(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn check_can_add(&self, connection: &ConnectionId, channel: &str) -> Result<(), RegistryError> {
        let entry = self
            .connections
            .get(connection)
            .ok_or_else(|| RegistryError::UnknownConnection(connection.clone()))?;
        if !entry.channels.contains(channel)
            && entry.channels.len() >= self.config.max_subscriptions_per_connection
        {
            return Err(RegistryError::MaxSubscriptionsReached(
                self.config.max_subscriptions_per_connection,
            ));
        }
        Ok(())
    }

    /// Lock the slot of a channel, creating it if needed.
    async fn acquire(&self, channel: &str) -> (Arc<ChannelSlot>, Gate) {
        loop {
            let slot = self
                .slots
                .entry(channel.to_string())
                .or_insert_with(|| {
                    debug!(channel = %channel, "Creating channel slot");
                    Arc::new(ChannelSlot::new(channel))
                })
                .clone();
            let gate = slot.gate.clone().lock_owned().await;
            if !gate.retired {
                return (slot, gate);
            }
        }
    }

    /// Lock the slot of a channel if one exists.
    async fn acquire_existing(&self, channel: &str) -> Option<(Arc<ChannelSlot>, Gate)> {
        loop {
            let slot = self.slots.get(channel).map(|s| Arc::clone(s.value()))?;
            let gate = slot.gate.clone().lock_owned().await;
            if !gate.retired {
                return Some((slot, gate));
            }
        }
    }

    fn snapshot_slots(&self) -> Vec<Arc<ChannelSlot>> {
        self.slots.iter().map(|s| Arc::clone(s.value())).collect()
    }

    async fn release_upstream(&self, channel: &str) -> Result<(), BusError> {
        self.config
            .retry
            .run("unsubscribe", channel, || self.bus.unsubscribe(channel))
            .await?;
        info!(channel = %channel, "Upstream unsubscribed");
        Ok(())
    }

    /// Re-establish the upstream subscription of a slot after an unsubscribe
    /// whose outcome is unknown. Caller holds its gate.
    async fn restore_upstream(&self, slot: &Arc<ChannelSlot>) {
        let channel = slot.name.as_str();
        match self
            .config
            .retry
            .run("subscribe", channel, || self.bus.subscribe(channel))
            .await
        {
            Ok(()) => slot.set_upstream(true),
            Err(e) => {
                error!(channel = %channel, error = %e, "Upstream state unknown, left for reconcile");
                slot.set_upstream(false);
            }
        }
    }

    /// Drop a slot from the map. Caller holds its gate.
    fn retire(&self, slot: &Arc<ChannelSlot>, gate: &mut Gate) {
        gate.retired = true;
        slot.set_upstream(false);
        self.slots
            .remove_if(&slot.name, |_, current| Arc::ptr_eq(current, slot));
        debug!(channel = %slot.name, "Deleted empty channel");
    }

    /// Retire a slot nobody uses and that holds no upstream subscription.
    fn discard_if_unused(&self, slot: &Arc<ChannelSlot>, gate: &mut Gate) {
        if slot.member_count() == 0 && !slot.is_upstream() {
            self.retire(slot, gate);
        }
    }

    /// Undo a 0→1 transition that could not be committed.
    async fn release_if_unused(&self, slot: &Arc<ChannelSlot>, gate: &mut Gate) {
        if slot.member_count() > 0 {
            return;
        }
        if slot.is_upstream() {
            if let Err(e) = self.release_upstream(&slot.name).await {
                error!(channel = %slot.name, error = %e, "Rollback unsubscribe failed, subscription left stale");
                return;
            }
        }
        self.retire(slot, gate);
    }

    async fn reconcile_slot(&self, slot: &Arc<ChannelSlot>, gate: &mut Gate, report: &mut ReconcileReport) {
        let wanted = slot.member_count() > 0;
        match (wanted, slot.is_upstream()) {
            (true, false) => {
                let channel = slot.name.as_str();
                match self
                    .config
                    .retry
                    .run("subscribe", channel, || self.bus.subscribe(channel))
                    .await
                {
                    Ok(()) => {
                        slot.set_upstream(true);
                        report.subscribed.push(slot.name.clone());
                    }
                    Err(e) => {
                        error!(channel = %channel, error = %e, "Upstream resubscribe failed");
                        report.failed.push(slot.name.clone());
                    }
                }
            }
            (false, true) => match self.release_upstream(&slot.name).await {
                Ok(()) => {
                    self.retire(slot, gate);
                    report.released.push(slot.name.clone());
                }
                Err(_) => report.failed.push(slot.name.clone()),
            },
            (false, false) => self.retire(slot, gate),
            (true, true) => {}
        }
    }
}
