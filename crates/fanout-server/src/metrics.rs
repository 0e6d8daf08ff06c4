//! Metrics collection and export for Fanout.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use bytes::Bytes;
use fanout_core::{
    BusError, BusEvents, CloseReason, FanOut, RegistryStats, SessionSummary, UpstreamBus,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "fanout_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "fanout_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "fanout_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "fanout_messages_total";
    pub const MESSAGES_BYTES: &str = "fanout_messages_bytes";
    pub const FANOUT_RECIPIENTS: &str = "fanout_recipients";
    pub const OVERFLOW_DISCONNECTS: &str = "fanout_overflow_disconnects_total";
    pub const UPSTREAM_CALLS: &str = "fanout_upstream_calls_total";
    pub const CHANNELS_ACTIVE: &str = "fanout_channels_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "fanout_subscriptions_active";
    pub const SESSION_SECONDS: &str = "fanout_session_duration_seconds";
    pub const DISPATCH_SECONDS: &str = "fanout_dispatch_latency_seconds";
    pub const ERRORS_TOTAL: &str = "fanout_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused at the connection limit"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames delivered");
    metrics::describe_histogram!(
        names::FANOUT_RECIPIENTS,
        "Subscribers found per upstream message"
    );
    metrics::describe_counter!(
        names::OVERFLOW_DISCONNECTS,
        "Clients disconnected for not keeping up"
    );
    metrics::describe_counter!(names::UPSTREAM_CALLS, "Upstream bus calls by operation and result");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of active channels");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of client subscriptions"
    );
    metrics::describe_histogram!(names::SESSION_SECONDS, "Session lifetime in seconds");
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Time from receiving an upstream message to queueing it for every subscriber"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused at the limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record one dispatched upstream message.
pub fn record_fan_out(fan_out: &FanOut) {
    counter!(names::MESSAGES_TOTAL, "direction" => "upstream").increment(1);
    histogram!(names::FANOUT_RECIPIENTS).record(fan_out.recipients as f64);
    if fan_out.recipients > 0 {
        histogram!(names::DISPATCH_SECONDS).record(fan_out.latency.as_secs_f64());
    }
    if fan_out.delivered > 0 {
        counter!(names::MESSAGES_TOTAL, "direction" => "outbound").increment(fan_out.delivered as u64);
        counter!(names::MESSAGES_BYTES, "direction" => "outbound")
            .increment((fan_out.bytes * fan_out.delivered) as u64);
    }
    if fan_out.overflowed > 0 {
        counter!(names::OVERFLOW_DISCONNECTS).increment(fan_out.overflowed as u64);
    }
}

/// Record a finished session.
pub fn record_session(summary: &SessionSummary, lifetime: Duration) {
    counter!(names::MESSAGES_TOTAL, "direction" => "inbound").increment(summary.frames_in);
    histogram!(names::SESSION_SECONDS).record(lifetime.as_secs_f64());
    if summary.rejected > 0 {
        counter!(names::ERRORS_TOTAL, "type" => "rejected_frame").increment(summary.rejected);
    }
    match summary.reason {
        CloseReason::TransportError => record_error("transport"),
        CloseReason::WriteFailed => record_error("write"),
        CloseReason::ClientClosed | CloseReason::Forced => {}
    }
}

/// Update registry gauges.
pub fn set_registry_stats(stats: &RegistryStats) {
    gauge!(names::CHANNELS_ACTIVE).set(stats.channel_count as f64);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.total_subscriptions as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

fn record_upstream(op: &'static str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!(names::UPSTREAM_CALLS, "op" => op, "result" => result).increment(1);
}

/// An [`UpstreamBus`] that counts the calls made through it.
pub struct MeteredBus {
    inner: Arc<dyn UpstreamBus>,
}

impl MeteredBus {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn UpstreamBus>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl UpstreamBus for MeteredBus {
    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        let result = self.inner.subscribe(channel).await;
        record_upstream("subscribe", result.is_ok());
        result
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        let result = self.inner.unsubscribe(channel).await;
        record_upstream("unsubscribe", result.is_ok());
        result
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        let result = self.inner.publish(channel, payload).await;
        record_upstream("publish", result.is_ok());
        result
    }

    fn events(&self) -> Result<BusEvents, BusError> {
        self.inner.events()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::MemoryBus;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; must not panic
        let _guard = ConnectionMetricsGuard::new();
        record_fan_out(&FanOut {
            channel: "x".into(),
            recipients: 2,
            delivered: 1,
            overflowed: 1,
            bytes: 10,
            latency: Duration::from_micros(40),
        });
    }

    #[tokio::test]
    async fn test_metered_bus_forwards() {
        let inner = Arc::new(MemoryBus::new());
        let bus = MeteredBus::new(inner.clone());

        bus.subscribe("x").await.unwrap();
        assert!(inner.is_subscribed("x"));
        assert_eq!(bus.name(), "memory");

        bus.unsubscribe("x").await.unwrap();
        assert!(!inner.is_subscribed("x"));
        assert!(bus.events().is_ok());
    }
}
