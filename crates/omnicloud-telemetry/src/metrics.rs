//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes a minimal set of counters/gauges relevant to distribution nodes.

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Prometheus-backed metrics registry shared across node services.
#[derive(Clone)]
pub struct Metrics {
    inner: std::sync::Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    announces_total: IntCounterVec,
    active_torrents: IntGauge,
    queue_depth: IntGauge,
    transfers_active: IntGauge,
    relay_sessions_active: IntGauge,
    relay_bytes_total: IntCounter,
    control_connections: IntGauge,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Current number of torrents managed by the engine.
    pub active_torrents: i64,
    /// Current depth of the hashing queue.
    pub queue_depth: i64,
    /// Transfers currently downloading.
    pub transfers_active: i64,
    /// Relay bridges currently open.
    pub relay_sessions_active: i64,
    /// Control-plane connections currently attached.
    pub control_connections: i64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let announces_total = IntCounterVec::new(
            Opts::new("tracker_announces_total", "Tracker announces by outcome"),
            &["event", "status"],
        )?;
        let active_torrents =
            IntGauge::with_opts(Opts::new("active_torrents", "Torrents managed by the engine"))?;
        let queue_depth =
            IntGauge::with_opts(Opts::new("queue_depth", "Pending hashing queue items"))?;
        let transfers_active =
            IntGauge::with_opts(Opts::new("transfers_active", "Transfers currently downloading"))?;
        let relay_sessions_active = IntGauge::with_opts(Opts::new(
            "relay_sessions_active",
            "Relay bridges currently open",
        ))?;
        let relay_bytes_total = IntCounter::with_opts(Opts::new(
            "relay_bytes_total",
            "Bytes bridged through the relay",
        ))?;
        let control_connections = IntGauge::with_opts(Opts::new(
            "control_connections",
            "Control-plane connections currently attached",
        ))?;

        registry.register(Box::new(announces_total.clone()))?;
        registry.register(Box::new(active_torrents.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(transfers_active.clone()))?;
        registry.register(Box::new(relay_sessions_active.clone()))?;
        registry.register(Box::new(relay_bytes_total.clone()))?;
        registry.register(Box::new(control_connections.clone()))?;

        Ok(Self {
            inner: std::sync::Arc::new(MetricsInner {
                registry,
                announces_total,
                active_torrents,
                queue_depth,
                transfers_active,
                relay_sessions_active,
                relay_bytes_total,
                control_connections,
            }),
        })
    }

    /// Record one tracker announce outcome.
    pub fn record_announce(&self, event: &str, status: &str) {
        self.inner
            .announces_total
            .with_label_values(&[event, status])
            .inc();
    }

    /// Update the active-torrent gauge.
    pub fn set_active_torrents(&self, count: i64) {
        self.inner.active_torrents.set(count);
    }

    /// Update the hashing queue depth gauge.
    pub fn set_queue_depth(&self, depth: i64) {
        self.inner.queue_depth.set(depth);
    }

    /// Update the active-transfer gauge.
    pub fn set_transfers_active(&self, count: i64) {
        self.inner.transfers_active.set(count);
    }

    /// Update the relay session gauge.
    pub fn set_relay_sessions_active(&self, count: i64) {
        self.inner.relay_sessions_active.set(count);
    }

    /// Add bridged bytes to the relay counter.
    pub fn add_relay_bytes(&self, bytes: u64) {
        self.inner.relay_bytes_total.inc_by(bytes);
    }

    /// Update the control-connection gauge.
    pub fn set_control_connections(&self, count: i64) {
        self.inner.control_connections.set(count);
    }

    /// Produce a snapshot of the health-relevant gauges.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_torrents: self.inner.active_torrents.get(),
            queue_depth: self.inner.queue_depth.get(),
            transfers_active: self.inner.transfers_active.get(),
            relay_sessions_active: self.inner.relay_sessions_active.get(),
            control_connections: self.inner.control_connections.get(),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_gauge_updates() {
        let metrics = Metrics::new().expect("metrics registry");
        metrics.set_active_torrents(3);
        metrics.set_queue_depth(2);
        metrics.set_transfers_active(1);
        metrics.set_relay_sessions_active(4);
        metrics.set_control_connections(5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_torrents, 3);
        assert_eq!(snapshot.queue_depth, 2);
        assert_eq!(snapshot.transfers_active, 1);
        assert_eq!(snapshot.relay_sessions_active, 4);
        assert_eq!(snapshot.control_connections, 5);
    }

    #[test]
    fn render_includes_counter_names() {
        let metrics = Metrics::new().expect("metrics registry");
        metrics.record_announce("started", "ok");
        metrics.add_relay_bytes(128);
        let text = metrics.render().expect("render");
        assert!(text.contains("tracker_announces_total"));
        assert!(text.contains("relay_bytes_total"));
    }
}
