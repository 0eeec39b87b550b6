//! Prometheus metrics for one bus.
//!
//! Every bus owns its own [`Registry`], so several buses in one process (or
//! in one test binary) never collide. All names follow
//! `relay_<area>_<metric>_<unit>`.
//!
//! ## Metrics Exported
//!
//! - `relay_pool_connections` / `relay_pool_available` / `relay_pool_in_use` - pool gauges
//! - `relay_dispatch_backlog` / `relay_dispatch_concurrency` - dispatcher gauges
//! - `relay_bus_state` - 0=Disconnected, 1=Connecting, 2=Subscribed, 3=Degraded
//! - `relay_publish_duration_seconds` / `relay_delivery_duration_seconds` - latency histograms
//! - `relay_reconnects_total` - reconnect attempts after the subscription connection was lost
//! - `relay_messages_published_total` / `relay_messages_received_total` / `relay_messages_dropped_total`
//! - `relay_publish_failures_total` / `relay_decode_errors_total` / `relay_self_echo_suppressed_total`
//! - `relay_callbacks_total{outcome}` - ok, error, panic, timeout

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use serde::Serialize;

use relay_core::{defaults, Error, Result};

use crate::pool::PoolStats;

/// Rolling window of latency samples in milliseconds.
pub struct LatencyWindow {
    samples: Mutex<VecDeque<f64>>,
    capacity: usize,
}

/// Summary of a [`LatencyWindow`].
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(elapsed.as_secs_f64() * 1_000.0);
    }

    pub fn summary(&self) -> LatencySummary {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let p99_idx = ((n as f64 * 0.99).ceil() as usize).clamp(1, n) - 1;
        LatencySummary {
            samples: n,
            mean_ms: sorted.iter().sum::<f64>() / n as f64,
            p99_ms: sorted[p99_idx],
            max_ms: sorted[n - 1],
        }
    }
}

/// Metric handles for one bus.
pub struct BusMetrics {
    registry: Registry,

    pub pool_connections: IntGauge,
    pub pool_available: IntGauge,
    pub pool_in_use: IntGauge,
    pub dispatch_backlog: IntGauge,
    pub dispatch_concurrency: IntGauge,
    pub state: IntGauge,

    pub publish_duration: Histogram,
    pub delivery_duration: Histogram,

    pub reconnects: IntCounter,
    pub published: IntCounter,
    pub received: IntCounter,
    pub dropped: IntCounter,
    pub publish_failures: IntCounter,
    pub decode_errors: IntCounter,
    pub self_echo_suppressed: IntCounter,
    pub callbacks: IntCounterVec,

    pub publish_window: LatencyWindow,
    pub delivery_window: LatencyWindow,
}

fn init_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics init failed: {}", e))
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let g = IntGauge::new(name, help).map_err(init_err)?;
    registry.register(Box::new(g.clone())).map_err(init_err)?;
    Ok(g)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::new(name, help).map_err(init_err)?;
    registry.register(Box::new(c.clone())).map_err(init_err)?;
    Ok(c)
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Result<Histogram> {
    let buckets = exponential_buckets(0.000_5, 2.0, 16).map_err(init_err)?;
    let h = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .map_err(init_err)?;
    registry.register(Box::new(h.clone())).map_err(init_err)?;
    Ok(h)
}

impl BusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("relay".into()), None).map_err(init_err)?;
        let r = &registry;

        let callbacks = IntCounterVec::new(
            Opts::new("callbacks_total", "Subscriber callback invocations by outcome"),
            &["outcome"],
        )
        .map_err(init_err)?;
        registry
            .register(Box::new(callbacks.clone()))
            .map_err(init_err)?;

        Ok(Self {
            pool_connections: gauge(r, "pool_connections", "Open pooled connections")?,
            pool_available: gauge(r, "pool_available", "Idle pooled connections")?,
            pool_in_use: gauge(r, "pool_in_use", "Leased pooled connections")?,
            dispatch_backlog: gauge(r, "dispatch_backlog", "Received messages awaiting dispatch")?,
            dispatch_concurrency: gauge(
                r,
                "dispatch_concurrency",
                "Current dispatcher concurrency limit",
            )?,
            state: gauge(r, "bus_state", "Bus lifecycle state")?,
            publish_duration: histogram(
                r,
                "publish_duration_seconds",
                "Publish latency including pool acquire",
            )?,
            delivery_duration: histogram(
                r,
                "delivery_duration_seconds",
                "Publish-to-callback-completion latency",
            )?,
            reconnects: counter(
                r,
                "reconnects_total",
                "Subscription reconnect attempts, successful or not",
            )?,
            published: counter(r, "messages_published_total", "Events published to the backend")?,
            received: counter(r, "messages_received_total", "Messages read from the subscription")?,
            dropped: counter(r, "messages_dropped_total", "Received messages never dispatched")?,
            publish_failures: counter(r, "publish_failures_total", "Failed publishes")?,
            decode_errors: counter(r, "decode_errors_total", "Undecodable payloads or channels")?,
            self_echo_suppressed: counter(
                r,
                "self_echo_suppressed_total",
                "Network copies of own events skipped",
            )?,
            callbacks,
            publish_window: LatencyWindow::new(defaults::LATENCY_WINDOW),
            delivery_window: LatencyWindow::new(defaults::LATENCY_WINDOW),
            registry,
        })
    }

    /// Record one publish round trip.
    pub fn observe_publish(&self, elapsed: Duration) {
        self.publish_duration.observe(elapsed.as_secs_f64());
        self.publish_window.record(elapsed);
    }

    /// Record one callback completing, measured from the event's publish
    /// timestamp.
    pub fn observe_delivery(&self, elapsed: Duration) {
        self.delivery_duration.observe(elapsed.as_secs_f64());
        self.delivery_window.record(elapsed);
    }

    /// Count one callback outcome (`ok`, `error`, `panic`, `timeout`).
    pub fn callback(&self, outcome: &str) {
        self.callbacks.with_label_values(&[outcome]).inc();
    }

    pub fn callback_count(&self, outcome: &str) -> u64 {
        self.callbacks.with_label_values(&[outcome]).get()
    }

    pub fn observe_pool(&self, stats: &PoolStats) {
        self.pool_connections.set(stats.size as i64);
        self.pool_available.set(stats.idle as i64);
        self.pool_in_use.set(stats.in_use as i64);
    }

    /// Prometheus text exposition of every metric.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encode failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}
