//! Health monitor.
//!
//! Every interval the monitor:
//!
//! 1. `PING`s the backend on a pooled connection (independent of the
//!    subscription connection),
//! 2. publishes a heartbeat on this process's control channel; its echo
//!    through the subscription connection measures pub/sub round trip,
//! 3. declares the subscription connection stale and forces `Degraded` when
//!    it has been silent for `stale_threshold`, or for a full interval after
//!    a failed probe. Heartbeats guarantee traffic on a live connection, so
//!    silence means a half-open connection. Silence is not judged while the
//!    subscriber loop waits on a full dispatcher queue: it is not reading
//!    then, and the backpressure is intended,
//! 4. tops up `min_idle` pooled connections and refreshes gauges.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, instrument, warn};

use relay_core::{encode_event, ChannelNamer, Event, HealthConfig};

use crate::dispatcher::Dispatcher;
use crate::metrics::{BusMetrics, LatencySummary};
use crate::pool::{ConnectionPool, PoolStats};
use crate::registry::Registry;
use crate::state::{BusState, StateCell};

#[derive(Debug, Clone, Copy, Default)]
struct Probe {
    ok: Option<bool>,
    latency_ms: Option<f64>,
    checked_at: Option<DateTime<Utc>>,
}

/// Liveness signals shared by the subscriber loop and the monitor.
pub struct Liveness {
    last_traffic: Mutex<Option<Instant>>,
    dispatch_wait: AtomicBool,
    probe: Mutex<Probe>,
    pubsub_latency_ms: Mutex<Option<u64>>,
    reconnects: AtomicU64,
    heartbeat_seq: AtomicU64,
    degrade: watch::Sender<u64>,
}

impl Default for Liveness {
    fn default() -> Self {
        let (degrade, _) = watch::channel(0);
        Self {
            last_traffic: Mutex::new(None),
            dispatch_wait: AtomicBool::new(false),
            probe: Mutex::new(Probe::default()),
            pubsub_latency_ms: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            heartbeat_seq: AtomicU64::new(0),
            degrade,
        }
    }
}

impl Liveness {
    /// Record traffic on the subscription connection.
    pub fn touch(&self) {
        *self.last_traffic.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Forget the subscription connection (it is gone).
    pub fn clear(&self) {
        self.dispatch_wait.store(false, Ordering::SeqCst);
        *self.last_traffic.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// The subscriber loop is waiting for dispatcher queue space and not
    /// reading its connection.
    pub fn begin_dispatch_wait(&self) {
        self.dispatch_wait.store(true, Ordering::SeqCst);
    }

    /// The wait is over; silence is measured from now.
    pub fn end_dispatch_wait(&self) {
        self.touch();
        self.dispatch_wait.store(false, Ordering::SeqCst);
    }

    pub fn in_dispatch_wait(&self) -> bool {
        self.dispatch_wait.load(Ordering::SeqCst)
    }

    /// Time since the last subscription traffic, if connected.
    pub fn silence(&self) -> Option<Duration> {
        self.last_traffic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| t.elapsed())
    }

    pub fn record_echo(&self, latency_ms: u64) {
        *self.pubsub_latency_ms.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency_ms);
    }

    fn record_probe(&self, ok: bool, latency: Duration) {
        *self.probe.lock().unwrap_or_else(|e| e.into_inner()) = Probe {
            ok: Some(ok),
            latency_ms: Some(latency.as_secs_f64() * 1_000.0),
            checked_at: Some(Utc::now()),
        };
    }

    fn probe(&self) -> Probe {
        *self.probe.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn count_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Ask the subscriber loop to drop its connection and reconnect.
    pub fn force_degrade(&self) {
        self.degrade.send_modify(|n| *n += 1);
    }

    pub fn degrade_signal(&self) -> watch::Receiver<u64> {
        self.degrade.subscribe()
    }
}

/// Point-in-time health of the bus.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: BusState,
    pub origin: String,
    pub backend: String,
    pub probe_ok: Option<bool>,
    pub probe_latency_ms: Option<f64>,
    pub probe_checked_at: Option<DateTime<Utc>>,
    /// Heartbeat publish-to-echo latency.
    pub pubsub_latency_ms: Option<u64>,
    pub publish_latency: LatencySummary,
    pub delivery_latency: LatencySummary,
    pub pool: PoolStats,
    /// Utilization of the pool, `in_use / max_size`.
    pub pool_utilization: f64,
    pub dispatch_backlog: usize,
    pub dispatch_concurrency: usize,
    pub reconnects: u64,
    /// Time since subscription traffic; `None` when not connected.
    pub silence_ms: Option<u64>,
    /// Local subscriptions.
    pub subscriptions: usize,
}

impl HealthSnapshot {
    /// Healthy means subscribed with a passing (or not yet run) probe.
    pub fn is_healthy(&self) -> bool {
        self.state == BusState::Subscribed && self.probe_ok != Some(false)
    }
}

/// Sources a snapshot is assembled from.
pub struct HealthSources {
    pub origin: String,
    pub backend: String,
    pub state: Arc<StateCell>,
    pub liveness: Arc<Liveness>,
    pub pool: Arc<ConnectionPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<BusMetrics>,
    pub registry: Arc<Registry>,
}

impl HealthSources {
    pub fn snapshot(&self) -> HealthSnapshot {
        let probe = self.liveness.probe();
        let pool = self.pool.stats();
        let pool_utilization = if pool.max_size == 0 {
            0.0
        } else {
            pool.in_use as f64 / pool.max_size as f64
        };
        HealthSnapshot {
            state: self.state.get(),
            origin: self.origin.clone(),
            backend: self.backend.clone(),
            probe_ok: probe.ok,
            probe_latency_ms: probe.latency_ms,
            probe_checked_at: probe.checked_at,
            pubsub_latency_ms: *self
                .liveness
                .pubsub_latency_ms
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            publish_latency: self.metrics.publish_window.summary(),
            delivery_latency: self.metrics.delivery_window.summary(),
            pool,
            pool_utilization,
            dispatch_backlog: self.dispatcher.backlog(),
            dispatch_concurrency: self.dispatcher.concurrency_limit(),
            reconnects: self.liveness.reconnects(),
            silence_ms: self.liveness.silence().map(|d| d.as_millis() as u64),
            subscriptions: self.registry.len(),
        }
    }

    /// Refresh gauges from current values.
    pub fn refresh_gauges(&self) {
        self.metrics.observe_pool(&self.pool.stats());
        self.metrics
            .dispatch_backlog
            .set(self.dispatcher.backlog() as i64);
        self.metrics
            .dispatch_concurrency
            .set(self.dispatcher.concurrency_limit() as i64);
        self.metrics.state.set(self.state.get().as_gauge());
    }
}

/// Periodic liveness probe and staleness detector.
pub struct HealthMonitor {
    pub sources: Arc<HealthSources>,
    pub namer: ChannelNamer,
    pub config: HealthConfig,
}

impl HealthMonitor {
    #[instrument(skip_all, fields(subsystem = "bus", component = "health"))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.check().await,
            }
        }
        debug!("Health monitor stopped");
    }

    /// One probe cycle.
    pub async fn check(&self) {
        let s = &self.sources;
        let probe_ok = self.probe().await;

        if s.state.get() == BusState::Subscribed && !s.liveness.in_dispatch_wait() {
            if let Some(silence) = s.liveness.silence() {
                let stale = silence >= self.config.stale_threshold
                    || (!probe_ok && silence >= self.config.interval);
                if stale {
                    warn!(
                        op = "staleness",
                        silence_ms = silence.as_millis() as u64,
                        probe_ok,
                        "Subscription connection is stale, forcing reconnect"
                    );
                    s.liveness.force_degrade();
                }
            }
        }

        if probe_ok {
            if let Err(e) = s.pool.ensure_min_idle().await {
                debug!(op = "min_idle", error = %e, "Could not top up idle connections");
            }
        }
        s.refresh_gauges();

        let pool = s.pool.stats();
        debug!(
            op = "probe",
            state = %s.state.get(),
            probe_ok,
            pool_size = pool.size,
            pool_in_use = pool.in_use,
            backlog = s.dispatcher.backlog(),
            concurrency = s.dispatcher.concurrency_limit(),
            "Health check"
        );
    }

    async fn probe(&self) -> bool {
        let s = &self.sources;
        let start = Instant::now();
        let ok = match s.pool.acquire().await {
            Ok(mut lease) => match lease.ping().await {
                Ok(()) => {
                    let seq = s.liveness.heartbeat_seq.fetch_add(1, Ordering::SeqCst);
                    let channel = self.namer.health(&s.origin);
                    let beat = Event::new(
                        ChannelNamer::heartbeat_type(&s.origin),
                        json!({"seq": seq}),
                        s.origin.clone(),
                    );
                    match encode_event(&beat) {
                        Ok(payload) => {
                            if let Err(e) = lease.publish(&channel, payload).await {
                                debug!(op = "heartbeat", error = %e, "Heartbeat publish failed");
                            }
                        }
                        Err(e) => debug!(op = "heartbeat", error = %e, "Heartbeat encode failed"),
                    }
                    true
                }
                Err(e) => {
                    warn!(op = "probe", error = %e, "Backend PING failed");
                    false
                }
            },
            Err(e) => {
                warn!(op = "probe", error = %e, "No connection for health probe");
                false
            }
        };
        s.liveness.record_probe(ok, start.elapsed());
        ok
    }
}
