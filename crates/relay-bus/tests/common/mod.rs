//! Shared fixtures for the relay-bus integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_bus::{handler_fn, Backend, EventBus, EventHandler, MemoryBackend};
use relay_core::{BackendChannel, BackoffConfig, BusConfig, HealthConfig, PoolConfig};
use tokio::time::{sleep, Instant};

/// Memory-backed config with short timings, identified as `origin`.
pub fn config(origin: &str) -> BusConfig {
    BusConfig::new("memory://")
        .with_origin_id(origin)
        .with_pool(
            PoolConfig::default()
                .with_max_size(8)
                .with_min_idle(1)
                .with_acquire_timeout(Duration::from_millis(500)),
        )
        .with_backoff(
            BackoffConfig::default()
                .with_bounds(Duration::from_millis(10), Duration::from_millis(50)),
        )
        .with_shutdown_timeout(Duration::from_secs(2))
}

/// Health probing every 50ms, stale after 250ms of silence.
pub fn fast_health() -> HealthConfig {
    HealthConfig::default()
        .with_interval(Duration::from_millis(50))
        .with_stale_threshold(Duration::from_millis(250))
}

/// Start a bus on a shared memory broker and wait until it is subscribed.
pub async fn start(backend: &MemoryBackend, config: BusConfig) -> EventBus {
    let backend: Arc<dyn Backend> = Arc::new(backend.clone());
    let bus = EventBus::with_backend(config, backend)
        .await
        .expect("bus starts");
    assert!(
        bus.wait_until_subscribed(Duration::from_secs(2)).await,
        "bus never reached Subscribed"
    );
    bus
}

/// Poll `check` every 5ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Wait until `bus` holds `channel` on its live subscription connection.
pub async fn wait_active(bus: &EventBus, channel: BackendChannel) {
    assert!(
        eventually(Duration::from_secs(2), || bus
            .active_subscriptions()
            .contains(&channel))
        .await,
        "backend subscription {} never became active",
        channel
    );
}

pub fn direct(event_type: &str) -> BackendChannel {
    BackendChannel::Channel(format!("event:d:{}", event_type))
}

pub fn pattern(prefix: &str) -> BackendChannel {
    BackendChannel::Pattern(format!("event:d:{}*", prefix))
}

/// Handler counting its invocations.
pub fn counting() -> (Arc<AtomicUsize>, Arc<dyn EventHandler>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let handler = handler_fn(move |_| {
        let c = c.clone();
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    (count, Arc::new(handler))
}

pub fn load(count: &AtomicUsize) -> usize {
    count.load(Ordering::SeqCst)
}

/// Handler that sleeps for `delay` and then counts the event.
pub fn slow_counting(delay: Duration) -> (Arc<AtomicUsize>, Arc<dyn EventHandler>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let handler = handler_fn(move |_| {
        let c = c.clone();
        async move {
            sleep(delay).await;
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    (count, Arc::new(handler))
}

/// Value of an unlabeled metric in `bus`'s exposition text.
pub fn metric(bus: &EventBus, name: &str) -> u64 {
    let text = bus.metrics_text().expect("metrics encode");
    text.lines()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(' '))
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|v| v as u64)
        .unwrap_or_else(|| panic!("metric {name} not exported"))
}
