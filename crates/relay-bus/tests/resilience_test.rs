//! Integration tests for connection loss and recovery.
//!
//! Faults are injected through `MemoryBackend`:
//! - subscription connections dropped (network blip)
//! - subscription connections stalled but open (half-open connection)
//! - backend unavailable (server down)
//!
//! Covers reconnect restoring exactly the subscription set, staleness
//! detection (and not confusing backpressure with it), local loopback while
//! degraded, and the fatal reconnect limit.

mod common;

use std::sync::Arc;
use std::time::Duration;

use relay_bus::{Backend, BusState, EventBus, MemoryBackend};
use relay_core::{BackendChannel, BackoffConfig, DispatchConfig};
use serde_json::json;

use common::{
    config, counting, direct, eventually, fast_health, load, metric, pattern, slow_counting,
    start, wait_active,
};

#[tokio::test]
async fn test_reconnect_restores_exact_subscription_set() {
    let backend = MemoryBackend::new();
    let a = start(&backend, config("node-a")).await;

    let (exact_count, exact) = counting();
    let (wild_count, wild) = counting();
    a.subscribe_handler("doc:1:saved", exact).unwrap();
    a.subscribe_handler("doc:*", wild).unwrap();
    let (_, extra) = counting();
    // Same backend channel as the wildcard above; must not be subscribed twice.
    a.subscribe_handler("doc:*", extra).unwrap();
    wait_active(&a, direct("doc:1:saved")).await;
    wait_active(&a, pattern("doc:")).await;

    let expected = a.active_subscriptions();
    assert_eq!(expected.len(), 2);

    backend.disconnect_subscribers();
    assert!(eventually(Duration::from_secs(2), || a.health().reconnects >= 1).await);
    assert!(a.wait_until_subscribed(Duration::from_secs(2)).await);
    assert!(eventually(Duration::from_secs(2), || a.active_subscriptions() == expected).await);

    assert_eq!(backend.subscriber_count(), 1);
    assert_eq!(backend.subscribers_opened(), 2);
    let control = BackendChannel::Channel("event:c:health:node-a".into());
    let mut on_wire = expected.clone();
    on_wire.insert(control);
    assert_eq!(backend.subscriptions(), on_wire);
    for channel in &on_wire {
        assert_eq!(backend.subscription_count(channel), 1);
    }

    let b = start(&backend, config("node-b")).await;
    b.publish("doc:1:saved", json!({})).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || load(&exact_count) == 1
        && load(&wild_count) == 1)
    .await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_subscription_added_while_degraded_is_restored() {
    let backend = MemoryBackend::new();
    let a = start(&backend, config("node-a")).await;

    backend.set_available(false);
    assert!(a.wait_for_state(BusState::Degraded, Duration::from_secs(2)).await);

    let (count, handler) = counting();
    a.subscribe_handler("late", handler).unwrap();

    backend.set_available(true);
    assert!(a.wait_until_subscribed(Duration::from_secs(2)).await);
    wait_active(&a, direct("late")).await;

    let b = start(&backend, config("node-b")).await;
    b.publish("late", json!({})).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || load(&count) == 1).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_half_open_connection_detected_and_recovered() {
    let backend = MemoryBackend::new();
    let a = start(&backend, config("node-a").with_health(fast_health())).await;

    let (count, handler) = counting();
    a.subscribe_handler("signal", handler).unwrap();
    wait_active(&a, direct("signal")).await;

    // Heartbeat echoes arrive while the connection is live.
    assert!(
        eventually(Duration::from_secs(2), || a.health().pubsub_latency_ms.is_some()).await
    );
    assert_eq!(a.health().reconnects, 0);

    backend.stall_subscribers(true);
    assert!(eventually(Duration::from_secs(3), || a.health().reconnects >= 1).await);
    backend.stall_subscribers(false);

    assert!(a.wait_until_subscribed(Duration::from_secs(2)).await);
    wait_active(&a, direct("signal")).await;

    let b = start(&backend, config("node-b")).await;
    b.publish("signal", json!({})).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || load(&count) == 1).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_backpressure_is_not_mistaken_for_stale_connection() {
    const EVENTS: usize = 6;

    let backend = MemoryBackend::new();
    let a = start(
        &backend,
        config("node-a").with_health(fast_health()).with_dispatch(
            DispatchConfig::default()
                .with_concurrency(1)
                .with_max_concurrency(1)
                .with_queue_bound(1),
        ),
    )
    .await;
    let b = start(&backend, config("node-b")).await;

    // Each callback outlasts the 250ms stale threshold, so the subscriber
    // loop waits on the full queue longer than that.
    let (count, handler) = slow_counting(Duration::from_millis(300));
    a.subscribe_handler("slow", handler).unwrap();
    wait_active(&a, direct("slow")).await;

    for n in 0..EVENTS {
        b.publish("slow", json!({"n": n})).await.unwrap();
    }

    assert!(eventually(Duration::from_secs(5), || load(&count) == EVENTS).await);
    assert_eq!(a.health().reconnects, 0);
    assert_eq!(metric(&a, "relay_reconnects_total"), 0);
    assert_eq!(metric(&a, "relay_messages_dropped_total"), 0);
    assert_eq!(backend.subscribers_opened(), 2);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_loopback_delivers_while_backend_down() {
    let backend = MemoryBackend::new();
    let a = start(&backend, config("node-a")).await;

    let (count, handler) = counting();
    a.subscribe_handler("alert", handler).unwrap();

    backend.set_available(false);
    assert!(a.wait_for_state(BusState::Degraded, Duration::from_secs(2)).await);

    let err = a.publish("alert", json!({"level": "high"})).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(eventually(Duration::from_secs(2), || load(&count) == 1).await);
    assert!(a
        .metrics_text()
        .unwrap()
        .contains("relay_publish_failures_total 1"));

    backend.set_available(true);
    assert!(a.wait_until_subscribed(Duration::from_secs(2)).await);
    let receipt = a.publish("alert", json!({"level": "low"})).await.unwrap();
    assert_eq!(receipt.local_deliveries, 1);
    assert!(eventually(Duration::from_secs(2), || load(&count) == 2).await);

    a.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_limit_shuts_bus_down() {
    let backend = MemoryBackend::new();
    backend.set_available(false);
    let shared: Arc<dyn Backend> = Arc::new(backend.clone());
    let bus = EventBus::with_backend(
        config("node-a").with_backoff(
            BackoffConfig::default()
                .with_bounds(Duration::from_millis(5), Duration::from_millis(10))
                .with_max_attempts(Some(2)),
        ),
        shared,
    )
    .await
    .unwrap();

    assert!(eventually(Duration::from_secs(3), || bus.is_shut_down()).await);
    assert!(bus.wait_for_state(BusState::Disconnected, Duration::from_secs(3)).await);
    assert_eq!(bus.health().reconnects, 2);
    // Every attempt counts, including ones that never connected.
    assert_eq!(metric(&bus, "relay_reconnects_total"), 2);
    assert!(matches!(
        bus.subscribe("x", relay_bus::handler::NoOpHandler),
        Err(relay_bus::Error::ShuttingDown)
    ));

    // Explicit shutdown after the internal one is a no-op.
    bus.shutdown().await;
    assert_eq!(bus.state(), BusState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_unsubscribes_and_releases_connections() {
    let backend = MemoryBackend::new();
    let a = start(&backend, config("node-a")).await;
    let (_, handler) = counting();
    a.subscribe_handler("bye", handler).unwrap();
    wait_active(&a, direct("bye")).await;

    a.shutdown().await;

    assert_eq!(a.state(), BusState::Disconnected);
    assert_eq!(backend.subscriber_count(), 0);
    assert!(backend.subscriptions().is_empty());
    assert!(a.active_subscriptions().is_empty());
    assert_eq!(a.pool_stats().size, 0);
    assert_eq!(a.subscription_count(), 0);
}
