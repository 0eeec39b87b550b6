//! Integration tests for event delivery across buses.
//!
//! Two buses built on clones of one `MemoryBackend` behave like two processes
//! sharing one Redis server. Covers:
//! - wildcard and exact subscriptions across processes, without duplicates
//! - publish serialization through a single-connection pool
//! - dispatcher backpressure under a slow subscriber
//! - accounting of undelivered messages at shutdown
//! - no delivery after unsubscribe
//! - self-echo suppression for the publishing process
//! - health snapshot and metrics exposition

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_bus::{handler_fn, BusState, MemoryBackend};
use relay_core::{DispatchConfig, PoolConfig};
use serde_json::json;
use tokio::time::{sleep, Instant};

use common::{
    config, counting, direct, eventually, load, metric, pattern, slow_counting, start,
    wait_active,
};

#[tokio::test]
async fn test_room_wildcard_scenario() {
    let backend = MemoryBackend::new();
    let a = start(&backend, config("node-a")).await;
    let b = start(&backend, config("node-b")).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    a.subscribe(
        "room:*",
        handler_fn(move |event| {
            let s = s.clone();
            async move {
                s.lock().unwrap().push(event);
                Ok(())
            }
        }),
    )
    .unwrap();
    let (exact, exact_handler) = counting();
    a.subscribe_handler("room:42:joined", exact_handler).unwrap();
    let (other, other_handler) = counting();
    a.subscribe_handler("lobby:*", other_handler).unwrap();

    wait_active(&a, pattern("room:")).await;
    wait_active(&a, direct("room:42:joined")).await;

    let receipt = b
        .publish("room:42:joined", json!({"user": "u1"}))
        .await
        .unwrap();
    assert_eq!(receipt.local_deliveries, 0);
    // Pattern and exact subscription on A's one subscription connection.
    assert_eq!(receipt.receivers, 2);

    assert!(eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 1).await);
    assert!(eventually(Duration::from_secs(2), || load(&exact) == 1).await);
    sleep(Duration::from_millis(100)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1, "wildcard delivered exactly once");
    assert_eq!(load(&exact), 1, "exact delivered exactly once");
    assert_eq!(load(&other), 0);
    assert_eq!(seen[0].event_id, receipt.event_id);
    assert_eq!(seen[0].origin, "node-b");
    assert_eq!(seen[0].data["user"], "u1");
    drop(seen);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_single_connection_pool_serializes_publishes() {
    let backend = MemoryBackend::new();
    backend.set_publish_delay(Duration::from_millis(50));
    let bus = start(
        &backend,
        config("node-a").with_pool(
            PoolConfig::default()
                .with_max_size(1)
                .with_min_idle(0)
                .with_acquire_timeout(Duration::from_secs(2)),
        ),
    )
    .await;

    let start = Instant::now();
    let (first, second) = tokio::join!(
        bus.publish("job:done", json!({"n": 1})),
        bus.publish("job:done", json!({"n": 2})),
    );
    first.unwrap();
    second.unwrap();

    assert!(start.elapsed() >= Duration::from_millis(100));
    let stats = bus.pool_stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.created_total, 1);
    assert_eq!(stats.in_use, 0);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_pool_surfaces_error() {
    let backend = MemoryBackend::new();
    backend.set_publish_delay(Duration::from_millis(300));
    let bus = start(
        &backend,
        config("node-a").with_pool(
            PoolConfig::default()
                .with_max_size(1)
                .with_min_idle(0)
                .with_acquire_timeout(Duration::from_millis(50)),
        ),
    )
    .await;

    let (first, second) = tokio::join!(
        bus.publish("job:done", json!(1)),
        bus.publish("job:done", json!(2)),
    );
    assert!(first.is_ok());
    assert!(matches!(second, Err(relay_bus::Error::PoolExhausted { .. })));

    bus.shutdown().await;
}

#[tokio::test]
async fn test_backlog_stays_bounded_under_slow_subscriber() {
    const QUEUE_BOUND: usize = 4;
    const MESSAGES: usize = 100;

    let backend = MemoryBackend::new();
    let a = start(
        &backend,
        config("node-a").with_dispatch(
            DispatchConfig::default()
                .with_concurrency(2)
                .with_max_concurrency(2)
                .with_queue_bound(QUEUE_BOUND),
        ),
    )
    .await;
    let b = start(&backend, config("node-b")).await;

    let done = Arc::new(AtomicUsize::new(0));
    let d = done.clone();
    a.subscribe(
        "load",
        handler_fn(move |_| {
            let d = d.clone();
            async move {
                sleep(Duration::from_millis(10)).await;
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    )
    .unwrap();
    wait_active(&a, direct("load")).await;

    let peak = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let a = a.clone();
        let peak = peak.clone();
        let done = done.clone();
        tokio::spawn(async move {
            while done.load(Ordering::SeqCst) < MESSAGES {
                peak.fetch_max(a.health().dispatch_backlog, Ordering::SeqCst);
                sleep(Duration::from_millis(1)).await;
            }
        })
    };

    for n in 0..MESSAGES {
        b.publish("load", json!({"n": n})).await.unwrap();
    }

    assert!(eventually(Duration::from_secs(10), || load(&done) == MESSAGES).await);
    sampler.await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= QUEUE_BOUND + 1);
    let health = a.health();
    assert_eq!(health.dispatch_concurrency, 2);
    assert!(a
        .metrics_text()
        .unwrap()
        .contains("relay_messages_dropped_total 0"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_counts_every_undelivered_message() {
    const EVENTS: usize = 8;

    let backend = MemoryBackend::new();
    let a = start(
        &backend,
        config("node-a").with_dispatch(
            DispatchConfig::default()
                .with_concurrency(1)
                .with_max_concurrency(1)
                .with_queue_bound(1),
        ),
    )
    .await;
    let b = start(&backend, config("node-b")).await;

    let (count, handler) = slow_counting(Duration::from_millis(200));
    a.subscribe_handler("backlog", handler).unwrap();
    wait_active(&a, direct("backlog")).await;

    for n in 0..EVENTS {
        b.publish("backlog", json!({"n": n})).await.unwrap();
    }
    assert!(eventually(Duration::from_secs(2), || a.health().dispatch_backlog >= 2).await);

    a.shutdown().await;

    // Messages still buffered on the subscription connection or held by the
    // subscriber loop are never dispatched, but none go uncounted.
    let dropped = metric(&a, "relay_messages_dropped_total") as usize;
    assert!(dropped >= 1);
    assert_eq!(load(&count) + dropped, EVENTS);

    b.shutdown().await;
}

#[tokio::test]
async fn test_no_delivery_after_unsubscribe() {
    let backend = MemoryBackend::new();
    let a = start(&backend, config("node-a")).await;
    let b = start(&backend, config("node-b")).await;

    let (count, handler) = counting();
    let id = a.subscribe_handler("note:*", handler).unwrap();
    wait_active(&a, pattern("note:")).await;

    b.publish("note:created", json!({})).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || load(&count) == 1).await);

    assert!(a.unsubscribe(id).await);
    assert!(!a.unsubscribe(id).await);
    assert_eq!(a.emit_local("note:created", json!({})).unwrap(), 0);
    for _ in 0..5 {
        b.publish("note:created", json!({})).await.unwrap();
    }
    sleep(Duration::from_millis(150)).await;

    assert_eq!(load(&count), 1);
    assert!(eventually(Duration::from_secs(2), || !a
        .active_subscriptions()
        .contains(&pattern("note:")))
    .await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_publisher_sees_own_event_once() {
    let backend = MemoryBackend::new();
    let a = start(&backend, config("node-a")).await;
    let b = start(&backend, config("node-b")).await;

    let (on_a, ha) = counting();
    let (on_b, hb) = counting();
    a.subscribe_handler("presence", ha).unwrap();
    b.subscribe_handler("presence", hb).unwrap();
    wait_active(&a, direct("presence")).await;
    wait_active(&b, direct("presence")).await;

    let receipt = a.publish("presence", json!({"online": true})).await.unwrap();
    assert_eq!(receipt.receivers, 2);
    assert_eq!(receipt.local_deliveries, 1);

    assert!(eventually(Duration::from_secs(2), || load(&on_b) == 1).await);
    assert!(
        eventually(Duration::from_secs(2), || a
            .metrics_text()
            .unwrap()
            .contains("relay_self_echo_suppressed_total 1"))
        .await
    );
    sleep(Duration::from_millis(50)).await;
    assert_eq!(load(&on_a), 1);
    assert_eq!(load(&on_b), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_self_echo_delivered_when_suppression_disabled() {
    let backend = MemoryBackend::new();
    let a = start(
        &backend,
        config("node-a").with_suppress_self_echo(false),
    )
    .await;

    let (count, handler) = counting();
    a.subscribe_handler("ping", handler).unwrap();
    wait_active(&a, direct("ping")).await;

    a.publish("ping", json!({})).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || load(&count) == 2).await);

    a.shutdown().await;
}

#[tokio::test]
async fn test_health_snapshot_and_metrics() {
    let backend = MemoryBackend::new();
    let a = start(&backend, config("node-a")).await;

    let (count, handler) = counting();
    a.subscribe_handler("metric:*", handler).unwrap();
    a.publish("metric:tick", json!({})).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || load(&count) == 1).await);

    let health = a.health();
    assert_eq!(health.state, BusState::Subscribed);
    assert_eq!(health.origin, "node-a");
    assert_eq!(health.backend, "memory://");
    assert_eq!(health.subscriptions, 1);
    assert_eq!(health.publish_latency.samples, 1);
    assert_eq!(health.reconnects, 0);
    assert!(health.silence_ms.is_some());
    assert!(health.is_healthy());

    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["state"], "subscribed");

    let text = a.metrics_text().unwrap();
    assert!(text.contains("relay_messages_published_total 1"));
    assert!(text.contains("relay_bus_state 2"));
    assert!(text.contains("relay_pool_connections"));
    assert!(text.contains("relay_publish_duration_seconds_count 1"));

    a.shutdown().await;
    assert_eq!(a.health().state, BusState::Disconnected);
    assert!(a.metrics_text().unwrap().contains("relay_bus_state 0"));
}
