//! The event bus handle.
//!
//! [`EventBus`] owns one of each component and wires them together. It is
//! explicitly constructed and cloned into whatever needs it; clones share the
//! same bus.
//!
//! ## Shutdown
//!
//! [`EventBus::shutdown`] runs once no matter how many callers (or the
//! subscriber loop, on reconnect exhaustion) ask for it:
//!
//! 1. refuse new publishes and subscriptions,
//! 2. stop the subscriber loop, which unsubscribes and closes its connection,
//! 3. drain the dispatcher and wait for loopback deliveries, bounded by
//!    `shutdown_timeout`,
//! 4. close the pool and deactivate every subscription,
//! 5. enter `Disconnected`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use relay_core::{logging::redact_url, BackendChannel, BusConfig, ChannelNamer, Error, Event, Result};

use crate::backend::memory::MemoryBackend;
use crate::backend::redis::RedisBackend;
use crate::backend::Backend;
use crate::backoff::Backoff;
use crate::dispatcher::{Deliverer, Dispatcher, DispatcherOptions};
use crate::handler::{ChannelHandler, EventHandler};
use crate::health::{HealthMonitor, HealthSnapshot, HealthSources, Liveness};
use crate::metrics::BusMetrics;
use crate::pool::{ConnectionPool, PoolStats};
use crate::publisher::{PublishReceipt, Publisher};
use crate::registry::{Registry, SubscriptionId};
use crate::state::{BusState, StateCell};
use crate::subscriber::{ActiveSet, LoopExit, SubscriberLoop};

struct BusInner {
    origin: String,
    shutdown_timeout: Duration,
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
    dispatcher: Arc<Dispatcher>,
    deliverer: Arc<Deliverer>,
    publisher: Publisher,
    state: Arc<StateCell>,
    active: Arc<ActiveSet>,
    health: Arc<HealthSources>,
    metrics: Arc<BusMetrics>,
    stop: watch::Sender<bool>,
    closing: AtomicBool,
    subscriber_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: OnceCell<()>,
}

/// Handle to a running event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Validate `config`, pick the backend from its URL, and start the bus.
    ///
    /// `memory://` creates a fresh in-process broker; anything else is a
    /// Redis URL. Connectivity problems do not fail construction: the bus
    /// starts `Connecting` and keeps retrying in the background.
    pub async fn connect(config: BusConfig) -> Result<Self> {
        config.validate()?;
        let backend: Arc<dyn Backend> = if config.is_memory_backend() {
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(RedisBackend::new(&config)?)
        };
        Self::with_backend(config, backend).await
    }

    /// Start the bus on an explicit backend.
    pub async fn with_backend(config: BusConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let namer = ChannelNamer::new(config.namespace.clone())?;
        let origin = config
            .origin_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        info!(
            subsystem = "bus",
            component = "bus",
            op = "start",
            backend = %redact_url(&config.backend_url),
            namespace = %namer.namespace(),
            origin = %origin,
            "Starting event bus"
        );

        let metrics = Arc::new(BusMetrics::new()?);
        let registry = Arc::new(Registry::new(namer.clone()));
        let state = Arc::new(StateCell::default());
        let liveness = Arc::new(Liveness::default());
        let active = Arc::new(ActiveSet::default());

        let pool = ConnectionPool::new(
            backend.clone(),
            config.pool.clone(),
            config.connect_timeout,
            config.command_timeout,
        );
        match pool.ensure_min_idle().await {
            Ok(opened) => debug!(
                subsystem = "bus",
                component = "pool",
                op = "min_idle",
                opened,
                "Warmed pool"
            ),
            Err(e) => warn!(
                subsystem = "bus",
                component = "pool",
                op = "min_idle",
                error = %e,
                "Could not warm pool, continuing"
            ),
        }

        let deliverer = Arc::new(Deliverer::new(
            config.dispatch.callback_timeout,
            metrics.clone(),
        ));
        let dispatcher = Dispatcher::start(
            &config.dispatch,
            DispatcherOptions {
                namer: namer.clone(),
                origin: origin.clone(),
                suppress_self_echo: config.suppress_self_echo,
            },
            registry.clone(),
            deliverer.clone(),
            metrics.clone(),
        );
        let publisher = Publisher::new(
            pool.clone(),
            registry.clone(),
            deliverer.clone(),
            metrics.clone(),
            namer.clone(),
            origin.clone(),
        );
        let health = Arc::new(HealthSources {
            origin: origin.clone(),
            backend: backend.describe(),
            state: state.clone(),
            liveness: liveness.clone(),
            pool: pool.clone(),
            dispatcher: dispatcher.clone(),
            metrics: metrics.clone(),
            registry: registry.clone(),
        });

        let (stop, _) = watch::channel(false);
        let inner = Arc::new(BusInner {
            origin: origin.clone(),
            shutdown_timeout: config.shutdown_timeout,
            registry: registry.clone(),
            pool: pool.clone(),
            dispatcher: dispatcher.clone(),
            deliverer,
            publisher,
            state: state.clone(),
            active: active.clone(),
            health: health.clone(),
            metrics: metrics.clone(),
            stop,
            closing: AtomicBool::new(false),
            subscriber_task: Mutex::new(None),
            health_task: Mutex::new(None),
            shutdown: OnceCell::new(),
        });

        let subscriber = SubscriberLoop {
            pool,
            registry,
            dispatcher,
            state,
            liveness,
            metrics,
            active,
            namer: namer.clone(),
            origin,
            backoff: Backoff::from(&config.backoff),
            max_attempts: config.backoff.max_attempts,
        };
        let weak = Arc::downgrade(&inner);
        let stop_rx = inner.stop.subscribe();
        let subscriber_task = tokio::spawn(async move {
            if subscriber.run(stop_rx).await == LoopExit::ReconnectExhausted {
                // Shutdown awaits this task, so it must run elsewhere.
                tokio::spawn(shutdown_from(weak));
            }
        });

        let monitor = HealthMonitor {
            sources: health,
            namer,
            config: config.health.clone(),
        };
        let health_task = tokio::spawn(monitor.run(inner.stop.subscribe()));

        *inner
            .subscriber_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(subscriber_task);
        *inner.health_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(health_task);

        Ok(Self { inner })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Register `handler` for events whose type matches `pattern` (an exact
    /// type, or a prefix ending in `*`).
    ///
    /// The backend subscription follows asynchronously; local publishes reach
    /// the handler immediately.
    pub fn subscribe(&self, pattern: &str, handler: impl EventHandler) -> Result<SubscriptionId> {
        self.subscribe_handler(pattern, Arc::new(handler))
    }

    pub fn subscribe_handler(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        self.ensure_open()?;
        self.inner.registry.subscribe(pattern, handler)
    }

    /// Subscribe with a bounded channel instead of a callback.
    pub fn subscribe_channel(
        &self,
        pattern: &str,
        capacity: usize,
    ) -> Result<(SubscriptionId, mpsc::Receiver<Arc<Event>>)> {
        let (handler, rx) = ChannelHandler::new(capacity);
        let id = self.subscribe(pattern, handler)?;
        Ok((id, rx))
    }

    /// Remove a subscription. After this returns its handler is never invoked
    /// again. Returns `false` for an unknown id.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.registry.unsubscribe(id).await
    }

    /// Publish to every process on the bus, this one included.
    pub async fn publish(&self, event_type: &str, data: Value) -> Result<PublishReceipt> {
        self.inner.publisher.publish(event_type, data).await
    }

    /// Deliver to this process's subscribers only.
    pub fn emit_local(&self, event_type: &str, data: Value) -> Result<usize> {
        self.inner.publisher.emit_local(event_type, data)
    }

    pub fn state(&self) -> BusState {
        self.inner.state.get()
    }

    pub fn state_changes(&self) -> watch::Receiver<BusState> {
        self.inner.state.subscribe()
    }

    /// Wait until the bus reaches `target`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, target: BusState, timeout: Duration) -> bool {
        self.inner.state.wait_for(target, timeout).await
    }

    pub async fn wait_until_subscribed(&self, timeout: Duration) -> bool {
        self.wait_for_state(BusState::Subscribed, timeout).await
    }

    pub fn health(&self) -> HealthSnapshot {
        self.inner.health.snapshot()
    }

    /// Prometheus text exposition of this bus's metrics.
    pub fn metrics_text(&self) -> Result<String> {
        self.inner.health.refresh_gauges();
        self.inner.metrics.encode()
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Backend channels subscribed on the live subscription connection.
    pub fn active_subscriptions(&self) -> BTreeSet<BackendChannel> {
        self.inner.active.snapshot()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Shut the bus down. Concurrent and repeated calls wait for the one
    /// shutdown to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

async fn shutdown_from(inner: Weak<BusInner>) {
    if let Some(inner) = inner.upgrade() {
        inner.shutdown().await;
    }
}

impl BusInner {
    async fn shutdown(&self) {
        self.shutdown
            .get_or_init(|| async {
                self.closing.store(true, Ordering::SeqCst);
                self.run_shutdown().await;
            })
            .await;
    }

    async fn run_shutdown(&self) {
        let start = Instant::now();
        let deadline = start + self.shutdown_timeout;
        info!(
            subsystem = "bus",
            component = "bus",
            op = "shutdown",
            origin = %self.origin,
            "Shutting down event bus"
        );

        self.publisher.close();

        self.stop.send_replace(true);
        let subscriber = self
            .subscriber_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = subscriber {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(
                    subsystem = "bus",
                    component = "bus",
                    op = "shutdown",
                    "Subscriber loop did not stop in time, aborting"
                );
                handle.abort();
            }
        }
        let health = self
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = health {
            handle.abort();
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let drained = self.dispatcher.drain(remaining).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let idle = self.deliverer.in_flight().wait_idle(remaining).await;
        if !(drained && idle) {
            error!(
                subsystem = "bus",
                component = "bus",
                op = "shutdown",
                in_flight = self.deliverer.in_flight().count(),
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Deliveries still running at shutdown deadline"
            );
        }

        self.pool.close();
        self.registry.clear();
        self.state.set(BusState::Disconnected);
        self.metrics.state.set(BusState::Disconnected.as_gauge());

        info!(
            subsystem = "bus",
            component = "bus",
            op = "shutdown",
            duration_ms = start.elapsed().as_millis() as u64,
            "Event bus stopped"
        );
    }
}
