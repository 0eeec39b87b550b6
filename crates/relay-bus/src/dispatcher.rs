//! Bounded-concurrency dispatcher.
//!
//! The subscriber loop hands raw messages to [`Dispatcher::submit`]. They
//! queue in a bounded channel; a coordinator task takes one whenever a
//! concurrency permit is free and spawns a task that decodes it and runs
//! every matching callback, each in its own task under a timeout. A full
//! queue makes `submit` wait, so the subscription is backpressured instead
//! of buffering without bound.
//!
//! The concurrency limit adapts between its initial value and the configured
//! maximum: it grows while backlog persists across two adaptation ticks and
//! shrinks back while the queue is empty.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use relay_core::{decode_event, ChannelClass, ChannelNamer, DispatchConfig, Error, Event, Result};

use crate::backend::RawMessage;
use crate::metrics::BusMetrics;
use crate::registry::{Registry, SubscriptionEntry};

/// Counts running callback invocations so shutdown can wait for them.
#[derive(Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self)
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no invocation is running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

/// Runs callbacks for one event, each in its own task.
///
/// Shared by network dispatch and local loopback.
pub struct Deliverer {
    callback_timeout: Duration,
    metrics: Arc<BusMetrics>,
    in_flight: InFlight,
}

impl Deliverer {
    pub fn new(callback_timeout: Duration, metrics: Arc<BusMetrics>) -> Self {
        Self {
            callback_timeout,
            metrics,
            in_flight: InFlight::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    async fn invoke(&self, entry: Arc<SubscriptionEntry>, event: Arc<Event>) {
        let id = entry.id();
        let call = AssertUnwindSafe(entry.invoke(event.clone())).catch_unwind();
        let outcome = match tokio::time::timeout(self.callback_timeout, call).await {
            Ok(Ok(None)) => return,
            Ok(Ok(Some(Ok(())))) => "ok",
            Ok(Ok(Some(Err(e)))) => {
                warn!(
                    subsystem = "bus",
                    component = "dispatcher",
                    op = "deliver",
                    subscription_id = %id,
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    error = %e,
                    "Subscriber callback failed"
                );
                "error"
            }
            Ok(Err(_)) => {
                error!(
                    subsystem = "bus",
                    component = "dispatcher",
                    op = "deliver",
                    subscription_id = %id,
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    "Subscriber callback panicked"
                );
                "panic"
            }
            Err(_) => {
                warn!(
                    subsystem = "bus",
                    component = "dispatcher",
                    op = "deliver",
                    subscription_id = %id,
                    event_type = %event.event_type,
                    timeout_ms = self.callback_timeout.as_millis() as u64,
                    "Subscriber callback timed out"
                );
                "timeout"
            }
        };
        self.metrics.callback(outcome);
        if outcome != "timeout" {
            self.metrics
                .observe_delivery(Duration::from_millis(event.age_ms()));
        }
    }

    /// Spawn one task per entry and wait for all of them.
    pub async fn deliver(self: &Arc<Self>, entries: Vec<Arc<SubscriptionEntry>>, event: Arc<Event>) {
        let mut tasks = JoinSet::new();
        for entry in entries {
            let this = self.clone();
            let event = event.clone();
            tasks.spawn(async move {
                let _guard = this.in_flight.enter();
                this.invoke(entry, event).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = ?e, "Callback task failed");
            }
        }
    }

    /// Spawn one task per entry without waiting. Returns the number spawned.
    pub fn deliver_detached(
        self: &Arc<Self>,
        entries: Vec<Arc<SubscriptionEntry>>,
        event: Arc<Event>,
    ) -> usize {
        let n = entries.len();
        for entry in entries {
            let this = self.clone();
            let event = event.clone();
            self.in_flight.count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _guard = InFlightGuard(&this.in_flight);
                this.invoke(entry, event).await
            });
        }
        n
    }
}

/// Semaphore whose permit count moves between a floor and a ceiling.
pub struct AdaptiveLimiter {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    floor: usize,
    ceiling: usize,
    up_step: usize,
    down_step: usize,
    backlogged: AtomicBool,
}

impl AdaptiveLimiter {
    pub fn new(config: &DispatchConfig) -> Self {
        let floor = config.concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(floor)),
            limit: AtomicUsize::new(floor),
            floor,
            ceiling: config.max_concurrency.max(floor),
            up_step: config.scale_up_step,
            down_step: config.scale_down_step,
            backlogged: AtomicBool::new(false),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Adjust the limit for the observed backlog. Returns the new limit when
    /// it changed.
    pub fn adapt(&self, backlog: usize) -> Option<usize> {
        let was_backlogged = self.backlogged.swap(backlog > 0, Ordering::SeqCst);
        let limit = self.limit();

        if backlog > 0 && was_backlogged && limit < self.ceiling {
            let add = self.up_step.max(1).min(self.ceiling - limit);
            self.semaphore.add_permits(add);
            self.limit.store(limit + add, Ordering::SeqCst);
            return Some(limit + add);
        }

        if backlog == 0 && limit > self.floor {
            let remove = self.down_step.max(1).min(limit - self.floor);
            if let Ok(permits) = self.semaphore.try_acquire_many(remove as u32) {
                permits.forget();
                self.limit.store(limit - remove, Ordering::SeqCst);
                return Some(limit - remove);
            }
        }
        None
    }
}

struct Shared {
    namer: ChannelNamer,
    origin: String,
    suppress_self_echo: bool,
    registry: Arc<Registry>,
    deliverer: Arc<Deliverer>,
    metrics: Arc<BusMetrics>,
    limiter: AdaptiveLimiter,
    /// Messages in the channel.
    queued: AtomicUsize,
    /// Message taken from the channel, waiting for a permit.
    holding: AtomicBool,
    /// Messages being processed.
    running: AtomicUsize,
}

impl Shared {
    fn backlog(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + usize::from(self.holding.load(Ordering::SeqCst))
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Shared {
    async fn process(&self, msg: RawMessage) {
        let event_type = match self.namer.parse(&msg.channel) {
            Ok((ChannelClass::Direct, event_type)) => event_type,
            Ok((ChannelClass::Control, _)) => return,
            Err(e) => {
                self.metrics.decode_errors.inc();
                warn!(
                    subsystem = "bus",
                    component = "dispatcher",
                    op = "decode",
                    channel = %msg.channel,
                    error = %e,
                    "Dropping message on unrecognized channel"
                );
                return;
            }
        };

        let event = match decode_event(event_type, &msg.payload) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.decode_errors.inc();
                warn!(
                    subsystem = "bus",
                    component = "dispatcher",
                    op = "decode",
                    channel = %msg.channel,
                    payload_bytes = msg.payload.len(),
                    error = %e,
                    "Dropping undecodable message"
                );
                return;
            }
        };

        if self.suppress_self_echo && event.origin == self.origin {
            self.metrics.self_echo_suppressed.inc();
            trace!(event_id = %event.event_id, "Skipping own event already delivered locally");
            return;
        }

        let entries = self
            .registry
            .matching_backend(&msg.delivered_by(), &event.event_type);
        trace!(
            subsystem = "bus",
            component = "dispatcher",
            op = "dispatch",
            event_type = %event.event_type,
            event_id = %event.event_id,
            callbacks = entries.len(),
            "Dispatching event"
        );
        if !entries.is_empty() {
            self.deliverer.deliver(entries, Arc::new(event)).await;
        }
    }
}

/// Dispatcher configuration beyond [`DispatchConfig`].
pub struct DispatcherOptions {
    pub namer: ChannelNamer,
    pub origin: String,
    pub suppress_self_echo: bool,
}

/// Decodes received messages and runs callbacks with bounded concurrency.
pub struct Dispatcher {
    shared: Arc<Shared>,
    tx: Mutex<Option<mpsc::Sender<RawMessage>>>,
    queue_bound: usize,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create the dispatcher and start its coordinator task.
    pub fn start(
        config: &DispatchConfig,
        options: DispatcherOptions,
        registry: Arc<Registry>,
        deliverer: Arc<Deliverer>,
        metrics: Arc<BusMetrics>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_bound.max(1));
        let shared = Arc::new(Shared {
            namer: options.namer,
            origin: options.origin,
            suppress_self_echo: options.suppress_self_echo,
            registry,
            deliverer,
            metrics,
            limiter: AdaptiveLimiter::new(config),
            queued: AtomicUsize::new(0),
            holding: AtomicBool::new(false),
            running: AtomicUsize::new(0),
        });
        shared
            .metrics
            .dispatch_concurrency
            .set(shared.limiter.limit() as i64);

        let dispatcher = Arc::new(Self {
            shared: shared.clone(),
            tx: Mutex::new(Some(tx.clone())),
            queue_bound: config.queue_bound.max(1),
            coordinator: Mutex::new(None),
        });
        let handle = tokio::spawn(coordinate(shared, rx, config.adapt_interval));
        *dispatcher
            .coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        dispatcher
    }

    fn sender(&self) -> Option<mpsc::Sender<RawMessage>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Queue a message. Waits while the queue is full.
    pub async fn submit(&self, msg: RawMessage) -> Result<()> {
        let tx = self.sender().ok_or(Error::ShuttingDown)?;
        let slot = tx.reserve().await.map_err(|_| Error::ShuttingDown)?;
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        slot.send(msg);
        Ok(())
    }

    /// Messages received but not yet dispatched: queued plus the one held by
    /// the coordinator while it waits for a permit.
    pub fn backlog(&self) -> usize {
        self.shared.backlog()
    }

    pub fn queue_bound(&self) -> usize {
        self.queue_bound
    }

    pub fn concurrency_limit(&self) -> usize {
        self.shared.limiter.limit()
    }

    /// Stop accepting messages, dispatch what is queued, and wait for running
    /// callbacks. Returns `false` if the wait hit `timeout`; messages still
    /// queued or being processed then are abandoned and counted as dropped.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let queued = self.backlog();
        drop(self.tx.lock().unwrap_or_else(|e| e.into_inner()).take());

        let handle = self
            .coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut handle) = handle else {
            return true;
        };
        info!(
            subsystem = "bus",
            component = "dispatcher",
            op = "drain",
            backlog = queued,
            "Draining dispatcher"
        );
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                let abandoned =
                    self.shared.backlog() + self.shared.running.load(Ordering::SeqCst);
                self.shared.metrics.dropped.inc_by(abandoned as u64);
                handle.abort();
                warn!(
                    subsystem = "bus",
                    component = "dispatcher",
                    op = "drain",
                    timeout_ms = timeout.as_millis() as u64,
                    dropped = abandoned,
                    "Dispatcher drain timed out"
                );
                false
            }
        }
    }
}

#[instrument(skip_all, fields(subsystem = "bus", component = "dispatcher"))]
async fn coordinate(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<RawMessage>,
    adapt_interval: Duration,
) {
    let mut ticker = interval(adapt_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut next: Option<RawMessage> = None;

    debug!(
        concurrency = shared.limiter.limit(),
        "Dispatcher coordinator started"
    );

    loop {
        tokio::select! {
            biased;

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        error!(error = ?e, "Dispatch task failed");
                    }
                }
            }

            permit = shared.limiter.acquire(), if next.is_some() => {
                let Ok(permit) = permit else { break };
                if let Some(msg) = next.take() {
                    shared.running.fetch_add(1, Ordering::SeqCst);
                    shared.holding.store(false, Ordering::SeqCst);
                    let s = shared.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let _running = RunningGuard(&s.running);
                        s.process(msg).await;
                    });
                }
            }

            msg = rx.recv(), if next.is_none() => {
                match msg {
                    Some(msg) => {
                        next = Some(msg);
                        shared.queued.fetch_sub(1, Ordering::SeqCst);
                        shared.holding.store(true, Ordering::SeqCst);
                    }
                    None => break,
                }
            }

            _ = ticker.tick() => {
                let backlog = shared.backlog();
                shared.metrics.dispatch_backlog.set(backlog as i64);
                if let Some(limit) = shared.limiter.adapt(backlog) {
                    shared.metrics.dispatch_concurrency.set(limit as i64);
                    info!(backlog, concurrency = limit, "Adjusted dispatch concurrency");
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = ?e, "Dispatch task failed");
        }
    }
    debug!("Dispatcher coordinator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, HandlerError};
    use relay_core::encode_event;
    use serde_json::json;

    struct Fixture {
        registry: Arc<Registry>,
        deliverer: Arc<Deliverer>,
        metrics: Arc<BusMetrics>,
        namer: ChannelNamer,
    }

    fn fixture(callback_timeout: Duration) -> Fixture {
        let namer = ChannelNamer::new("event").unwrap();
        let metrics = Arc::new(BusMetrics::new().unwrap());
        Fixture {
            registry: Arc::new(Registry::new(namer.clone())),
            deliverer: Arc::new(Deliverer::new(callback_timeout, metrics.clone())),
            metrics,
            namer,
        }
    }

    fn start(f: &Fixture, config: &DispatchConfig, suppress: bool) -> Arc<Dispatcher> {
        Dispatcher::start(
            config,
            DispatcherOptions {
                namer: f.namer.clone(),
                origin: "self".into(),
                suppress_self_echo: suppress,
            },
            f.registry.clone(),
            f.deliverer.clone(),
            f.metrics.clone(),
        )
    }

    fn raw(namer: &ChannelNamer, event_type: &str, origin: &str) -> RawMessage {
        let event = Event::new(event_type, json!({"k": event_type}), origin);
        RawMessage::new(namer.direct(event_type), None, encode_event(&event).unwrap())
    }

    fn counting(count: &Arc<AtomicUsize>) -> Arc<dyn crate::handler::EventHandler> {
        let c = count.clone();
        Arc::new(handler_fn(move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    }

    #[test]
    fn test_limiter_grows_on_sustained_backlog_and_shrinks_when_idle() {
        let config = DispatchConfig::default()
            .with_concurrency(4)
            .with_max_concurrency(25);
        let limiter = AdaptiveLimiter::new(&config);

        assert_eq!(limiter.adapt(10), None);
        assert_eq!(limiter.adapt(10), Some(14));
        assert_eq!(limiter.adapt(10), Some(24));
        assert_eq!(limiter.adapt(10), Some(25));
        assert_eq!(limiter.adapt(10), None);

        assert_eq!(limiter.adapt(0), Some(20));
        assert_eq!(limiter.adapt(0), Some(15));
        for _ in 0..10 {
            limiter.adapt(0);
        }
        assert_eq!(limiter.limit(), 4);
    }

    #[test]
    fn test_limiter_does_not_shrink_below_busy_permits() {
        let config = DispatchConfig::default()
            .with_concurrency(1)
            .with_max_concurrency(11);
        let limiter = AdaptiveLimiter::new(&config);
        limiter.adapt(1);
        assert_eq!(limiter.adapt(1), Some(11));
        let _held: Vec<_> = (0..11)
            .map(|_| limiter.semaphore.clone().try_acquire_owned().unwrap())
            .collect();
        assert_eq!(limiter.adapt(0), None);
        assert_eq!(limiter.limit(), 11);
    }

    #[tokio::test]
    async fn test_dispatches_to_matching_entries() {
        let f = fixture(Duration::from_secs(1));
        let count = Arc::new(AtomicUsize::new(0));
        f.registry.subscribe("room:1", counting(&count)).unwrap();
        f.registry.subscribe("chat:*", counting(&count)).unwrap();

        let d = start(&f, &DispatchConfig::default().with_concurrency(2), true);
        d.submit(raw(&f.namer, "room:1", "peer")).await.unwrap();
        d.submit(raw(&f.namer, "room:2", "peer")).await.unwrap();
        assert!(d.drain(Duration::from_secs(1)).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(f.metrics.callback_count("ok"), 1);
        // One sample per completed callback; the unmatched event adds none.
        assert_eq!(f.metrics.delivery_window.summary().samples, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_counted_not_fatal() {
        let f = fixture(Duration::from_secs(1));
        let count = Arc::new(AtomicUsize::new(0));
        f.registry.subscribe("t", counting(&count)).unwrap();

        let d = start(&f, &DispatchConfig::default().with_concurrency(1), true);
        d.submit(RawMessage::new(f.namer.direct("t"), None, b"{oops".to_vec()))
            .await
            .unwrap();
        d.submit(RawMessage::new("foreign:x", None, vec![]))
            .await
            .unwrap();
        d.submit(raw(&f.namer, "t", "peer")).await.unwrap();
        assert!(d.drain(Duration::from_secs(1)).await);

        assert_eq!(f.metrics.decode_errors.get(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_own_events_suppressed_when_enabled() {
        let f = fixture(Duration::from_secs(1));
        let count = Arc::new(AtomicUsize::new(0));
        f.registry.subscribe("t", counting(&count)).unwrap();

        let d = start(&f, &DispatchConfig::default(), true);
        d.submit(raw(&f.namer, "t", "self")).await.unwrap();
        assert!(d.drain(Duration::from_secs(1)).await);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(f.metrics.self_echo_suppressed.get(), 1);

        let f = fixture(Duration::from_secs(1));
        f.registry.subscribe("t", counting(&count)).unwrap();
        let d = start(&f, &DispatchConfig::default(), false);
        d.submit(raw(&f.namer, "t", "self")).await.unwrap();
        assert!(d.drain(Duration::from_secs(1)).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_panicking_and_slow_callbacks_are_isolated() {
        let f = fixture(Duration::from_millis(50));
        let count = Arc::new(AtomicUsize::new(0));
        f.registry
            .subscribe("t", Arc::new(handler_fn(|_| async { Err(HandlerError::from("nope")) })))
            .unwrap();
        f.registry
            .subscribe(
                "t",
                Arc::new(handler_fn(|event| async move {
                    if event.data.is_object() {
                        panic!("callback bug");
                    }
                    Ok(())
                })),
            )
            .unwrap();
        f.registry
            .subscribe(
                "t",
                Arc::new(handler_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })),
            )
            .unwrap();
        f.registry.subscribe("t", counting(&count)).unwrap();

        let d = start(&f, &DispatchConfig::default().with_concurrency(1), true);
        d.submit(raw(&f.namer, "t", "peer")).await.unwrap();
        d.submit(raw(&f.namer, "t", "peer")).await.unwrap();
        assert!(d.drain(Duration::from_secs(2)).await);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(f.metrics.callback_count("error"), 2);
        assert_eq!(f.metrics.callback_count("panic"), 2);
        assert_eq!(f.metrics.callback_count("timeout"), 2);
        assert_eq!(f.metrics.callback_count("ok"), 2);
    }

    #[tokio::test]
    async fn test_single_worker_preserves_receipt_order() {
        let f = fixture(Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        f.registry
            .subscribe(
                "seq:*",
                Arc::new(handler_fn(move |event| {
                    let s = s.clone();
                    async move {
                        s.lock().unwrap().push(event.event_type.clone());
                        Ok(())
                    }
                })),
            )
            .unwrap();

        let d = start(&f, &DispatchConfig::default().with_concurrency(1).with_max_concurrency(1), true);
        let expected: Vec<String> = (0..20).map(|i| format!("seq:{i}")).collect();
        for t in &expected {
            let event = Event::new(t.as_str(), json!({}), "peer");
            d.submit(RawMessage::new(
                f.namer.direct(t),
                Some("event:d:seq:*".into()),
                encode_event(&event).unwrap(),
            ))
            .await
            .unwrap();
        }
        assert!(d.drain(Duration::from_secs(1)).await);
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_drain_timeout_counts_abandoned_messages() {
        let f = fixture(Duration::from_secs(10));
        f.registry
            .subscribe(
                "t",
                Arc::new(handler_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })),
            )
            .unwrap();

        let d = start(
            &f,
            &DispatchConfig::default()
                .with_concurrency(1)
                .with_max_concurrency(1)
                .with_queue_bound(8),
            true,
        );
        for _ in 0..3 {
            d.submit(raw(&f.namer, "t", "peer")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(d.backlog(), 2);

        assert!(!d.drain(Duration::from_millis(50)).await);
        // One running, one waiting for a permit, one still queued.
        assert_eq!(f.metrics.dropped.get(), 3);
        assert_eq!(f.metrics.callback_count("ok"), 0);
    }

    #[tokio::test]
    async fn test_submit_after_drain_fails() {
        let f = fixture(Duration::from_secs(1));
        let d = start(&f, &DispatchConfig::default(), true);
        assert!(d.drain(Duration::from_secs(1)).await);
        assert!(matches!(
            d.submit(raw(&f.namer, "t", "peer")).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_deliver_detached_tracked_in_flight() {
        let f = fixture(Duration::from_secs(1));
        f.registry
            .subscribe(
                "t",
                Arc::new(handler_fn(|_| async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })),
            )
            .unwrap();
        let entries = f.registry.matching("t");
        let n = f
            .deliverer
            .deliver_detached(entries, Arc::new(Event::new("t", json!({}), "o")));
        assert_eq!(n, 1);
        assert!(f.deliverer.in_flight().wait_idle(Duration::from_secs(1)).await);
        assert_eq!(f.metrics.callback_count("ok"), 1);
    }
}
