//! In-process pub/sub backend (`memory://`).
//!
//! A broker shared by every connection created from one [`MemoryBackend`]
//! (clones share the broker, so two buses built on clones behave like two
//! processes on one Redis). Used for single-node deployments without Redis
//! and for tests, which is why it carries fault injection:
//!
//! - [`MemoryBackend::set_available`]: refuse connections and commands, and
//!   drop every subscription connection (server down).
//! - [`MemoryBackend::disconnect_subscribers`]: drop subscription connections
//!   only (network blip).
//! - [`MemoryBackend::stall_subscribers`]: keep subscription connections open
//!   but stop delivering to them (half-open connection).
//! - [`MemoryBackend::restart`]: reset every open connection while staying
//!   reachable (server restart); old command connections fail their next
//!   command.
//! - [`MemoryBackend::set_publish_delay`]: add latency to every `PUBLISH`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use relay_core::{defaults, BackendChannel, Error, Result};

use super::{Backend, BackendConnection, RawMessage, SubscriptionConnection};

/// Messages buffered per subscription connection before the broker drops it,
/// like a server closing a client over its output buffer limit.
const SUBSCRIBER_BUFFER: usize = 4_096;

struct Slot {
    subscriptions: BTreeSet<BackendChannel>,
    tx: mpsc::Sender<RawMessage>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    slots: HashMap<u64, Slot>,
}

#[derive(Default)]
struct Broker {
    state: Mutex<BrokerState>,
    unavailable: AtomicBool,
    stalled: AtomicBool,
    epoch: AtomicU64,
    publish_delay_ms: AtomicU64,
    connections_opened: AtomicU64,
    subscribers_opened: AtomicU64,
}

impl Broker {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Connection("memory backend unavailable".into()));
        }
        Ok(())
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> i64 {
        let stalled = self.stalled.load(Ordering::SeqCst);
        let mut state = self.state();
        let mut receivers = 0;
        let mut overflowed = Vec::new();

        for (id, slot) in state.slots.iter() {
            for sub in slot.subscriptions.iter() {
                let pattern = match sub {
                    BackendChannel::Channel(c) if c == channel => None,
                    BackendChannel::Pattern(p) if glob_matches(p, channel) => Some(p.clone()),
                    _ => continue,
                };
                receivers += 1;
                if stalled {
                    continue;
                }
                let msg = RawMessage::new(channel, pattern, payload.to_vec());
                if slot.tx.try_send(msg).is_err() {
                    overflowed.push(*id);
                    break;
                }
            }
        }

        for id in overflowed {
            state.slots.remove(&id);
            debug!(subscriber = id, "Dropped memory subscriber over buffer limit");
        }
        receivers
    }
}

/// Redis-style glob restricted to what channel naming produces: an optional
/// trailing `*`.
fn glob_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

/// In-process backend. Cloning shares the broker.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    broker: Arc<Broker>,
}

impl MemoryBackend {
    /// Create a backend with a fresh, empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the server going down (`false`) or coming back (`true`).
    ///
    /// Going down drops every subscription connection.
    pub fn set_available(&self, available: bool) {
        self.broker.unavailable.store(!available, Ordering::SeqCst);
        if !available {
            self.disconnect_subscribers();
        }
    }

    /// Drop every subscription connection; their streams end.
    pub fn disconnect_subscribers(&self) {
        let dropped = {
            let mut state = self.broker.state();
            let n = state.slots.len();
            state.slots.clear();
            n
        };
        debug!(dropped, "Disconnected memory subscribers");
    }

    /// Stop (`true`) or resume (`false`) delivery to subscription connections
    /// without closing them.
    pub fn stall_subscribers(&self, stalled: bool) {
        self.broker.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Reset every open connection, as a server restart does. New
    /// connections work; command connections opened before fail.
    pub fn restart(&self) {
        let epoch = self.broker.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.disconnect_subscribers();
        debug!(epoch, "Restarted memory backend");
    }

    /// Delay added to every `PUBLISH`.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.broker
            .publish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Command connections opened so far.
    pub fn connections_opened(&self) -> u64 {
        self.broker.connections_opened.load(Ordering::SeqCst)
    }

    /// Subscription connections opened so far.
    pub fn subscribers_opened(&self) -> u64 {
        self.broker.subscribers_opened.load(Ordering::SeqCst)
    }

    /// Open subscription connections.
    pub fn subscriber_count(&self) -> usize {
        self.broker.state().slots.len()
    }

    /// Union of every live subscription, across all subscription connections.
    pub fn subscriptions(&self) -> BTreeSet<BackendChannel> {
        self.broker
            .state()
            .slots
            .values()
            .flat_map(|s| s.subscriptions.iter().cloned())
            .collect()
    }

    /// Subscription connections holding `channel`.
    pub fn subscription_count(&self, channel: &BackendChannel) -> usize {
        self.broker
            .state()
            .slots
            .values()
            .filter(|s| s.subscriptions.contains(channel))
            .count()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>> {
        self.broker.check_available()?;
        self.broker.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            broker: self.broker.clone(),
            epoch: self.broker.epoch.load(Ordering::SeqCst),
        }))
    }

    async fn connect_subscriber(&self) -> Result<Box<dyn SubscriptionConnection>> {
        self.broker.check_available()?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = {
            let mut state = self.broker.state();
            state.next_id += 1;
            let id = state.next_id;
            state.slots.insert(
                id,
                Slot {
                    subscriptions: BTreeSet::new(),
                    tx,
                },
            );
            id
        };
        self.broker.subscribers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            id,
            rx,
        }))
    }

    fn describe(&self) -> String {
        defaults::MEMORY_BACKEND_URL.to_string()
    }
}

struct MemoryConnection {
    broker: Arc<Broker>,
    epoch: u64,
}

impl MemoryConnection {
    fn check(&self) -> Result<()> {
        self.broker.check_available()?;
        if self.broker.epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(Error::Connection("connection reset by server restart".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn publish(&mut self, channel: &str, payload: Vec<u8>) -> Result<i64> {
        self.check()?;
        let delay = self.broker.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.check()?;
        }
        let receivers = self.broker.publish(channel, &payload);
        trace!(channel, receivers, "Memory publish");
        Ok(receivers)
    }

    async fn ping(&mut self) -> Result<()> {
        self.check()
    }
}

struct MemorySubscription {
    broker: Arc<Broker>,
    id: u64,
    rx: mpsc::Receiver<RawMessage>,
}

impl MemorySubscription {
    fn update(&self, f: impl FnOnce(&mut BTreeSet<BackendChannel>)) -> Result<()> {
        self.broker.check_available()?;
        let mut state = self.broker.state();
        let slot = state
            .slots
            .get_mut(&self.id)
            .ok_or_else(|| Error::Connection("subscription connection dropped".into()))?;
        f(&mut slot.subscriptions);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionConnection for MemorySubscription {
    async fn subscribe(&mut self, channel: &BackendChannel) -> Result<()> {
        self.update(|subs| {
            subs.insert(channel.clone());
        })
    }

    async fn unsubscribe(&mut self, channel: &BackendChannel) -> Result<()> {
        self.update(|subs| {
            subs.remove(channel);
        })
    }

    async fn next_message(&mut self) -> Result<Option<RawMessage>> {
        Ok(self.rx.recv().await)
    }

    fn take_buffered(&mut self) -> Vec<RawMessage> {
        let mut buffered = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            buffered.push(msg);
        }
        buffered
    }

    async fn close(&mut self) {
        self.broker.state().slots.remove(&self.id);
        self.rx.close();
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.broker.state().slots.remove(&self.id);
    }
}
