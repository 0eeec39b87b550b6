//! Subscriber loop: the state machine owning the subscription connection.
//!
//! ```text
//! Disconnected ─► Connecting ─► Subscribed ─► Degraded ─(backoff)─► Connecting …
//! ```
//!
//! On every entry to `Connecting` the loop opens a fresh dedicated connection
//! and subscribes the control channel plus every backend channel the registry
//! holds at that moment, so a reconnect restores exactly the current
//! subscription set. While `Subscribed` it forwards registry changes as
//! `SUBSCRIBE`/`UNSUBSCRIBE` diffs and hands every received message to the
//! dispatcher without decoding it. Heartbeat echoes on the control channel
//! are consumed here.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

use relay_core::{decode_event, BackendChannel, ChannelClass, ChannelNamer, Result};

use crate::backend::RawMessage;
use crate::backoff::Backoff;
use crate::dispatcher::Dispatcher;
use crate::health::Liveness;
use crate::metrics::BusMetrics;
use crate::pool::{ConnectionPool, DedicatedConnection};
use crate::registry::Registry;
use crate::state::{BusState, StateCell};

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Shutdown was requested.
    Shutdown,
    /// Reconnect attempts exceeded the configured maximum.
    ReconnectExhausted,
}

enum Receive {
    Shutdown,
    Degraded(String),
}

/// Backend channels currently subscribed on the live connection.
#[derive(Default)]
pub struct ActiveSet {
    channels: Mutex<BTreeSet<BackendChannel>>,
}

impl ActiveSet {
    pub fn snapshot(&self) -> BTreeSet<BackendChannel> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace(&self, channels: BTreeSet<BackendChannel>) {
        *self.channels.lock().unwrap_or_else(|e| e.into_inner()) = channels;
    }

    fn insert(&self, channel: BackendChannel) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel);
    }

    fn remove(&self, channel: &BackendChannel) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel);
    }
}

/// The subscriber loop and its collaborators.
pub struct SubscriberLoop {
    pub pool: Arc<ConnectionPool>,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub state: Arc<StateCell>,
    pub liveness: Arc<Liveness>,
    pub metrics: Arc<BusMetrics>,
    pub active: Arc<ActiveSet>,
    pub namer: ChannelNamer,
    pub origin: String,
    pub backoff: Backoff,
    pub max_attempts: Option<u32>,
}

impl SubscriberLoop {
    fn control_channel(&self) -> BackendChannel {
        BackendChannel::Channel(self.namer.health(&self.origin))
    }

    /// Run until shutdown or reconnect exhaustion.
    #[instrument(skip_all, fields(subsystem = "bus", component = "subscriber", origin = %self.origin))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> LoopExit {
        let mut generation = self.registry.watch();
        let mut degrade = self.liveness.degrade_signal();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return LoopExit::Shutdown;
            }

            self.state.set(BusState::Connecting);
            self.metrics.state.set(BusState::Connecting.as_gauge());

            let connected = tokio::select! {
                result = self.connect(&mut generation) => result,
                _ = shutdown.changed() => return LoopExit::Shutdown,
            };

            match connected {
                Ok(conn) => {
                    attempt = 0;
                    degrade.borrow_and_update();
                    self.liveness.touch();
                    self.state.set(BusState::Subscribed);
                    self.metrics.state.set(BusState::Subscribed.as_gauge());

                    match self
                        .receive(conn, &mut shutdown, &mut generation, &mut degrade)
                        .await
                    {
                        Receive::Shutdown => return LoopExit::Shutdown,
                        Receive::Degraded(reason) => {
                            warn!(op = "receive", error = %reason, "Subscription connection degraded");
                        }
                    }
                }
                Err(e) => {
                    warn!(op = "connect", attempt, error = %e, "Subscription connect failed");
                }
            }

            self.active.replace(BTreeSet::new());
            self.liveness.clear();
            self.state.set(BusState::Degraded);
            self.metrics.state.set(BusState::Degraded.as_gauge());

            if let Some(max) = self.max_attempts {
                if attempt >= max {
                    error!(
                        op = "reconnect",
                        attempt,
                        max_attempts = max,
                        "Reconnect attempts exhausted, shutting the bus down"
                    );
                    return LoopExit::ReconnectExhausted;
                }
            }

            let delay = self.backoff.next(attempt);
            attempt = attempt.saturating_add(1);
            self.metrics.reconnects.inc();
            self.liveness.count_reconnect();
            info!(
                op = "reconnect",
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return LoopExit::Shutdown,
            }
        }
    }

    async fn connect(&self, generation: &mut watch::Receiver<u64>) -> Result<DedicatedConnection> {
        let mut conn = self.pool.dedicated().await?;
        conn.subscribe(&self.control_channel()).await?;

        generation.borrow_and_update();
        let desired = self.registry.backend_channels();
        for channel in &desired {
            conn.subscribe(channel).await?;
        }
        debug!(
            op = "connect",
            channels = desired.len(),
            "Subscribed registry channels"
        );
        self.active.replace(desired);
        Ok(conn)
    }

    /// Bring the live subscriptions in line with the registry.
    async fn sync(&self, conn: &mut DedicatedConnection) -> Result<()> {
        let desired = self.registry.backend_channels();
        let active = self.active.snapshot();

        for channel in desired.difference(&active) {
            conn.subscribe(channel).await?;
            self.active.insert(channel.clone());
            debug!(op = "sync", channel = %channel, "Subscribed");
        }
        for channel in active.difference(&desired) {
            conn.unsubscribe(channel).await?;
            self.active.remove(channel);
            debug!(op = "sync", channel = %channel, "Unsubscribed");
        }
        Ok(())
    }

    async fn receive(
        &self,
        mut conn: DedicatedConnection,
        shutdown: &mut watch::Receiver<bool>,
        generation: &mut watch::Receiver<u64>,
        degrade: &mut watch::Receiver<u64>,
    ) -> Receive {
        if generation.has_changed().unwrap_or(false) {
            generation.borrow_and_update();
            if let Err(e) = self.sync(&mut conn).await {
                self.abandon(conn).await;
                return Receive::Degraded(e.to_string());
            }
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    self.unsubscribe_all(&mut conn).await;
                    self.abandon(conn).await;
                    return Receive::Shutdown;
                }

                changed = degrade.changed() => {
                    self.abandon(conn).await;
                    if changed.is_err() {
                        return Receive::Shutdown;
                    }
                    return Receive::Degraded("forced by health monitor".into());
                }

                changed = generation.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    generation.borrow_and_update();
                    if let Err(e) = self.sync(&mut conn).await {
                        self.abandon(conn).await;
                        return Receive::Degraded(e.to_string());
                    }
                }

                msg = conn.next_message() => {
                    match msg {
                        Ok(Some(raw)) => {
                            self.liveness.touch();
                            self.metrics.received.inc();
                            if let Some(exit) = self.handle(raw, shutdown).await {
                                self.unsubscribe_all(&mut conn).await;
                                self.abandon(conn).await;
                                return exit;
                            }
                        }
                        Ok(None) => {
                            self.abandon(conn).await;
                            return Receive::Degraded("subscription stream ended".into());
                        }
                        Err(e) => {
                            self.abandon(conn).await;
                            return Receive::Degraded(e.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Route one message. Returns `Some` when shutdown arrived while waiting
    /// on a full dispatcher queue.
    async fn handle(&self, raw: RawMessage, shutdown: &mut watch::Receiver<bool>) -> Option<Receive> {
        if let Ok((ChannelClass::Control, suffix)) = self.namer.parse(&raw.channel) {
            match decode_event(suffix, &raw.payload) {
                Ok(beat) if beat.origin == self.origin => {
                    let latency_ms = beat.age_ms();
                    self.liveness.record_echo(latency_ms);
                    trace!(op = "heartbeat", duration_ms = latency_ms, "Heartbeat echo");
                }
                Ok(_) => {}
                Err(e) => {
                    self.metrics.decode_errors.inc();
                    debug!(op = "heartbeat", error = %e, "Undecodable heartbeat");
                }
            }
            return None;
        }

        self.liveness.begin_dispatch_wait();
        let exit = tokio::select! {
            submitted = self.dispatcher.submit(raw) => {
                if submitted.is_err() {
                    self.metrics.dropped.inc();
                }
                None
            }
            _ = shutdown.changed() => {
                self.metrics.dropped.inc();
                Some(Receive::Shutdown)
            }
        };
        self.liveness.end_dispatch_wait();
        exit
    }

    /// Close a connection, counting events it had buffered but not yet
    /// handed to the dispatcher as dropped.
    async fn abandon(&self, mut conn: DedicatedConnection) {
        let lost = conn
            .take_buffered()
            .iter()
            .filter(|msg| {
                !matches!(
                    self.namer.parse(&msg.channel),
                    Ok((ChannelClass::Control, _))
                )
            })
            .count();
        if lost > 0 {
            self.metrics.dropped.inc_by(lost as u64);
            warn!(
                op = "receive",
                dropped = lost,
                "Discarded messages buffered on the closed subscription connection"
            );
        }
        conn.close().await;
    }

    async fn unsubscribe_all(&self, conn: &mut DedicatedConnection) {
        let mut channels = self.active.snapshot();
        channels.insert(self.control_channel());
        for channel in &channels {
            if let Err(e) = conn.unsubscribe(channel).await {
                debug!(op = "unsubscribe", channel = %channel, error = %e, "Unsubscribe failed during shutdown");
                break;
            }
        }
        self.active.replace(BTreeSet::new());
    }
}
