//! Bus lifecycle state.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

/// Lifecycle of the bus's subscription side.
///
/// ```text
/// Disconnected ─► Connecting ─► Subscribed ─► Degraded ─► Connecting …
///                                   (any) ─► Disconnected on shutdown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusState {
    Disconnected,
    Connecting,
    Subscribed,
    Degraded,
}

impl BusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusState::Disconnected => "disconnected",
            BusState::Connecting => "connecting",
            BusState::Subscribed => "subscribed",
            BusState::Degraded => "degraded",
        }
    }

    /// Gauge value exported as `relay_bus_state`.
    pub fn as_gauge(&self) -> i64 {
        match self {
            BusState::Disconnected => 0,
            BusState::Connecting => 1,
            BusState::Subscribed => 2,
            BusState::Degraded => 3,
        }
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared, observable state cell.
pub struct StateCell {
    tx: watch::Sender<BusState>,
}

impl Default for StateCell {
    fn default() -> Self {
        let (tx, _) = watch::channel(BusState::Disconnected);
        Self { tx }
    }
}

impl StateCell {
    pub fn get(&self) -> BusState {
        *self.tx.borrow()
    }

    /// Transition to `next`. Returns the previous state.
    pub fn set(&self, next: BusState) -> BusState {
        let prev = self.tx.send_replace(next);
        if prev != next {
            info!(
                subsystem = "bus",
                component = "subscriber",
                from = %prev,
                state = %next,
                "Bus state changed"
            );
        }
        prev
    }

    pub fn subscribe(&self) -> watch::Receiver<BusState> {
        self.tx.subscribe()
    }

    /// Wait until the state equals `target`. Returns `false` on timeout.
    pub async fn wait_for(&self, target: BusState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}
