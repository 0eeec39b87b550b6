//! Pub/sub backend abstraction.
//!
//! The bus talks to its backend through three traits: a [`Backend`] factory,
//! short-lived [`BackendConnection`]s for `PUBLISH`/`PING` (these live in the
//! pool), and one long-lived [`SubscriptionConnection`] in subscribe mode.
//!
//! Two implementations ship with the crate: [`redis::RedisBackend`] and the
//! in-process [`memory::MemoryBackend`] selected by `memory://`.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use relay_core::{BackendChannel, Result};

/// A message received on the subscription connection, before decoding.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Glob pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    /// Undecoded payload.
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Build a message.
    pub fn new(channel: impl Into<String>, pattern: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            pattern,
            payload,
        }
    }

    /// The backend subscription that delivered this message.
    pub fn delivered_by(&self) -> BackendChannel {
        match &self.pattern {
            Some(p) => BackendChannel::Pattern(p.clone()),
            None => BackendChannel::Channel(self.channel.clone()),
        }
    }
}

/// Factory for backend connections.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Open a command connection (handshake included).
    async fn connect(&self) -> Result<Box<dyn BackendConnection>>;

    /// Open a connection in subscribe mode.
    async fn connect_subscriber(&self) -> Result<Box<dyn SubscriptionConnection>>;

    /// Human-readable backend address with credentials redacted.
    fn describe(&self) -> String;
}

/// A command connection used for one publish or probe at a time.
#[async_trait]
pub trait BackendConnection: Send {
    /// `PUBLISH`; returns the number of receiving backend clients.
    async fn publish(&mut self, channel: &str, payload: Vec<u8>) -> Result<i64>;

    /// `PING`.
    async fn ping(&mut self) -> Result<()>;
}

/// The dedicated connection in subscribe mode.
#[async_trait]
pub trait SubscriptionConnection: Send {
    /// `SUBSCRIBE` or `PSUBSCRIBE` depending on the channel kind.
    async fn subscribe(&mut self, channel: &BackendChannel) -> Result<()>;

    /// `UNSUBSCRIBE` or `PUNSUBSCRIBE` depending on the channel kind.
    async fn unsubscribe(&mut self, channel: &BackendChannel) -> Result<()>;

    /// Next message. `Ok(None)` means the stream has ended.
    ///
    /// Must be cancel-safe: dropping the future loses no message.
    async fn next_message(&mut self) -> Result<Option<RawMessage>>;

    /// Take messages already received but not yet read, without waiting.
    /// Clients that cannot see their buffer return nothing.
    fn take_buffered(&mut self) -> Vec<RawMessage> {
        Vec::new()
    }

    /// Close the connection. Further calls fail.
    async fn close(&mut self);
}
