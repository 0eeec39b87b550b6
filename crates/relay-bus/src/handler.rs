//! Subscriber callbacks.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use relay_core::Event;

/// Error returned by a failing callback. Logged and counted, never propagated.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError(s.to_string())
    }
}

impl From<relay_core::Error> for HandlerError {
    fn from(e: relay_core::Error) -> Self {
        HandlerError(e.to_string())
    }
}

/// Result of one callback invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Trait for local subscribers.
///
/// Each invocation runs in its own task under the dispatcher's callback
/// timeout. A handler may be invoked concurrently for different events.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event.
    async fn handle(&self, event: Arc<Event>) -> HandlerResult;
}

/// Handler wrapping an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> HandlerResult {
        (self.f)(event).await
    }
}

/// Handler forwarding events into a bounded channel.
///
/// A full channel makes the callback wait, which holds a dispatcher slot and
/// eventually backpressures the subscription. A dropped receiver is an error.
pub struct ChannelHandler {
    tx: mpsc::Sender<Arc<Event>>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, event: Arc<Event>) -> HandlerResult {
        self.tx
            .send(event)
            .await
            .map_err(|_| HandlerError::from("subscriber channel closed"))
    }
}

/// No-op handler for testing.
pub struct NoOpHandler;

#[async_trait]
impl EventHandler for NoOpHandler {
    async fn handle(&self, _event: Arc<Event>) -> HandlerResult {
        Ok(())
    }
}
