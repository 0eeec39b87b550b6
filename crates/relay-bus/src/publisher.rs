//! Publisher with local loopback.
//!
//! A publish first schedules delivery to matching local subscribers, then
//! sends the encoded envelope over a pooled connection. Local delivery does
//! not depend on the network path: while the backend is unreachable local
//! subscribers still see the event and the caller still gets the error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use relay_core::{encode_event, validate_event_type, ChannelNamer, Error, Event, Result};

use crate::dispatcher::Deliverer;
use crate::metrics::BusMetrics;
use crate::pool::ConnectionPool;
use crate::registry::Registry;

/// Outcome of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub event_id: Uuid,
    /// Subscribed backend connections that received the message, as reported
    /// by the backend. Includes this process's own subscription connection.
    pub receivers: i64,
    /// Local callbacks scheduled by loopback.
    pub local_deliveries: usize,
}

pub struct Publisher {
    pub pool: Arc<ConnectionPool>,
    pub registry: Arc<Registry>,
    pub deliverer: Arc<Deliverer>,
    pub metrics: Arc<BusMetrics>,
    pub namer: ChannelNamer,
    pub origin: String,
    closed: AtomicBool,
}

impl Publisher {
    pub fn new(
        pool: Arc<ConnectionPool>,
        registry: Arc<Registry>,
        deliverer: Arc<Deliverer>,
        metrics: Arc<BusMetrics>,
        namer: ChannelNamer,
        origin: String,
    ) -> Self {
        Self {
            pool,
            registry,
            deliverer,
            metrics,
            namer,
            origin,
            closed: AtomicBool::new(false),
        }
    }

    fn build(&self, event_type: &str, data: Value) -> Result<Arc<Event>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        validate_event_type(event_type)?;
        Ok(Arc::new(Event::new(event_type, data, self.origin.clone())))
    }

    fn loopback(&self, event: &Arc<Event>) -> usize {
        let entries = self.registry.matching(&event.event_type);
        if entries.is_empty() {
            return 0;
        }
        self.deliverer.deliver_detached(entries, event.clone())
    }

    /// Publish an event to every process on the bus, this one included.
    #[instrument(
        skip_all,
        fields(subsystem = "bus", component = "publisher", op = "publish", event_type = %event_type)
    )]
    pub async fn publish(&self, event_type: &str, data: Value) -> Result<PublishReceipt> {
        let event = self.build(event_type, data)?;
        let local_deliveries = self.loopback(&event);

        let start = Instant::now();
        let result = self.send(&event).await;
        match result {
            Ok(receivers) => {
                let elapsed = start.elapsed();
                self.metrics.observe_publish(elapsed);
                self.metrics.published.inc();
                debug!(
                    event_id = %event.event_id,
                    receivers,
                    local_deliveries,
                    duration_ms = elapsed.as_millis() as u64,
                    "Event published"
                );
                Ok(PublishReceipt {
                    event_id: event.event_id,
                    receivers,
                    local_deliveries,
                })
            }
            Err(e) => {
                self.metrics.publish_failures.inc();
                warn!(
                    event_id = %event.event_id,
                    local_deliveries,
                    error = %e,
                    "Publish failed, event delivered locally only"
                );
                Err(e)
            }
        }
    }

    /// Publish on a pooled connection. A connection error is retried on a
    /// newly opened connection, up to the pool's retry count.
    async fn send(&self, event: &Event) -> Result<i64> {
        let payload = encode_event(event)?;
        let channel = self.namer.direct(&event.event_type);
        let retries = self.pool.publish_retries();

        let mut lease = self.pool.acquire().await?;
        let mut attempt = 0;
        loop {
            let result = lease.publish(&channel, payload.clone()).await;
            match result {
                Err(Error::Connection(reason)) if attempt < retries => {
                    attempt += 1;
                    debug!(
                        event_id = %event.event_id,
                        attempt,
                        error = %reason,
                        "Publish connection failed, retrying on a new connection"
                    );
                    drop(lease);
                    lease = self.pool.acquire_fresh().await?;
                }
                result => return result,
            }
        }
    }

    /// Deliver an event to local subscribers only. Returns the number of
    /// callbacks scheduled.
    pub fn emit_local(&self, event_type: &str, data: Value) -> Result<usize> {
        let event = self.build(event_type, data)?;
        let n = self.loopback(&event);
        debug!(
            subsystem = "bus",
            component = "publisher",
            op = "emit_local",
            event_type = %event.event_type,
            event_id = %event.event_id,
            local_deliveries = n,
            "Event emitted locally"
        );
        Ok(n)
    }

    /// Refuse further publishes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
