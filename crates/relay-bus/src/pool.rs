//! Backend connection pool.
//!
//! Publish and probe traffic share a bounded pool of command connections.
//! The subscription connection is opened through the pool manager as well
//! (so it is counted and shares timeouts) but never enters the shared pool.
//!
//! Capacity is a semaphore of `max_size` permits: a lease holds one permit,
//! and a new connection is only opened while holding one, so the number of
//! open pooled connections never exceeds `max_size`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use relay_core::{BackendChannel, Error, PoolConfig, Result};

use crate::backend::{Backend, BackendConnection, RawMessage, SubscriptionConnection};

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    /// Open pooled connections (idle + in use).
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Open subscription connections.
    pub dedicated: usize,
    pub max_size: usize,
    pub created_total: u64,
    pub discarded_total: u64,
}

/// Pool of backend command connections.
pub struct ConnectionPool {
    backend: Arc<dyn Backend>,
    config: PoolConfig,
    connect_timeout: Duration,
    command_timeout: Duration,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn BackendConnection>>>,
    open: AtomicUsize,
    in_use: AtomicUsize,
    dedicated: AtomicUsize,
    created_total: AtomicU64,
    discarded_total: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: PoolConfig,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Arc<Self> {
        info!(
            subsystem = "bus",
            component = "pool",
            op = "create",
            backend = %backend.describe(),
            max_size = config.max_size,
            min_idle = config.min_idle,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "Creating backend connection pool"
        );
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.max_size)),
            backend,
            config,
            connect_timeout,
            command_timeout,
            idle: Mutex::new(Vec::new()),
            open: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            dedicated: AtomicUsize::new(0),
            created_total: AtomicU64::new(0),
            discarded_total: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Box<dyn BackendConnection>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn publish_retries(&self) -> u32 {
        self.config.publish_retries
    }

    async fn open_connection(&self) -> Result<Box<dyn BackendConnection>> {
        let start = Instant::now();
        let conn = match timeout(self.connect_timeout, self.backend.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Connection(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                )))
            }
        };
        let size = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.created_total.fetch_add(1, Ordering::SeqCst);
        debug!(
            subsystem = "bus",
            component = "pool",
            op = "connect",
            pool_size = size,
            duration_ms = start.elapsed().as_millis() as u64,
            "Opened pooled connection"
        );
        Ok(conn)
    }

    fn discard(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.discarded_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Lease a connection, waiting up to the acquire timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease> {
        self.lease(false).await
    }

    /// Lease a newly opened connection. An idle connection is closed in its
    /// place so the pool stays within `max_size`.
    pub async fn acquire_fresh(self: &Arc<Self>) -> Result<Lease> {
        self.lease(true).await
    }

    async fn lease(self: &Arc<Self>, fresh: bool) -> Result<Lease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let start = Instant::now();
        let permit = match timeout(self.config.acquire_timeout, self.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::ShuttingDown),
            Err(_) => {
                let waited_ms = start.elapsed().as_millis() as u64;
                warn!(
                    subsystem = "bus",
                    component = "pool",
                    op = "acquire",
                    waited_ms,
                    pool_in_use = self.in_use.load(Ordering::SeqCst),
                    "Connection pool exhausted"
                );
                return Err(Error::PoolExhausted { waited_ms });
            }
        };

        let pooled = self.idle().pop();
        let conn = match pooled {
            Some(stale) if fresh => {
                drop(stale);
                self.discard();
                self.open_connection().await?
            }
            Some(conn) => conn,
            None => self.open_connection().await?,
        };
        self.in_use.fetch_add(1, Ordering::SeqCst);

        Ok(Lease {
            conn: Some(conn),
            pool: self.clone(),
            broken: false,
            _permit: permit,
        })
    }

    /// Open the dedicated subscription connection.
    pub async fn dedicated(self: &Arc<Self>) -> Result<DedicatedConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let conn = match timeout(self.connect_timeout, self.backend.connect_subscriber()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Connection(format!(
                    "subscription connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                )))
            }
        };
        self.dedicated.fetch_add(1, Ordering::SeqCst);
        debug!(
            subsystem = "bus",
            component = "pool",
            op = "dedicated",
            "Opened subscription connection"
        );
        Ok(DedicatedConnection {
            conn,
            pool: self.clone(),
        })
    }

    /// Open connections until `min_idle` are idle. Returns how many were opened.
    pub async fn ensure_min_idle(&self) -> Result<usize> {
        let mut opened = 0;
        loop {
            if self.closed.load(Ordering::SeqCst)
                || self.idle().len() >= self.config.min_idle
                || self.open.load(Ordering::SeqCst) >= self.config.max_size
            {
                return Ok(opened);
            }
            let Ok(_permit) = self.permits.try_acquire() else {
                return Ok(opened);
            };
            let conn = self.open_connection().await?;
            self.idle().push(conn);
            opened += 1;
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.open.load(Ordering::SeqCst),
            idle: self.idle().len(),
            in_use: self.in_use.load(Ordering::SeqCst),
            dedicated: self.dedicated.load(Ordering::SeqCst),
            max_size: self.config.max_size,
            created_total: self.created_total.load(Ordering::SeqCst),
            discarded_total: self.discarded_total.load(Ordering::SeqCst),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every idle connection and fail pending and future acquires.
    /// Leased connections are discarded when their lease drops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        let idle: Vec<_> = self.idle().drain(..).collect();
        for _ in &idle {
            self.discard();
        }
        info!(
            subsystem = "bus",
            component = "pool",
            op = "close",
            closed_idle = idle.len(),
            pool_in_use = self.in_use.load(Ordering::SeqCst),
            "Connection pool closed"
        );
    }
}

/// Exclusive use of one pooled connection.
///
/// Dropping the lease returns a healthy connection to the idle set. A
/// connection that failed a command is discarded instead.
pub struct Lease {
    conn: Option<Box<dyn BackendConnection>>,
    pool: Arc<ConnectionPool>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

fn timed_out(op: &str, after: Duration) -> Error {
    Error::Connection(format!("{} timed out after {}ms", op, after.as_millis()))
}

impl Lease {
    fn conn(&mut self) -> Result<&mut Box<dyn BackendConnection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Internal("lease has no connection".into()))
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// `PUBLISH` on the leased connection.
    pub async fn publish(&mut self, channel: &str, payload: Vec<u8>) -> Result<i64> {
        let command_timeout = self.pool.command_timeout;
        let conn = self.conn()?;
        let result = timeout(command_timeout, conn.publish(channel, payload))
            .await
            .unwrap_or_else(|_| Err(timed_out("publish", command_timeout)));
        self.track(result)
    }

    /// `PING` on the leased connection.
    pub async fn ping(&mut self) -> Result<()> {
        let command_timeout = self.pool.command_timeout;
        let conn = self.conn()?;
        let result = timeout(command_timeout, conn.ping())
            .await
            .unwrap_or_else(|_| Err(timed_out("ping", command_timeout)));
        self.track(result)
    }

    /// Mark the connection unusable; it is discarded on drop.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken || self.pool.is_closed() {
            drop(conn);
            self.pool.discard();
            debug!(
                subsystem = "bus",
                component = "pool",
                op = "release",
                broken = self.broken,
                "Discarded pooled connection"
            );
        } else {
            self.pool.idle().push(conn);
        }
    }
}

/// The subscription connection, with command timeouts applied.
pub struct DedicatedConnection {
    conn: Box<dyn SubscriptionConnection>,
    pool: Arc<ConnectionPool>,
}

impl DedicatedConnection {
    async fn with_timeout(
        &mut self,
        op: &str,
        channel: &BackendChannel,
        subscribe: bool,
    ) -> Result<()> {
        let command_timeout = self.pool.command_timeout;
        let fut = if subscribe {
            self.conn.subscribe(channel)
        } else {
            self.conn.unsubscribe(channel)
        };
        timeout(command_timeout, fut)
            .await
            .unwrap_or_else(|_| Err(timed_out(&format!("{} {}", op, channel), command_timeout)))
    }

    pub async fn subscribe(&mut self, channel: &BackendChannel) -> Result<()> {
        self.with_timeout("subscribe", channel, true).await
    }

    pub async fn unsubscribe(&mut self, channel: &BackendChannel) -> Result<()> {
        self.with_timeout("unsubscribe", channel, false).await
    }

    /// Next message; cancel-safe.
    pub async fn next_message(&mut self) -> Result<Option<RawMessage>> {
        self.conn.next_message().await
    }

    /// Messages received but not yet read.
    pub fn take_buffered(&mut self) -> Vec<RawMessage> {
        self.conn.take_buffered()
    }

    pub async fn close(mut self) {
        self.conn.close().await;
    }
}

impl Drop for DedicatedConnection {
    fn drop(&mut self) {
        self.pool.dedicated.fetch_sub(1, Ordering::SeqCst);
    }
}
