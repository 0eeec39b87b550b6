//! Centralized default constants for the relay event bus.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration types and tests reference these constants instead of
//! defining their own magic numbers.

// =============================================================================
// BACKEND
// =============================================================================

/// Default backend address.
pub const BACKEND_URL: &str = "redis://127.0.0.1:6379";

/// Backend address scheme selecting the in-process backend.
pub const MEMORY_BACKEND_URL: &str = "memory://";

/// Default namespace prefix separating bus traffic from other backend uses.
pub const NAMESPACE: &str = "event";

/// Timeout for establishing a backend connection (handshake included).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout for a single backend command (PUBLISH, PING, SUBSCRIBE).
pub const COMMAND_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// CONNECTION POOL
// =============================================================================

/// Maximum pooled publish connections.
///
/// Pub/sub traffic is bursty; the small defaults of typical client pools
/// (10-20) starve under load.
pub const POOL_MAX_SIZE: usize = 100;

/// Connections kept warm in the pool.
pub const POOL_MIN_IDLE: usize = 2;

/// Maximum wait for a pooled connection before `PoolExhausted`.
pub const POOL_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

/// Extra attempts for a publish that failed on its connection.
///
/// Each retry runs on a newly opened connection, so idle connections left
/// dead by a server restart cost one retry rather than one failed publish
/// each.
pub const PUBLISH_RETRIES: u32 = 3;

// =============================================================================
// DISPATCHER
// =============================================================================

/// Concurrent deliveries per available CPU.
pub const DISPATCH_PER_CPU: usize = 20;

/// Cap on the initial concurrency derived from CPU count.
pub const DISPATCH_INITIAL_CAP: usize = 100;

/// Upper bound the concurrency limit may scale to under backlog.
pub const DISPATCH_MAX_CONCURRENCY: usize = 200;

/// Permits added per adaptation tick under sustained backlog.
pub const DISPATCH_SCALE_UP_STEP: usize = 10;

/// Permits removed per adaptation tick while idle.
pub const DISPATCH_SCALE_DOWN_STEP: usize = 5;

/// Interval between concurrency adaptations in milliseconds.
pub const DISPATCH_ADAPT_INTERVAL_MS: u64 = 10_000;

/// Received-but-undispatched messages buffered before backpressure.
pub const DISPATCH_QUEUE_BOUND: usize = 1_024;

/// Maximum time a single subscriber callback may run.
pub const CALLBACK_TIMEOUT_SECS: u64 = 30;

/// Rolling latency window size (samples).
pub const LATENCY_WINDOW: usize = 256;

// =============================================================================
// HEALTH
// =============================================================================

/// Interval between liveness probes.
pub const HEALTH_INTERVAL_SECS: u64 = 30;

/// Silence on the subscription connection after which it is considered stale.
pub const HEALTH_STALE_SECS: u64 = 90;

// =============================================================================
// RECONNECT
// =============================================================================

/// First reconnect delay.
pub const BACKOFF_INITIAL_MS: u64 = 100;

/// Reconnect delay cap.
pub const BACKOFF_MAX_MS: u64 = 30_000;

/// Reconnect delay growth factor.
pub const BACKOFF_FACTOR: f64 = 2.0;

// =============================================================================
// SHUTDOWN
// =============================================================================

/// Bounded wait for in-flight deliveries during shutdown.
pub const SHUTDOWN_DRAIN_TIMEOUT_SECS: u64 = 10;
