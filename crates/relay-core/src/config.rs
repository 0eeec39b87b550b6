//! Bus configuration consumed at construction time.
//!
//! [`BusConfig::from_env`] reads the variables below; anything unset or
//! unparsable falls back to [`crate::defaults`]. [`BusConfig::validate`] is
//! the only place a configuration error can be raised, and it is fatal.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_BACKEND_URL` | `redis://127.0.0.1:6379` | Backend address (`redis://`, `rediss://`, `memory://`) |
//! | `RELAY_NAMESPACE` | `event` | Channel namespace prefix |
//! | `RELAY_ORIGIN_ID` | random UUID | Process identifier stamped on events |
//! | `RELAY_POOL_MAX_SIZE` | `100` | Maximum pooled publish connections |
//! | `RELAY_POOL_MIN_IDLE` | `2` | Connections kept warm |
//! | `RELAY_POOL_ACQUIRE_TIMEOUT_MS` | `5000` | Wait before `PoolExhausted` |
//! | `RELAY_PUBLISH_RETRIES` | `3` | Publish retries on a fresh connection after a connection error |
//! | `RELAY_CONNECT_TIMEOUT_SECS` | `10` | Connection handshake timeout |
//! | `RELAY_COMMAND_TIMEOUT_SECS` | `10` | Per-command timeout |
//! | `RELAY_DISPATCH_CONCURRENCY` | `min(cpus × 20, 100)` | Initial concurrent deliveries |
//! | `RELAY_DISPATCH_MAX_CONCURRENCY` | `200` | Upper scaling bound |
//! | `RELAY_DISPATCH_QUEUE_BOUND` | `1024` | Buffered messages before backpressure |
//! | `RELAY_CALLBACK_TIMEOUT_SECS` | `30` | Per-callback timeout |
//! | `RELAY_HEALTH_INTERVAL_SECS` | `30` | Liveness probe interval |
//! | `RELAY_HEALTH_STALE_SECS` | `90` | Subscription silence before forced reconnect |
//! | `RELAY_BACKOFF_INITIAL_MS` | `100` | First reconnect delay |
//! | `RELAY_BACKOFF_MAX_MS` | `30000` | Reconnect delay cap |
//! | `RELAY_MAX_RECONNECT_ATTEMPTS` | unlimited | Consecutive failures before fatal shutdown |
//! | `RELAY_SUPPRESS_SELF_ECHO` | `true` | Drop network copies of this process's own events |

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::channel::{validate_event_type, ChannelNamer};
use crate::defaults;
use crate::error::{Error, Result};

const BACKEND_SCHEMES: [&str; 5] = ["redis://", "rediss://", "redis+unix://", "unix://", "memory://"];

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of pooled publish connections.
    pub max_size: usize,
    /// Connections kept open and idle.
    pub min_idle: usize,
    /// Bounded wait in `acquire` before `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// Retries of a publish that failed with a connection error.
    pub publish_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: defaults::POOL_MAX_SIZE,
            min_idle: defaults::POOL_MIN_IDLE,
            acquire_timeout: Duration::from_millis(defaults::POOL_ACQUIRE_TIMEOUT_MS),
            publish_retries: defaults::PUBLISH_RETRIES,
        }
    }
}

impl PoolConfig {
    /// Set the maximum pool size.
    pub fn with_max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    /// Set the warm connection count.
    pub fn with_min_idle(mut self, n: usize) -> Self {
        self.min_idle = n;
        self
    }

    /// Set the acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the publish retry count. `0` disables retries.
    pub fn with_publish_retries(mut self, retries: u32) -> Self {
        self.publish_retries = retries;
        self
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Initial (and floor) concurrent deliveries.
    pub concurrency: usize,
    /// Upper bound the limit may scale to under sustained backlog.
    pub max_concurrency: usize,
    /// Buffered messages before `submit` applies backpressure.
    pub queue_bound: usize,
    /// Permits added per adaptation tick under backlog.
    pub scale_up_step: usize,
    /// Permits removed per adaptation tick while idle.
    pub scale_down_step: usize,
    /// Interval between adaptations.
    pub adapt_interval: Duration,
    /// Per-callback timeout.
    pub callback_timeout: Duration,
}

/// Concurrency derived from available parallelism: `cpus × 20`, capped at 100.
pub fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * defaults::DISPATCH_PER_CPU).min(defaults::DISPATCH_INITIAL_CAP)
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let concurrency = default_concurrency();
        Self {
            concurrency,
            max_concurrency: defaults::DISPATCH_MAX_CONCURRENCY.max(concurrency),
            queue_bound: defaults::DISPATCH_QUEUE_BOUND,
            scale_up_step: defaults::DISPATCH_SCALE_UP_STEP,
            scale_down_step: defaults::DISPATCH_SCALE_DOWN_STEP,
            adapt_interval: Duration::from_millis(defaults::DISPATCH_ADAPT_INTERVAL_MS),
            callback_timeout: Duration::from_secs(defaults::CALLBACK_TIMEOUT_SECS),
        }
    }
}

impl DispatchConfig {
    /// Set the initial concurrency. Raises the upper bound if needed.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self.max_concurrency = self.max_concurrency.max(n);
        self
    }

    /// Set the upper scaling bound.
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    /// Set the queue bound.
    pub fn with_queue_bound(mut self, n: usize) -> Self {
        self.queue_bound = n;
        self
    }

    /// Set the adaptation interval.
    pub fn with_adapt_interval(mut self, interval: Duration) -> Self {
        self.adapt_interval = interval;
        self
    }

    /// Set the per-callback timeout.
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }
}

/// Health monitor settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Probe interval.
    pub interval: Duration,
    /// Subscription silence before the connection is declared stale.
    pub stale_threshold: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(defaults::HEALTH_INTERVAL_SECS),
            stale_threshold: Duration::from_secs(defaults::HEALTH_STALE_SECS),
        }
    }
}

impl HealthConfig {
    /// Set the probe interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the staleness threshold.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay.
    pub initial: Duration,
    /// Delay cap.
    pub max: Duration,
    /// Growth factor per attempt.
    pub factor: f64,
    /// Consecutive failed attempts before the bus gives up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(defaults::BACKOFF_INITIAL_MS),
            max: Duration::from_millis(defaults::BACKOFF_MAX_MS),
            factor: defaults::BACKOFF_FACTOR,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Set the delay bounds.
    pub fn with_bounds(mut self, initial: Duration, max: Duration) -> Self {
        self.initial = initial;
        self.max = max;
        self
    }

    /// Set the attempt limit.
    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }
}

/// Complete bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Backend address.
    pub backend_url: String,
    /// Channel namespace prefix.
    pub namespace: String,
    /// Process identifier; generated when `None`.
    pub origin_id: Option<String>,
    /// Connection handshake timeout.
    pub connect_timeout: Duration,
    /// Per-command timeout.
    pub command_timeout: Duration,
    /// Drop network copies of events this process already delivered locally.
    pub suppress_self_echo: bool,
    /// Bounded wait for in-flight deliveries during shutdown.
    pub shutdown_timeout: Duration,
    pub pool: PoolConfig,
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub backoff: BackoffConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend_url: defaults::BACKEND_URL.to_string(),
            namespace: defaults::NAMESPACE.to_string(),
            origin_id: None,
            connect_timeout: Duration::from_secs(defaults::CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(defaults::COMMAND_TIMEOUT_SECS),
            suppress_self_echo: true,
            shutdown_timeout: Duration::from_secs(defaults::SHUTDOWN_DRAIN_TIMEOUT_SECS),
            pool: PoolConfig::default(),
            dispatch: DispatchConfig::default(),
            health: HealthConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}

impl BusConfig {
    /// Create a config for the given backend address with defaults elsewhere.
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables (with defaults).
    ///
    /// See the module documentation for the variable table.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("RELAY_BACKEND_URL") {
            config.backend_url = url;
        }
        if let Some(ns) = lookup("RELAY_NAMESPACE") {
            config.namespace = ns;
        }
        config.origin_id = lookup("RELAY_ORIGIN_ID").filter(|v| !v.is_empty());

        if let Some(n) = parsed(&lookup, "RELAY_POOL_MAX_SIZE") {
            config.pool.max_size = n;
        }
        if let Some(n) = parsed(&lookup, "RELAY_POOL_MIN_IDLE") {
            config.pool.min_idle = n;
        }
        if let Some(ms) = parsed(&lookup, "RELAY_POOL_ACQUIRE_TIMEOUT_MS") {
            config.pool.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parsed(&lookup, "RELAY_PUBLISH_RETRIES") {
            config.pool.publish_retries = n;
        }
        if let Some(secs) = parsed(&lookup, "RELAY_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(&lookup, "RELAY_COMMAND_TIMEOUT_SECS") {
            config.command_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parsed(&lookup, "RELAY_DISPATCH_CONCURRENCY") {
            config.dispatch = config.dispatch.with_concurrency(n);
        }
        if let Some(n) = parsed(&lookup, "RELAY_DISPATCH_MAX_CONCURRENCY") {
            config.dispatch.max_concurrency = n;
        }
        if let Some(n) = parsed(&lookup, "RELAY_DISPATCH_QUEUE_BOUND") {
            config.dispatch.queue_bound = n;
        }
        if let Some(secs) = parsed(&lookup, "RELAY_CALLBACK_TIMEOUT_SECS") {
            config.dispatch.callback_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(&lookup, "RELAY_HEALTH_INTERVAL_SECS") {
            config.health.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(&lookup, "RELAY_HEALTH_STALE_SECS") {
            config.health.stale_threshold = Duration::from_secs(secs);
        }
        if let Some(ms) = parsed(&lookup, "RELAY_BACKOFF_INITIAL_MS") {
            config.backoff.initial = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed(&lookup, "RELAY_BACKOFF_MAX_MS") {
            config.backoff.max = Duration::from_millis(ms);
        }
        if let Some(n) = parsed(&lookup, "RELAY_MAX_RECONNECT_ATTEMPTS") {
            config.backoff.max_attempts = Some(n);
        }
        if let Some(v) = lookup("RELAY_SUPPRESS_SELF_ECHO") {
            config.suppress_self_echo = v != "false" && v != "0";
        }

        config
    }

    /// Set the namespace prefix.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the process identifier.
    pub fn with_origin_id(mut self, origin: impl Into<String>) -> Self {
        self.origin_id = Some(origin.into());
        self
    }

    /// Enable or disable self-echo suppression.
    pub fn with_suppress_self_echo(mut self, suppress: bool) -> Self {
        self.suppress_self_echo = suppress;
        self
    }

    /// Set the shutdown drain timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Replace the pool settings.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Replace the dispatcher settings.
    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Replace the health settings.
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Replace the backoff settings.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether the backend address selects the in-process backend.
    pub fn is_memory_backend(&self) -> bool {
        self.backend_url.starts_with(defaults::MEMORY_BACKEND_URL)
    }

    /// Check every bound. Any failure here prevents startup.
    pub fn validate(&self) -> Result<()> {
        if !BACKEND_SCHEMES
            .iter()
            .any(|scheme| self.backend_url.starts_with(scheme))
        {
            return Err(Error::Config(format!(
                "unsupported backend address {:?} (expected one of {})",
                crate::logging::redact_url(&self.backend_url),
                BACKEND_SCHEMES.join(", ")
            )));
        }
        ChannelNamer::new(self.namespace.as_str())?;
        if let Some(origin) = &self.origin_id {
            validate_event_type(origin)
                .map_err(|e| Error::Config(format!("invalid origin id: {}", e)))?;
        }

        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(Error::Config("backend timeouts must be non-zero".into()));
        }
        if self.pool.max_size == 0 {
            return Err(Error::Config("pool max size must be > 0".into()));
        }
        if self.pool.min_idle > self.pool.max_size {
            return Err(Error::Config(format!(
                "pool min idle ({}) exceeds max size ({})",
                self.pool.min_idle, self.pool.max_size
            )));
        }
        if self.pool.acquire_timeout.is_zero() {
            return Err(Error::Config("pool acquire timeout must be non-zero".into()));
        }

        let d = &self.dispatch;
        if d.concurrency == 0 {
            return Err(Error::Config("dispatch concurrency must be > 0".into()));
        }
        if d.max_concurrency < d.concurrency {
            return Err(Error::Config(format!(
                "dispatch max concurrency ({}) is below initial concurrency ({})",
                d.max_concurrency, d.concurrency
            )));
        }
        if d.queue_bound == 0 {
            return Err(Error::Config("dispatch queue bound must be > 0".into()));
        }
        if d.adapt_interval.is_zero() || d.callback_timeout.is_zero() {
            return Err(Error::Config(
                "dispatch adapt interval and callback timeout must be non-zero".into(),
            ));
        }

        if self.health.interval.is_zero() {
            return Err(Error::Config("health interval must be non-zero".into()));
        }
        if self.health.stale_threshold <= self.health.interval {
            return Err(Error::Config(format!(
                "health stale threshold ({:?}) must exceed the probe interval ({:?})",
                self.health.stale_threshold, self.health.interval
            )));
        }

        let b = &self.backoff;
        if b.initial.is_zero() || b.max < b.initial {
            return Err(Error::Config(format!(
                "invalid backoff bounds: initial {:?}, max {:?}",
                b.initial, b.max
            )));
        }
        if !b.factor.is_finite() || b.factor < 1.0 {
            return Err(Error::Config(format!(
                "backoff factor must be >= 1.0 (got {})",
                b.factor
            )));
        }

        Ok(())
    }
}
