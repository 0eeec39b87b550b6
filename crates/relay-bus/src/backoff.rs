//! Reconnect backoff with jitter.
//!
//! The delay for attempt `n` is `initial × factor^n`, clamped to `max`, then
//! equal jitter is applied: half the base delay is kept, the other half is
//! randomized. The base is derived from the attempt number alone, so jitter
//! never feeds back into later delays.

use std::time::Duration;

use rand::Rng;

use relay_core::BackoffConfig;

/// Jitter applied to a base delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Exact base delay.
    None,
    /// `base/2 + random[0, base/2]`.
    #[default]
    Equal,
}

impl Jitter {
    fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Equal => {
                let ms = delay.as_millis() as u64;
                let half = ms / 2;
                if half == 0 {
                    return delay;
                }
                let jitter = rand::thread_rng().gen_range(0..=half);
                Duration::from_millis(ms - half + jitter)
            }
        }
    }
}

/// Exponential backoff policy for the subscriber loop.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: Jitter,
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            initial: config.initial,
            max: config.max,
            factor: config.factor,
            jitter: Jitter::Equal,
        }
    }
}

impl Backoff {
    /// Delay before attempt `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }
}
