//! Rolling-window rate limiting for backend calls.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Configuration for the call rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls allowed in any window.
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,
    /// Window length in seconds.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

fn default_max_calls() -> usize {
    12
}

fn default_interval_seconds() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            interval_seconds: default_interval_seconds(),
        }
    }
}

impl RateLimitConfig {
    /// Window length.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Allows at most `max_calls` acquisitions in any window of `interval`.
///
/// Excess callers wait until the oldest call leaves the window. Nothing is
/// ever rejected. Waiters are served in arrival order because the lock is
/// held while sleeping.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    interval: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter.
    #[must_use]
    pub fn new(max_calls: usize, interval: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            interval,
            calls: Mutex::new(VecDeque::with_capacity(max_calls.min(64))),
        }
    }

    /// Creates a limiter from configuration.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_calls, config.interval())
    }

    /// A limiter that never waits in practice.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(usize::MAX >> 1, Duration::ZERO)
    }

    /// Waits for a slot and records the call.
    pub async fn acquire(&self) {
        let mut calls = self.calls.lock().await;
        loop {
            let now = Instant::now();
            while calls
                .front()
                .is_some_and(|oldest| now.duration_since(*oldest) >= self.interval)
            {
                calls.pop_front();
            }
            if calls.len() < self.max_calls {
                calls.push_back(now);
                return;
            }
            if let Some(oldest) = calls.front().copied() {
                // A window too long to represent never reopens.
                let Some(wake) = oldest.checked_add(self.interval) else {
                    tracing::warn!(
                        interval_secs = self.interval.as_secs(),
                        "Rate limit window cannot elapse, waiting indefinitely"
                    );
                    std::future::pending::<()>().await;
                    return;
                };
                tracing::debug!(
                    wait_ms = wake.saturating_duration_since(now).as_millis() as u64,
                    "Rate limit reached, waiting"
                );
                tokio::time::sleep_until(wake).await;
            }
        }
    }

    /// Calls recorded in the current window.
    pub async fn in_window(&self) -> usize {
        let now = Instant::now();
        self.calls
            .lock()
            .await
            .iter()
            .filter(|at| now.duration_since(**at) < self.interval)
            .count()
    }
}
