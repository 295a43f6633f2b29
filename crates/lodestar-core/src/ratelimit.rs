//! Per-owner fixed-window rate limiting.
//!
//! Counters live only in memory and reset on restart.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limited {
    pub limit: u32,
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Window {
    count: u32,
    ends_at: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request for `owner`.
    ///
    /// A window that has ended starts over with this request as its first.
    /// Requests over the limit are still counted.
    pub fn check(&self, owner: &str) -> Result<(), Limited> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(owner.to_string())
            .or_insert_with(|| Window {
                count: 0,
                ends_at: now + self.config.window,
            });
        if now > window.ends_at {
            window.count = 0;
            window.ends_at = now + self.config.window;
        }
        window.count = window.count.saturating_add(1);

        if window.count > self.config.max_requests {
            return Err(Limited {
                limit: self.config.max_requests,
                retry_after: window.ends_at.saturating_duration_since(now),
            });
        }
        Ok(())
    }

    /// Drop windows that have ended. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| w.ends_at >= now);
        before - windows.len()
    }
}
