//! Fixed-window request limiting per client key

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::error::ProgressError;

struct Window {
    started: Instant,
    count: u32,
}

/// Counts requests per key within a fixed window
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    /// `max_requests == 0` disables limiting
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            windows: DashMap::new(),
        }
    }

    /// Count one request for `key`
    pub fn check(&self, key: &str) -> Result<(), ProgressError> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), ProgressError> {
        if self.max_requests == 0 {
            return Ok(());
        }

        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.max_requests {
            let reset_in = self.window.saturating_sub(now.duration_since(entry.started));
            return Err(ProgressError::RateLimited {
                retry_after_secs: reset_in.as_secs().max(1),
            });
        }

        entry.count += 1;
        Ok(())
    }

    /// Drop windows that have fully expired
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    fn evict_expired_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < self.window);
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            debug!(evicted, "Evicted expired rate limit windows");
        }
        evicted
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}
