/// Per-key sliding-window rate limiter
///
/// Remembers the instants of accepted calls per key and refuses a call when
/// `limit` calls already happened inside the trailing `window`. Refusals fail fast
/// with the number of seconds until the oldest call leaves the window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Record a call for `key`, or return the retry-after seconds when over the limit
    pub fn check(&self, key: &str) -> Result<(), u64> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), u64> {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let history = calls.entry(key.to_string()).or_default();

        while let Some(oldest) = history.front() {
            if now.duration_since(*oldest) >= self.window {
                history.pop_front();
            } else {
                break;
            }
        }

        if history.len() >= self.limit {
            let oldest = history.front().copied().unwrap_or(now);
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            // Round up so a client honouring Retry-After never arrives early
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            return Err(secs.max(1));
        }

        history.push_back(now);
        Ok(())
    }

    /// Forget keys with no calls inside the window; returns how many were dropped
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let before = calls.len();
        calls.retain(|_, history| {
            history
                .back()
                .map_or(false, |last| now.duration_since(*last) < self.window)
        });
        before - calls.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
