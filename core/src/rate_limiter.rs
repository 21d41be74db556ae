//! Sliding-window rate limiter, keyed by client identity (remote address
//! string by default).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Default: 200 requests per 1000 ms window.
pub const DEFAULT_MAX_REQUESTS: usize = 200;
pub const DEFAULT_WINDOW_MS: u64 = 1000;

pub struct RateLimiter {
    windows: DashMap<String, Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_ms: u64) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window: Duration::from_millis(window_ms),
        }
    }

    /// Drops timestamps older than `now - window`, denies if the
    /// remaining count is already at `max_requests`, otherwise records
    /// `now` and allows.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut deque = entry.lock().expect("rate limiter mutex");
        while let Some(&front) = deque.front() {
            if now.duration_since(front) > self.window {
                deque.pop_front();
            } else {
                break;
            }
        }
        if deque.len() >= self.max_requests {
            return false;
        }
        deque.push_back(now);
        true
    }

    /// Drop the entry for `key` entirely. Called on client disconnect.
    pub fn remove(&self, key: &str) {
        self.windows.remove(key);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_denies() {
        let rl = RateLimiter::new(3, 1000);
        assert!(rl.check("a"));
        assert!(rl.check("a"));
        assert!(rl.check("a"));
        assert!(!rl.check("a"));
    }

    #[test]
    fn keys_are_independent() {
        let rl = RateLimiter::new(1, 1000);
        assert!(rl.check("a"));
        assert!(rl.check("b"));
        assert!(!rl.check("a"));
    }

    #[test]
    fn window_expiry_allows_again() {
        let rl = RateLimiter::new(1, 20);
        assert!(rl.check("a"));
        assert!(!rl.check("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(rl.check("a"));
    }

    #[test]
    fn remove_clears_state() {
        let rl = RateLimiter::new(1, 1000);
        assert!(rl.check("a"));
        rl.remove("a");
        assert!(rl.check("a"));
    }
}
