//! Sliding-window rate limiting for the world's admin HTTP surface, adapted
//! from the teacher's `RateLimiter`/`RateLimitConfig` (`src/rate_limit.rs`):
//! same `Mutex<HashMap<String, Vec<Instant>>>` bookkeeping, narrowed here to
//! the single `WorldAuthConfig::admin_rate_max` window instead of the
//! teacher's several per-route configs. The `Retry-After` responder lives on
//! `EngineError::RateLimited` (`src/error.rs`) since every route already
//! returns that error type.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::WorldAuthConfig;

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

pub struct RateLimitInfo {
    pub remaining: usize,
    pub retry_after: Option<Duration>,
}

impl RateLimiter {
    pub fn new(config: &WorldAuthConfig) -> Self {
        Self {
            max_requests: config.admin_rate_max,
            window: Duration::from_secs(config.admin_rate_window_secs),
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records one attempt for `key` and reports whether it's within the
    /// window's budget, pruning timestamps older than the window first.
    pub fn check(&self, key: &str) -> RateLimitInfo {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap();
        let entry = hits.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.max_requests {
            let oldest = entry.first().copied().unwrap_or(now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return RateLimitInfo {
                remaining: 0,
                retry_after: Some(retry_after),
            };
        }

        entry.push(now);
        RateLimitInfo {
            remaining: self.max_requests - entry.len(),
            retry_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_rejects() {
        let config = WorldAuthConfig {
            admin_rate_max: 2,
            admin_rate_window_secs: 60,
            ..WorldAuthConfig::default()
        };
        let limiter = RateLimiter::new(&config);
        assert_eq!(limiter.check("caller1").remaining, 1);
        assert_eq!(limiter.check("caller1").remaining, 0);
        let third = limiter.check("caller1");
        assert_eq!(third.remaining, 0);
        assert!(third.retry_after.is_some());
    }

    #[test]
    fn callers_are_tracked_independently() {
        let config = WorldAuthConfig {
            admin_rate_max: 1,
            admin_rate_window_secs: 60,
            ..WorldAuthConfig::default()
        };
        let limiter = RateLimiter::new(&config);
        limiter.check("a");
        assert_eq!(limiter.check("b").remaining, 0);
    }
}
