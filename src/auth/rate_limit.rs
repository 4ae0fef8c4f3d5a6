//! Per-source-IP auth rate limiting
//!
//! A sliding-window failure counter with lockout. The authorizer consults
//! the limiter before any credential comparison and resets the window on a
//! successful authentication.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Attempt {
    failures: u32,
    first_failure: Instant,
    lockout_until: Option<Instant>,
}

/// Thread-safe auth failure limiter shared across all connections
pub struct RateLimiter {
    max_failures: u32,
    window: Duration,
    lockout: Duration,
    attempts: Mutex<HashMap<IpAddr, Attempt>>,
}

impl RateLimiter {
    pub fn new(max_failures: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            max_failures,
            window,
            lockout,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_args(args: &crate::config::Args) -> Self {
        Self::new(
            args.auth_max_failures,
            Duration::from_secs(args.auth_failure_window_secs),
            Duration::from_secs(args.auth_lockout_secs),
        )
    }

    /// Seconds remaining if the IP is locked out, `None` if it may attempt auth
    pub async fn check(&self, ip: IpAddr) -> Option<u64> {
        let mut map = self.attempts.lock().await;
        if let Some(attempt) = map.get_mut(&ip) {
            if let Some(until) = attempt.lockout_until {
                let now = Instant::now();
                if until > now {
                    return Some((until - now).as_secs().max(1));
                }
                // Lockout expired: forget the history
                map.remove(&ip);
                return None;
            }
            if attempt.first_failure.elapsed() > self.window {
                map.remove(&ip);
            }
        }
        None
    }

    /// Record a failed attempt, starting a lockout once the limit is hit
    pub async fn record_failure(&self, ip: IpAddr) {
        let mut map = self.attempts.lock().await;
        let now = Instant::now();
        let attempt = map.entry(ip).or_insert(Attempt {
            failures: 0,
            first_failure: now,
            lockout_until: None,
        });

        if attempt.first_failure.elapsed() > self.window {
            attempt.failures = 0;
            attempt.first_failure = now;
        }

        attempt.failures += 1;
        if attempt.failures >= self.max_failures {
            attempt.lockout_until = Some(now + self.lockout);
        }
    }

    /// Successful auth resets the window for the IP
    pub async fn reset(&self, ip: IpAddr) {
        self.attempts.lock().await.remove(&ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    fn limiter(max: u32) -> RateLimiter {
        RateLimiter::new(max, Duration::from_secs(60), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_allows_until_limit() {
        let limiter = limiter(3);
        assert_eq!(limiter.check(ip()).await, None);

        limiter.record_failure(ip()).await;
        limiter.record_failure(ip()).await;
        assert_eq!(limiter.check(ip()).await, None);

        limiter.record_failure(ip()).await;
        assert!(limiter.check(ip()).await.is_some());
    }

    #[tokio::test]
    async fn test_reset_clears_history() {
        let limiter = limiter(2);
        limiter.record_failure(ip()).await;
        limiter.reset(ip()).await;
        limiter.record_failure(ip()).await;
        assert_eq!(limiter.check(ip()).await, None);
    }

    #[tokio::test]
    async fn test_lockout_expires() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60), Duration::from_millis(10));
        limiter.record_failure(ip()).await;
        assert!(limiter.check(ip()).await.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.check(ip()).await, None);
    }

    #[tokio::test]
    async fn test_ips_are_independent() {
        let limiter = limiter(1);
        limiter.record_failure(ip()).await;
        assert!(limiter.check(ip()).await.is_some());

        let other: IpAddr = "198.51.100.1".parse().unwrap();
        assert_eq!(limiter.check(other).await, None);
    }
}
