//! Sliding-window rate limits.
//!
//! Three bucket families gate run admission: per-user (1 minute), per
//! client IP (1 hour) and per target domain (1 hour). A bucket's window
//! moves once it has fully elapsed; within a window, `try_acquire`
//! increments under the cap or rejects. A periodic sweep drops buckets
//! untouched for twice their window.

use pilot_core::Config;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// How often stale buckets are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Which bucket family a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateScope {
    User,
    Ip,
    Target,
}

impl RateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ip => "ip",
            Self::Target => "target",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for {scope}:{key}: {count}/{limit} in window")]
pub struct RateLimitExceeded {
    pub scope: &'static str,
    pub key: String,
    pub count: u32,
    pub limit: u32,
}

#[derive(Debug)]
struct Bucket {
    window_start: Instant,
    count: u32,
    last_touched: Instant,
}

#[derive(Debug, Clone, Copy)]
struct ScopePolicy {
    window: Duration,
    limit: u32,
}

/// Process-wide rate limiter. Cheap to clone via `Arc` by the caller;
/// buckets live behind one mutex (admission is not a hot path).
#[derive(Debug)]
pub struct RateLimitService {
    buckets: Arc<Mutex<HashMap<(RateScope, String), Bucket>>>,
    user: ScopePolicy,
    ip: ScopePolicy,
    target: ScopePolicy,
    sweeper: Option<JoinHandle<()>>,
}

impl RateLimitService {
    pub fn from_config(config: &Config) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            user: ScopePolicy {
                window: Duration::from_secs(60),
                limit: config.rate_limit_user_per_minute,
            },
            ip: ScopePolicy {
                window: Duration::from_secs(3600),
                limit: config.rate_limit_ip_per_hour,
            },
            target: ScopePolicy {
                window: Duration::from_secs(3600),
                limit: config.rate_limit_target_per_hour,
            },
            sweeper: None,
        }
    }

    fn policy(&self, scope: RateScope) -> ScopePolicy {
        match scope {
            RateScope::User => self.user,
            RateScope::Ip => self.ip,
            RateScope::Target => self.target,
        }
    }

    /// Count one admission attempt against a bucket.
    pub fn try_acquire(&self, scope: RateScope, key: &str) -> Result<(), RateLimitExceeded> {
        let policy = self.policy(scope);
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let bucket = buckets
            .entry((scope, key.to_string()))
            .or_insert_with(|| Bucket {
                window_start: now,
                count: 0,
                last_touched: now,
            });

        // Move the window once it has fully elapsed.
        if now.duration_since(bucket.window_start) >= policy.window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        bucket.last_touched = now;

        if bucket.count >= policy.limit {
            return Err(RateLimitExceeded {
                scope: scope.as_str(),
                key: key.to_string(),
                count: bucket.count,
                limit: policy.limit,
            });
        }
        bucket.count += 1;
        Ok(())
    }

    /// Start the background sweep. Idempotent; call once at daemon start.
    pub fn start_sweeper(&mut self) {
        if self.sweeper.is_some() {
            return;
        }
        let buckets = Arc::clone(&self.buckets);
        let max_idle = [self.user, self.ip, self.target]
            .iter()
            .map(|p| p.window * 2)
            .collect::<Vec<_>>();
        let scopes = [RateScope::User, RateScope::Ip, RateScope::Target];

        self.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut buckets = buckets.lock().unwrap_or_else(|e| e.into_inner());
                let before = buckets.len();
                buckets.retain(|(scope, _), bucket| {
                    let idx = scopes.iter().position(|s| s == scope).unwrap_or(0);
                    now.duration_since(bucket.last_touched) < max_idle[idx]
                });
                let dropped = before - buckets.len();
                if dropped > 0 {
                    debug!(dropped, "swept stale rate-limit buckets");
                }
            }
        }));
    }

    /// Stop the background sweep.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for RateLimitService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> RateLimitService {
        RateLimitService::from_config(&Config::default())
    }

    #[tokio::test]
    async fn user_bucket_caps_at_limit() {
        let limits = service();
        for _ in 0..10 {
            limits.try_acquire(RateScope::User, "user:alice").unwrap();
        }
        let err = limits
            .try_acquire(RateScope::User, "user:alice")
            .unwrap_err();
        assert_eq!(err.scope, "user");
        assert_eq!(err.limit, 10);
    }

    #[tokio::test]
    async fn separate_keys_have_separate_buckets() {
        let limits = service();
        for _ in 0..10 {
            limits.try_acquire(RateScope::User, "user:alice").unwrap();
        }
        // Bob is unaffected by Alice's bucket.
        limits.try_acquire(RateScope::User, "user:bob").unwrap();
        assert_eq!(limits.bucket_count(), 2);
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let limits = service();
        for _ in 0..10 {
            limits.try_acquire(RateScope::User, "x").unwrap();
        }
        // Same key under a different scope still admits.
        limits.try_acquire(RateScope::Ip, "x").unwrap();
        limits.try_acquire(RateScope::Target, "x").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn window_moves_after_elapse() {
        let limits = service();
        for _ in 0..10 {
            limits.try_acquire(RateScope::User, "user:alice").unwrap();
        }
        assert!(limits.try_acquire(RateScope::User, "user:alice").is_err());

        // Advance past the one-minute window; the bucket resets.
        tokio::time::advance(Duration::from_secs(61)).await;
        limits.try_acquire(RateScope::User, "user:alice").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_drops_idle_buckets() {
        let mut limits = service();
        limits.try_acquire(RateScope::User, "user:alice").unwrap();
        limits.start_sweeper();
        assert_eq!(limits.bucket_count(), 1);

        // Two user windows plus a sweep interval.
        tokio::time::advance(Duration::from_secs(2 * 60 + 5 * 60 + 1)).await;
        // Let the sweeper task run.
        tokio::task::yield_now().await;
        assert_eq!(limits.bucket_count(), 0);
        limits.shutdown();
    }

    #[tokio::test]
    async fn ip_and_target_limits_match_config() {
        let mut config = Config::default();
        config.rate_limit_ip_per_hour = 2;
        config.rate_limit_target_per_hour = 3;
        let limits = RateLimitService::from_config(&config);

        limits.try_acquire(RateScope::Ip, "ip:203.0.113.9").unwrap();
        limits.try_acquire(RateScope::Ip, "ip:203.0.113.9").unwrap();
        assert!(limits.try_acquire(RateScope::Ip, "ip:203.0.113.9").is_err());

        for _ in 0..3 {
            limits
                .try_acquire(RateScope::Target, "target:example.com")
                .unwrap();
        }
        assert!(limits
            .try_acquire(RateScope::Target, "target:example.com")
            .is_err());
    }
}
