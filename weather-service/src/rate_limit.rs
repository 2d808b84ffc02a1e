//! Fixed-window rate limiting per client identity.
//!
//! Each identity has one expiring counter. The first admitted request opens
//! a window of `window` length; requests are admitted while the count is
//! below the limit and the counter disappears when the window ends. Bursts of
//! up to twice the limit are possible across a window boundary.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{error, warn};

use crate::error::StoreError;
use crate::metrics::Metrics;

/// Outcome of an atomic increment-and-check on a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub admitted: bool,
    /// Count after this attempt.
    pub count: u32,
    /// Time until the current window closes.
    pub resets_in: Duration,
}

/// Shared store of expiring counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` if its count is below `limit`.
    ///
    /// An absent or expired counter starts a new window of length `window`
    /// with a count of 1.
    async fn increment_below(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowState, StoreError>;

    /// Drop counters whose window has ended.
    async fn purge_expired(&self) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct Counter {
    count: u32,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, Counter>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_below(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowState, StoreError> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        if counters.get(key).is_some_and(|c| c.expires_at <= now) {
            counters.remove(key);
        }

        let counter = counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + window,
        });

        let admitted = counter.count < limit;
        if admitted {
            counter.count += 1;
        }

        Ok(WindowState {
            admitted,
            count: counter.count,
            resets_in: counter.expires_at.saturating_duration_since(now),
        })
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, c| c.expires_at > now);
        Ok((before - counters.len()) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { remaining: u32 },
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn try_admit(&self, identity: &str) -> Admission;

    fn limit(&self) -> u32;

    fn window(&self) -> Duration;

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct FixedWindowRateLimiter {
    store: Arc<dyn CounterStore>,
    limit: u32,
    window: Duration,
    metrics: Arc<Metrics>,
}

impl FixedWindowRateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        limit: u32,
        window_seconds: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            limit,
            window: Duration::from_secs(window_seconds.max(1)),
            metrics,
        }
    }
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    async fn try_admit(&self, identity: &str) -> Admission {
        let key = format!("rate_limit:{}", identity);

        match self
            .store
            .increment_below(&key, self.limit, self.window)
            .await
        {
            Ok(state) if state.admitted => Admission::Admitted {
                remaining: self.limit.saturating_sub(state.count),
            },
            Ok(state) => {
                self.metrics.rate_limit_blocked.inc();
                warn!(client_ip = %identity, "Rate limit exceeded");
                Admission::Rejected {
                    retry_after: state.resets_in,
                }
            }
            Err(e) => {
                // Fail open: a counter outage must not take the API down.
                self.metrics.store_error("rate_limit", "increment");
                error!(client_ip = %identity, error = %e, "Rate limit store unavailable, admitting request");
                Admission::Admitted {
                    remaining: self.limit,
                }
            }
        }
    }

    fn limit(&self) -> u32 {
        self.limit
    }

    fn window(&self) -> Duration {
        self.window
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window_seconds: u64) -> FixedWindowRateLimiter {
        FixedWindowRateLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            limit,
            window_seconds,
            Arc::new(Metrics::new().expect("metrics")),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_rapid_call_is_rejected() {
        let limiter = limiter(5, 60);

        for _ in 0..5 {
            assert!(limiter.try_admit("1.2.3.4").await.is_admitted());
        }
        match limiter.try_admit("1.2.3.4").await {
            Admission::Rejected { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(limiter.metrics.rate_limit_blocked.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn identities_are_counted_separately() {
        let limiter = limiter(1, 60);

        assert!(limiter.try_admit("1.2.3.4").await.is_admitted());
        assert!(!limiter.try_admit("1.2.3.4").await.is_admitted());
        assert!(limiter.try_admit("5.6.7.8").await.is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn window_restarts_after_expiry() {
        let limiter = limiter(2, 60);

        assert!(limiter.try_admit("1.2.3.4").await.is_admitted());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.try_admit("1.2.3.4").await.is_admitted());
        assert!(!limiter.try_admit("1.2.3.4").await.is_admitted());

        // The window is anchored at the first request, not the latest one.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            limiter.try_admit("1.2.3.4").await,
            Admission::Admitted { remaining: 1 }
        );
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment_below(
            &self,
            _key: &str,
            _limit: u32,
            _window: Duration,
        ) -> Result<WindowState, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn purge_expired(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn store_failure_admits_request() {
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let limiter = FixedWindowRateLimiter::new(Arc::new(BrokenStore), 5, 60, metrics.clone());

        assert!(limiter.try_admit("1.2.3.4").await.is_admitted());
        assert_eq!(
            metrics
                .store_errors
                .with_label_values(&["rate_limit", "increment"])
                .get(),
            1
        );
    }
}
