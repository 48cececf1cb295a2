//! Network resilience: timeout protection, exponential-backoff retry and
//! per-key rate limiting. Every adapter call that crosses the network goes
//! through [`NetworkHandler`].

pub mod sweeper;

use crate::config::NetworkConfig;
use crate::domain::errors::NetworkError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sliding-window request limiter keyed by caller-supplied strings
/// (typically exchange endpoint classes).
pub struct RateLimiter {
    requests_per_minute: u32,
    burst_limit: u32,
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, burst_limit: u32) -> Self {
        Self {
            requests_per_minute,
            burst_limit,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve one request slot for `key`. On depletion returns
    /// [`NetworkError::RateLimited`] with the wait until a slot frees up.
    pub fn try_acquire(&self, key: &str) -> Result<(), NetworkError> {
        let now = Instant::now();
        let window_start = now - Duration::from_secs(60);
        let burst_start = now - Duration::from_secs(10);

        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let timestamps = windows.entry(key.to_string()).or_default();
        timestamps.retain(|t| *t > window_start);

        let burst_count = timestamps.iter().filter(|t| **t > burst_start).count();
        if burst_count >= self.burst_limit as usize {
            let retry_after = timestamps
                .iter()
                .filter(|t| **t > burst_start)
                .min()
                .map(|t| Duration::from_secs(10).saturating_sub(now - *t))
                .unwrap_or(Duration::from_secs(10));
            warn!("RateLimiter: burst limit hit for '{}'", key);
            return Err(NetworkError::RateLimited { retry_after });
        }

        if timestamps.len() >= self.requests_per_minute as usize {
            let retry_after = timestamps
                .first()
                .map(|t| Duration::from_secs(60).saturating_sub(now - *t))
                .unwrap_or(Duration::from_secs(60));
            warn!("RateLimiter: minute limit hit for '{}'", key);
            return Err(NetworkError::RateLimited { retry_after });
        }

        timestamps.push(now);
        Ok(())
    }
}

/// Call classes carry different timeout budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Query,
    OrderSubmission,
}

pub struct NetworkHandler {
    config: NetworkConfig,
    rate_limiter: RateLimiter,
}

impl NetworkHandler {
    pub fn new(config: NetworkConfig) -> Self {
        let rate_limiter = RateLimiter::new(config.requests_per_minute, config.burst_limit);
        Self { config, rate_limiter }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn timeout_for(&self, class: CallClass) -> Duration {
        match class {
            CallClass::Query => self.config.query_timeout(),
            CallClass::OrderSubmission => self.config.order_timeout(),
        }
    }

    /// Backoff: `base * exponential_base^attempt +/- jitter`, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let raw = base * self.config.exponential_base.powi(attempt as i32);
        let capped = raw.min(self.config.max_delay_ms as f64);

        let with_jitter = if self.config.jitter {
            use rand::Rng;
            let jitter_range = capped * 0.1;
            let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(with_jitter as u64)
    }

    /// Execute `op` with timeout, rate limiting and retry.
    ///
    /// Retryable failures (timeout, connection, 5xx) back off exponentially
    /// up to `max_retries`. A rate-limit response waits `retry_after` and
    /// retries exactly once; everything else surfaces immediately.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        class: CallClass,
        op: F,
    ) -> Result<T, NetworkError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        let timeout = self.timeout_for(class);
        let mut rate_limit_retried = false;
        let mut attempt: u32 = 0;

        loop {
            if let Err(limited) = self.rate_limiter.try_acquire(key) {
                if rate_limit_retried {
                    return Err(limited);
                }
                if let NetworkError::RateLimited { retry_after } = &limited {
                    debug!("NetworkHandler: '{}' rate limited, waiting {:?}", key, retry_after);
                    tokio::time::sleep(*retry_after).await;
                    rate_limit_retried = true;
                    continue;
                }
            }

            let result = match tokio::time::timeout(timeout, op()).await {
                Err(_) => Err(NetworkError::Timeout(timeout)),
                Ok(inner) => inner,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(NetworkError::RateLimited { retry_after }) => {
                    if rate_limit_retried {
                        return Err(NetworkError::RateLimited { retry_after });
                    }
                    warn!("NetworkHandler: '{}' got 429, waiting {:?} then retrying once", key, retry_after);
                    tokio::time::sleep(retry_after).await;
                    rate_limit_retried = true;
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.config.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "NetworkHandler: '{}' attempt {} failed ({}), retrying in {:?}",
                        key,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            query_timeout_secs: 1,
            order_timeout_secs: 1,
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 10,
            exponential_base: 2.0,
            jitter: false,
            requests_per_minute: 100,
            burst_limit: 50,
            hanging_order_threshold_secs: 1800,
            hanging_order_cleanup_interval_secs: 300,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let handler = NetworkHandler::new(test_config());
        let calls = AtomicU32::new(0);

        let result = handler
            .execute("test", CallClass::Query, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(NetworkError::Connection("reset".into()))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_surfaces_immediately() {
        let handler = NetworkHandler::new(test_config());
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = handler
            .execute("test", CallClass::Query, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NetworkError::Client { status: 400, message: "bad request".into() }) }
            })
            .await;

        assert!(matches!(result, Err(NetworkError::Client { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let handler = NetworkHandler::new(test_config());
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = handler
            .execute("test", CallClass::Query, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NetworkError::Server { status: 503, message: "down".into() }) }
            })
            .await;

        assert!(matches!(result, Err(NetworkError::Server { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limited_retries_once() {
        let handler = NetworkHandler::new(test_config());
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = handler
            .execute("test", CallClass::Query, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(NetworkError::RateLimited { retry_after: Duration::from_millis(5) })
                }
            })
            .await;

        assert!(matches!(result, Err(NetworkError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rate_limiter_burst() {
        let limiter = RateLimiter::new(100, 3);
        for _ in 0..3 {
            assert!(limiter.try_acquire("k").is_ok());
        }
        let err = limiter.try_acquire("k").unwrap_err();
        assert!(matches!(err, NetworkError::RateLimited { .. }));

        // Separate keys have separate windows.
        assert!(limiter.try_acquire("other").is_ok());
    }

    #[test]
    fn test_rate_limiter_minute_window() {
        let limiter = RateLimiter::new(5, 100);
        for _ in 0..5 {
            assert!(limiter.try_acquire("k").is_ok());
        }
        assert!(limiter.try_acquire("k").is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut config = test_config();
        config.base_delay_ms = 100;
        config.max_delay_ms = 350;
        let handler = NetworkHandler::new(config);

        assert_eq!(handler.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(handler.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(handler.backoff_delay(2), Duration::from_millis(350));
        assert_eq!(handler.backoff_delay(5), Duration::from_millis(350));
    }
}
