//! Retry engine: exponential backoff with jitter around any provider call.

use crate::provider::{ProviderError, ProviderResult};
use gadgeteer_core::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Override hook: decide retryability for errors the default classifier
/// gets wrong for a particular provider.
pub type ShouldRetry = Arc<dyn Fn(&ProviderError) -> bool + Send + Sync>;

/// Observer invoked once when every attempt has failed, before the last
/// error propagates.
pub type OnRetriesExhausted = Arc<dyn Fn(&ProviderError, u32) + Send + Sync>;

/// Wraps a callable in classify-backoff-reattempt behavior.
#[derive(Clone)]
pub struct RetryEngine {
    config: RetryConfig,
    should_retry: Option<ShouldRetry>,
    on_exhausted: Option<OnRetriesExhausted>,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            should_retry: None,
            on_exhausted: None,
        }
    }

    pub fn with_should_retry(mut self, f: ShouldRetry) -> Self {
        self.should_retry = Some(f);
        self
    }

    pub fn with_on_exhausted(mut self, f: OnRetriesExhausted) -> Self {
        self.on_exhausted = Some(f);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn is_retryable(&self, error: &ProviderError) -> bool {
        match &self.should_retry {
            Some(f) => f(error),
            None => error.is_retryable(),
        }
    }

    /// Base backoff for 0-indexed attempt `n`: `min(min_timeout * factor^n,
    /// max_timeout)`, jittered into `[0.5, 1.0]` of itself when `randomize`
    /// is set. A parseable Retry-After hint overrides the computed delay,
    /// capped at `max_retry_after_ms`.
    pub fn backoff_delay(&self, attempt: u32, error: &ProviderError) -> Duration {
        if self.config.respect_retry_after {
            if let Some(hint) = error.retry_delay() {
                return hint.min(Duration::from_millis(self.config.max_retry_after_ms));
            }
        }

        let base = self.config.min_timeout_ms as f64 * self.config.factor.powi(attempt as i32);
        let capped = base.min(self.config.max_timeout_ms as f64);
        let delayed = if self.config.randomize {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_millis(delayed as u64)
    }

    /// Run `attempt` until it succeeds or retries are exhausted. With
    /// `enabled` off, the callable runs exactly once.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let max_attempts = if self.config.enabled {
            self.config.retries + 1
        } else {
            1
        };

        let mut last_error = None;
        for n in 0..max_attempts {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let attempts_left = n + 1 < max_attempts;
                    if attempts_left && self.is_retryable(&error) {
                        let delay = self.backoff_delay(n, &error);
                        debug!(
                            attempt = n + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retrying provider call"
                        );
                        tokio::time::sleep(delay).await;
                        last_error = Some(error);
                    } else {
                        if attempts_left {
                            // Non-retryable: surface immediately
                            return Err(error);
                        }
                        warn!(attempts = max_attempts, error = %error, "retries exhausted");
                        if let Some(observer) = &self.on_exhausted {
                            observer(&error, max_attempts);
                        }
                        return Err(error);
                    }
                }
            }
        }

        // Unreachable with max_attempts >= 1; keep the compiler honest.
        Err(last_error.unwrap_or(ProviderError::Cancelled))
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(retries: u32) -> RetryConfig {
        RetryConfig {
            retries,
            min_timeout_ms: 1,
            max_timeout_ms: 5,
            randomize: false,
            ..Default::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let engine = RetryEngine::new(RetryConfig {
            min_timeout_ms: 100,
            max_timeout_ms: 300,
            factor: 2.0,
            randomize: false,
            ..Default::default()
        });
        let err = ProviderError::Overloaded("overloaded".into());
        assert_eq!(engine.backoff_delay(0, &err), Duration::from_millis(100));
        assert_eq!(engine.backoff_delay(1, &err), Duration::from_millis(200));
        assert_eq!(engine.backoff_delay(2, &err), Duration::from_millis(300));
        assert_eq!(engine.backoff_delay(5, &err), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_in_band() {
        let engine = RetryEngine::new(RetryConfig {
            min_timeout_ms: 1000,
            randomize: true,
            ..Default::default()
        });
        let err = ProviderError::Overloaded("overloaded".into());
        for _ in 0..50 {
            let d = engine.backoff_delay(0, &err).as_millis() as u64;
            assert!((500..=1000).contains(&d), "jittered delay {} out of band", d);
        }
    }

    #[test]
    fn retry_after_hint_overrides_backoff() {
        let engine = RetryEngine::new(RetryConfig {
            min_timeout_ms: 60_000,
            randomize: false,
            ..Default::default()
        });
        let err = ProviderError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(engine.backoff_delay(0, &err), Duration::from_secs(2));
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let engine = RetryEngine::new(RetryConfig {
            max_retry_after_ms: 5_000,
            ..Default::default()
        });
        let err = ProviderError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(engine.backoff_delay(0, &err), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let engine = RetryEngine::new(fast_config(3));
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = engine
            .run(|| {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::Overloaded("capacity".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let engine = RetryEngine::new(fast_config(3));
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: ProviderResult<()> = engine
            .run(|| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(ProviderError::AuthFailed("bad key".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_invokes_observer() {
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        let engine = RetryEngine::new(fast_config(2)).with_on_exhausted(Arc::new(
            move |_error, attempts| {
                assert_eq!(attempts, 3);
                fired_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            },
        ));
        let result: ProviderResult<()> = engine
            .run(|| async { Err(ProviderError::Overloaded("capacity".into())) })
            .await;
        assert!(result.is_err());
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disabled_engine_runs_once() {
        let engine = RetryEngine::new(RetryConfig {
            enabled: false,
            ..fast_config(5)
        });
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: ProviderResult<()> = engine
            .run(|| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(ProviderError::Overloaded("capacity".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_retry_override_wins() {
        let engine = RetryEngine::new(fast_config(2))
            .with_should_retry(Arc::new(|_| false));
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: ProviderResult<()> = engine
            .run(|| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(ProviderError::Overloaded("capacity".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
