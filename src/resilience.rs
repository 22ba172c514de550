//! Retry with bounded exponential backoff.
//!
//! Used by the connector factory when establishing sessions. The sleep between
//! attempts goes through a [`Sleeper`] so tests can observe the computed
//! delays without waiting for them.

use crate::constants::{
    DEFAULT_RETRY_INITIAL_DELAY, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_DELAY,
    DEFAULT_RETRY_MULTIPLIER,
};
use crate::error::ProviderError;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Whether to add +/- 25% jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::connection()
    }
}

impl RetryConfig {
    /// Create a retry config with no retries (just execute once).
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::connection()
        }
    }

    /// Retry policy for session establishment: 3 attempts, 1s base, capped at 10s.
    pub fn connection() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_delay: DEFAULT_RETRY_INITIAL_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            jitter: true,
        }
    }

    /// Build from `MSSQL_RETRY_*` variables read through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::connection();

        if let Some(n) = lookup("MSSQL_RETRY_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            config.max_attempts = n;
        }
        if let Some(ms) = lookup("MSSQL_RETRY_INITIAL_DELAY_MS").and_then(|v| v.parse().ok()) {
            config.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup("MSSQL_RETRY_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(m) = lookup("MSSQL_RETRY_MULTIPLIER").and_then(|v| v.parse().ok()) {
            config.multiplier = m;
        }
        if let Some(j) = lookup("MSSQL_RETRY_JITTER") {
            config.jitter = j.eq_ignore_ascii_case("true") || j == "1";
        }

        config
    }

    /// Create configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Calculate the delay before a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay_ms = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);

        let capped_delay_ms = base_delay_ms.min(self.max_delay.as_millis() as f64);

        let final_delay_ms = if self.jitter {
            let jitter_factor = 0.75 + (rand_jitter() * 0.5);
            capped_delay_ms * jitter_factor
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms as u64)
    }
}

/// Pseudo-random factor between 0.0 and 1.0 taken from the clock.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    (nanos as f64) / (u32::MAX as f64)
}

/// Injectable sleep used between retry attempts.
#[derive(Clone)]
pub struct Sleeper(Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>);

impl Sleeper {
    /// Sleep on the tokio timer.
    pub fn tokio() -> Self {
        Self(Arc::new(|delay| Box::pin(tokio::time::sleep(delay))))
    }

    /// Use a custom sleep function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub async fn sleep(&self, delay: Duration) {
        (self.0)(delay).await
    }
}

impl Default for Sleeper {
    fn default() -> Self {
        Self::tokio()
    }
}

impl fmt::Debug for Sleeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sleeper")
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub struct RetryResult<T> {
    /// The successful result, if any.
    pub value: Option<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub total_duration: Duration,
    /// The last error, if the operation failed.
    pub last_error: Option<ProviderError>,
}

impl<T> RetryResult<T> {
    /// Check if the operation succeeded.
    pub fn is_success(&self) -> bool {
        self.value.is_some()
    }

    /// Convert to a standard Result.
    pub fn into_result(self) -> Result<T, ProviderError> {
        match self.value {
            Some(v) => Ok(v),
            None => Err(self
                .last_error
                .unwrap_or_else(|| ProviderError::internal("Retry failed with no error captured"))),
        }
    }
}

/// Execute an async operation with retry logic.
///
/// Only errors for which [`ProviderError::is_transient`] holds are retried.
/// Authentication and configuration failures return after the first attempt.
pub async fn retry_async<F, Fut, T>(
    config: &RetryConfig,
    sleeper: &Sleeper,
    operation: F,
) -> RetryResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let start = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt);
            debug!(attempt = attempt + 1, ?delay, "retrying after backoff");
            sleeper.sleep(delay).await;
        }

        match operation().await {
            Ok(value) => {
                return RetryResult {
                    value: Some(value),
                    attempts: attempt + 1,
                    total_duration: start.elapsed(),
                    last_error: None,
                };
            }
            Err(e) => {
                if !e.is_transient() {
                    debug!(error = %e, "non-transient error, not retrying");
                    return RetryResult {
                        value: None,
                        attempts: attempt + 1,
                        total_duration: start.elapsed(),
                        last_error: Some(e),
                    };
                }

                warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    error = %e,
                    "transient error"
                );
                last_error = Some(e);
            }
        }
    }

    RetryResult {
        value: None,
        attempts: max_attempts,
        total_duration: start.elapsed(),
        last_error,
    }
}

/// Retry wrapper returning a plain Result.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    sleeper: &Sleeper,
    operation: F,
) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    retry_async(config, sleeper, operation).await.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSleeper;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            jitter: false,
            ..RetryConfig::connection()
        }
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert!(config.jitter);
    }

    #[test]
    fn test_delay_calculation() {
        let config = no_jitter(5);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::connection();
        for _ in 0..20 {
            let delay = config.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(1500));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn test_from_lookup() {
        let config = RetryConfig::from_lookup(|key| match key {
            "MSSQL_RETRY_MAX_ATTEMPTS" => Some("5".to_string()),
            "MSSQL_RETRY_INITIAL_DELAY_MS" => Some("250".to_string()),
            "MSSQL_RETRY_JITTER" => Some("false".to_string()),
            _ => None,
        });
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert!(!config.jitter);
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let sleeper = RecordingSleeper::new();
        let counter = AtomicU32::new(0);

        let result = retry_async(&no_jitter(3), &sleeper.sleeper(), || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ProviderError>("connected")
        })
        .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_backoff_delays_are_observable() {
        let sleeper = RecordingSleeper::new();
        let counter = AtomicU32::new(0);

        let result = retry_async(&no_jitter(3), &sleeper.sleeper(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProviderError::connection("refused")) }
        })
        .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert!(matches!(
            result.into_result(),
            Err(ProviderError::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let sleeper = RecordingSleeper::new();
        let counter = AtomicU32::new(0);

        let result = with_retry(&no_jitter(3), &sleeper.sleeper(), || {
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if count < 3 {
                    Err(ProviderError::timeout(30))
                } else {
                    Ok("connected")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(sleeper.delays().len(), 2);
    }

    #[tokio::test]
    async fn test_authentication_failure_not_retried() {
        let sleeper = RecordingSleeper::new();
        let counter = AtomicU32::new(0);

        let result = retry_async(&no_jitter(3), &sleeper.sleeper(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProviderError::auth("Login failed")) }
        })
        .await;

        assert_eq!(result.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let counter = AtomicU32::new(0);
        let result = retry_async(&no_jitter(0), &Sleeper::tokio(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ProviderError>(()) }
        })
        .await;
        assert!(result.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
