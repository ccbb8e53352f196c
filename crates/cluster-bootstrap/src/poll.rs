//! Readiness polling and retry primitives.
//!
//! Every wait in the bootstrap (HAProxy, Talos API, Kubernetes API, Cilium
//! pods, quorum) goes through [`poll_until`]; every bounded retry (config
//! apply, the bootstrap call) goes through [`retry_async`].

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ui;

/// Parameters for a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    /// Delay between probe invocations.
    pub interval: Duration,
    /// Total time budget.
    pub max_wait: Duration,
    /// Emit a progress line every this many attempts (0 disables).
    pub progress_every: u32,
}

impl PollSpec {
    /// Create a poll spec with progress output every 6 attempts.
    #[must_use]
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval,
            max_wait,
            progress_every: 6,
        }
    }

    /// Set how often progress is reported.
    #[must_use]
    pub fn with_progress_every(mut self, every: u32) -> Self {
        self.progress_every = every;
        self
    }

    /// Upper bound on probe invocations: `max_wait / interval + 1`.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        let budget = self.max_wait.as_millis() / interval;
        u32::try_from(budget).unwrap_or(u32::MAX - 1) + 1
    }
}

/// Result of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The probe returned true.
    Ready { attempts: u32, elapsed: Duration },
    /// The time budget ran out first.
    TimedOut { attempts: u32, elapsed: Duration },
}

impl PollOutcome {
    /// Whether the probe succeeded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Number of probe invocations made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Ready { attempts, .. } | Self::TimedOut { attempts, .. } => *attempts,
        }
    }
}

/// Poll `probe` until it returns true or the budget in `spec` runs out.
///
/// Returns on the first `true` observation. Each invocation is bounded by the
/// remaining budget; a probe that overruns counts as `false`.
pub async fn poll_until<F, Fut>(label: &str, spec: &PollSpec, mut probe: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let deadline = start + spec.max_wait;
    let max_attempts = spec.max_attempts();
    let mut attempts = 0;

    info!(
        "Waiting for {label} (timeout: {}s, interval: {}s)...",
        spec.max_wait.as_secs(),
        spec.interval.as_secs()
    );

    loop {
        attempts += 1;
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(spec.interval);

        let ready = tokio::time::timeout(remaining, probe())
            .await
            .unwrap_or(false);

        if ready {
            let elapsed = start.elapsed();
            debug!(attempts, "{label} ready after {}s", elapsed.as_secs());
            return PollOutcome::Ready { attempts, elapsed };
        }

        if spec.progress_every > 0 && attempts % spec.progress_every == 0 {
            ui::print_progress(&format!(
                "still waiting for {label} ({}s elapsed, attempt {attempts}/{max_attempts})",
                start.elapsed().as_secs()
            ));
        }

        if attempts >= max_attempts || Instant::now() + spec.interval > deadline {
            let elapsed = start.elapsed();
            warn!(attempts, "Timed out waiting for {label} after {}s", elapsed.as_secs());
            return PollOutcome::TimedOut { attempts, elapsed };
        }

        tokio::time::sleep(spec.interval).await;
    }
}

/// Retry configuration for operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A fixed-delay retry policy.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Execute an async function with retry logic.
///
/// # Errors
/// Returns the last error, with context, if all attempts fail.
pub async fn retry_async<T, F, Fut>(config: &RetryConfig, operation_name: &str, mut f: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= config.max_attempts {
                    return Err(e).context(format!(
                        "{operation_name} failed after {attempt} attempts"
                    ));
                }

                let delay = config.delay_for_attempt(attempt);
                info!(
                    "{operation_name} failed (attempt {attempt}/{}): {e:#}. Retrying in {delay:?}...",
                    config.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_max_attempts_bound() {
        let spec = PollSpec::new(Duration::from_secs(5), Duration::from_secs(120));
        assert_eq!(spec.max_attempts(), 25);

        let spec = PollSpec::new(Duration::from_secs(7), Duration::from_secs(20));
        assert_eq!(spec.max_attempts(), 3);

        let spec = PollSpec::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(spec.max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_on_first_true() {
        let calls = Arc::new(AtomicU32::new(0));
        let spec = PollSpec::new(Duration::from_secs(5), Duration::from_secs(60));

        let counter = calls.clone();
        let outcome = poll_until("thing", &spec, move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3 }
        })
        .await;

        assert!(outcome.is_ready());
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_attempt_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let spec = PollSpec::new(Duration::from_secs(5), Duration::from_secs(30));

        let counter = calls.clone();
        let outcome = poll_until("never", &spec, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            }
        })
        .await;

        assert!(!outcome.is_ready());
        assert!(calls.load(Ordering::SeqCst) <= spec.max_attempts());
        assert_eq!(outcome.attempts(), calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_counts_as_not_ready() {
        let spec = PollSpec::new(Duration::from_secs(1), Duration::from_secs(3));
        let outcome = poll_until("hung", &spec, || async {
            std::future::pending::<()>().await;
            true
        })
        .await;

        assert!(!outcome.is_ready());
    }

    #[test]
    fn test_retry_delays() {
        let fixed = RetryConfig::fixed(3, Duration::from_secs(15));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_secs(15));
        assert_eq!(fixed.delay_for_attempt(2), Duration::from_secs(15));

        let backoff = RetryConfig::default();
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_max_attempts() {
        let config = RetryConfig::fixed(3, Duration::from_secs(5));
        let result = retry_async(&config, "Flaky op", |attempt| async move {
            Err::<(), _>(anyhow::anyhow!("attempt {attempt} failed"))
        })
        .await;

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("Flaky op failed after 3 attempts"));
        assert!(format!("{err:#}").contains("attempt 3 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_eventually() {
        let config = RetryConfig::fixed(3, Duration::from_secs(5));
        let value = retry_async(&config, "Flaky op", |attempt| async move {
            if attempt < 2 {
                anyhow::bail!("not yet");
            }
            Ok(attempt)
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
    }
}
