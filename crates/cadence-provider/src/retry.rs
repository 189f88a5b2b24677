use crate::health::ProviderHealthMonitor;
use cadence_core::{CadenceError, CadenceResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Message fragments that mark an unstructured error as transient.
const RETRYABLE_PATTERNS: &[&str] = &["rate limit", "timeout", "503", "unavailable"];

/// Default polling interval of the provider-wait loop.
pub const DEFAULT_PROVIDER_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Backoff policy for transient provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; an operation runs at most `max_retries + 1` times.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Ceiling on any single delay.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
    /// Scale each computed delay by a uniform factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Zero-delay policy, for tests and dry runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
            exponential_base: 1.0,
            jitter: false,
        }
    }

    /// Reject a base delay above the ceiling and a growth factor below 1.
    pub fn validate(&self) -> CadenceResult<()> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(CadenceError::Config(format!(
                "retry base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(CadenceError::Config(format!(
                "retry exponential_base must be >= 1.0, got {}",
                self.exponential_base
            )));
        }
        Ok(())
    }

    /// `min(max_delay, base_delay * exponential_base^attempt)`, without jitter.
    /// Attempt 0 is the delay before the first retry.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.exponential_base.powi(exp);
        let max = self.max_delay_ms as f64;
        let ms = if raw.is_finite() { raw.min(max) } else { max };
        Duration::from_millis(ms as u64)
    }

    /// Delay to sleep before retrying after `err` on `attempt`.
    ///
    /// A retry-after hint carried by the error replaces the computed value.
    pub fn delay_for(&self, attempt: u32, err: &CadenceError) -> Duration {
        if let Some(hint) = err.retry_after() {
            return hint;
        }
        let delay = self.backoff(attempt);
        if self.jitter && !delay.is_zero() {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

/// Whether `err` is transient and worth another attempt.
///
/// Typed provider-unavailable, rate-limit, connection and timeout errors are
/// retryable; the fatal taxonomy is not; anything else is matched against
/// [`RETRYABLE_PATTERNS`] in its message.
pub fn is_retryable(err: &CadenceError) -> bool {
    match err {
        CadenceError::ProviderUnavailable { .. }
        | CadenceError::RateLimited { .. }
        | CadenceError::Connection(_)
        | CadenceError::Timeout(_) => true,
        CadenceError::ContextValidation(_)
        | CadenceError::QualityCheckFailed { .. }
        | CadenceError::MaxRetriesExceeded { .. }
        | CadenceError::TokenBudgetExceeded { .. }
        | CadenceError::Cancelled(_)
        | CadenceError::Validation(_)
        | CadenceError::InvalidTransition { .. } => false,
        other => {
            let lower = other.to_string().to_lowercase();
            RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
        }
    }
}

/// Passed to the `on_retry` hook before each backoff sleep.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    /// Label used in logs.
    pub operation: &'a str,
    /// Zero-based index of the attempt that just failed.
    pub attempt: u32,
    /// Sleep before the next attempt.
    pub delay: Duration,
    /// The failure being retried.
    pub error: &'a CadenceError,
}

/// Hook invoked before each retry.
pub type OnRetry<'a> = &'a (dyn Fn(&RetryAttempt<'_>) + Send + Sync);

enum Step {
    Retry(Duration),
    Fail(CadenceError),
}

/// Classification and history shared by the sync and async loops.
struct RetryLoop<'a> {
    operation: &'a str,
    config: &'a RetryConfig,
    on_retry: Option<OnRetry<'a>>,
    history: Vec<String>,
}

impl<'a> RetryLoop<'a> {
    fn new(operation: &'a str, config: &'a RetryConfig, on_retry: Option<OnRetry<'a>>) -> Self {
        Self {
            operation,
            config,
            on_retry,
            history: Vec::new(),
        }
    }

    fn on_error(&mut self, attempt: u32, err: CadenceError) -> Step {
        if !is_retryable(&err) {
            warn!(
                operation = self.operation,
                attempt,
                error = %err,
                "Non-retryable error"
            );
            return Step::Fail(err);
        }

        self.history.push(err.to_string());
        if attempt >= self.config.max_retries {
            warn!(
                operation = self.operation,
                retries = self.config.max_retries,
                error = %err,
                "Retries exhausted"
            );
            return Step::Fail(CadenceError::MaxRetriesExceeded {
                operation: self.operation.to_string(),
                retries: self.config.max_retries,
                history: std::mem::take(&mut self.history),
            });
        }

        let delay = self.config.delay_for(attempt, &err);
        info!(
            operation = self.operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retryable error, backing off"
        );
        if let Some(hook) = self.on_retry {
            hook(&RetryAttempt {
                operation: self.operation,
                attempt,
                delay,
                error: &err,
            });
        }
        Step::Retry(delay)
    }
}

/// Run `op` until it succeeds, fails fatally or exhausts `config.max_retries`.
///
/// A non-retryable error is returned unchanged after the attempt that raised
/// it. Exhaustion yields [`CadenceError::MaxRetriesExceeded`] carrying every
/// attempt's message.
pub async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    config: &RetryConfig,
    mut op: F,
    on_retry: Option<OnRetry<'_>>,
) -> CadenceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CadenceResult<T>>,
{
    let mut state = RetryLoop::new(operation, config, on_retry);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match state.on_error(attempt, e) {
                Step::Retry(delay) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Step::Fail(e) => return Err(e),
            },
        }
        attempt += 1;
    }
}

/// Like [`retry_with_backoff`], but a fired `cancel` aborts the backoff sleep
/// with [`CadenceError::Cancelled`].
pub async fn retry_with_backoff_cancellable<T, F, Fut>(
    operation: &str,
    config: &RetryConfig,
    mut op: F,
    on_retry: Option<OnRetry<'_>>,
    cancel: &CancellationToken,
) -> CadenceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CadenceResult<T>>,
{
    let mut state = RetryLoop::new(operation, config, on_retry);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match state.on_error(attempt, e) {
                Step::Retry(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(CadenceError::Cancelled(format!(
                                "'{operation}' cancelled during backoff"
                            )));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Step::Fail(e) => return Err(e),
            },
        }
        attempt += 1;
    }
}

/// Blocking twin of [`retry_with_backoff`] for synchronous callers.
/// Sleeps the current thread; do not call from inside an async task.
pub fn retry_with_backoff_blocking<T, F>(
    operation: &str,
    config: &RetryConfig,
    mut op: F,
    on_retry: Option<OnRetry<'_>>,
) -> CadenceResult<T>
where
    F: FnMut() -> CadenceResult<T>,
{
    let mut state = RetryLoop::new(operation, config, on_retry);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => match state.on_error(attempt, e) {
                Step::Retry(delay) => {
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                Step::Fail(e) => return Err(e),
            },
        }
        attempt += 1;
    }
}

/// Observability hooks for the provider-wait loop.
pub trait ProviderWaitObserver: Send + Sync {
    /// The agent started waiting for `provider_id`.
    fn on_waiting(&self, _provider_id: &str) {}
    /// `provider_id` recovered after `waited`.
    fn on_recovered(&self, _provider_id: &str, _waited: Duration) {}
}

/// Observer that ignores every callback.
pub struct NoopWaitObserver;

impl ProviderWaitObserver for NoopWaitObserver {}

/// Retry policy plus provider-availability gating for agent executions.
pub struct RetryCoordinator {
    config: RetryConfig,
    health: Option<Arc<ProviderHealthMonitor>>,
    poll_interval: Duration,
}

impl RetryCoordinator {
    /// Coordinator without health gating.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            health: None,
            poll_interval: DEFAULT_PROVIDER_POLL_INTERVAL,
        }
    }

    /// Gate executions on `health`.
    pub fn with_health(mut self, health: Arc<ProviderHealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// How often a waiting execution re-checks health.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Backoff policy.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// [`retry_with_backoff`] under this coordinator's policy.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        op: F,
        on_retry: Option<OnRetry<'_>>,
    ) -> CadenceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CadenceResult<T>>,
    {
        retry_with_backoff(operation, &self.config, op, on_retry).await
    }

    /// Suspend until `provider_id` is available or `cancel` fires.
    ///
    /// Returns `Ok(false)` when the provider was already available, `Ok(true)`
    /// after a wait. The health monitor is polled every `poll_interval` and
    /// additionally wakes the loop whenever it records a new state.
    pub async fn wait_for_provider(
        &self,
        provider_id: &str,
        cancel: &CancellationToken,
        observer: &dyn ProviderWaitObserver,
    ) -> CadenceResult<bool> {
        let Some(health) = &self.health else {
            return Ok(false);
        };
        if health.is_available(provider_id) {
            return Ok(false);
        }

        let started = Instant::now();
        info!(provider = provider_id, "Provider unavailable, waiting");
        observer.on_waiting(provider_id);

        let changed = health.changes();
        loop {
            let notified = changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if health.is_available(provider_id) {
                let waited = started.elapsed();
                info!(
                    provider = provider_id,
                    waited_ms = waited.as_millis() as u64,
                    "Provider recovered"
                );
                observer.on_recovered(provider_id, waited);
                return Ok(true);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CadenceError::Cancelled(format!(
                        "wait for provider '{provider_id}' cancelled"
                    )));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = &mut notified => {}
            }
        }
    }
}
