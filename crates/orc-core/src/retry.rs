//! Retry policy abstraction and executor.
//!
//! Three policies share one contract: `should_retry`, `retry_delay`,
//! `max_attempts`, `max_duration`, `is_retryable`. [`RetryExecutor`] wraps
//! any fallible async operation with the attempt/delay loop.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::error::OrcError;

/// Substrings (case-insensitive) that classify an error message as a
/// transient, retryable failure.
const DEFAULT_RETRYABLE_SUBSTRINGS: &[&str] = &[
    "connection timeout",
    "connection reset",
    "connection refused",
    "temporary failure",
    "service unavailable",
    "rate limit",
    "too many requests",
    "internal server error",
    "network is unreachable",
    "502 bad gateway",
    "503",
    "504 gateway timeout",
    "throttl",
    "quota exceeded",
];

/// Default retryable-exception classifier shared by [`FixedDelay`] and
/// [`ExponentialBackoff`]. Argument-validation/state-violation errors are
/// not in this list and are therefore not retried.
pub fn is_default_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    DEFAULT_RETRYABLE_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
}

/// One recorded attempt in a [`RetryContext`]'s history.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct RetryContextInner {
    attempts: Vec<AttemptRecord>,
    last_error: Option<String>,
}

/// Running state of one retry-executor invocation: attempt history, elapsed
/// time, last error. Mutated only through `record_success`/`record_failure`,
/// both thread-safe; snapshots returned to callers are immutable clones,
/// observable from other threads via stats getters.
pub struct RetryContext {
    inner: Mutex<RetryContextInner>,
    started: Instant,
}

impl RetryContext {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RetryContextInner::default()),
            started: Instant::now(),
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.inner.lock().unwrap().attempts.len() as u32
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().unwrap().last_error.clone()
    }

    /// Immutable snapshot of the attempt history so far.
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.inner.lock().unwrap().attempts.clone()
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        let attempt = inner.attempts.len() as u32 + 1;
        inner.attempts.push(AttemptRecord {
            attempt,
            timestamp: Utc::now(),
            success: true,
            error: None,
        });
        inner.last_error = None;
    }

    pub fn record_failure(&self, error: String) {
        let mut inner = self.inner.lock().unwrap();
        let attempt = inner.attempts.len() as u32 + 1;
        inner.attempts.push(AttemptRecord {
            attempt,
            timestamp: Utc::now(),
            success: false,
            error: Some(error.clone()),
        });
        inner.last_error = Some(error);
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared contract for retry policies.
pub trait RetryPolicy: Send + Sync {
    fn max_attempts(&self) -> u32;
    fn max_duration(&self) -> Duration;
    fn should_retry(&self, ctx: &RetryContext) -> bool;
    fn retry_delay(&self, ctx: &RetryContext) -> Duration;
    fn is_retryable(&self, message: &str) -> bool;
}

/// Singleton no-retry policy: `max_attempts=1`, never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn max_attempts(&self) -> u32 {
        1
    }

    fn max_duration(&self) -> Duration {
        Duration::MAX
    }

    fn should_retry(&self, _ctx: &RetryContext) -> bool {
        false
    }

    fn retry_delay(&self, _ctx: &RetryContext) -> Duration {
        Duration::ZERO
    }

    fn is_retryable(&self, _message: &str) -> bool {
        false
    }
}

/// Constant-delay retry policy.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    pub max_attempts: u32,
    pub delay: Duration,
    pub max_duration: Duration,
}

impl FixedDelay {
    pub fn new(max_attempts: u32, delay: Duration, max_duration: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            max_duration,
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn max_duration(&self) -> Duration {
        self.max_duration
    }

    fn should_retry(&self, ctx: &RetryContext) -> bool {
        let retryable = ctx
            .last_error()
            .map(|e| self.is_retryable(&e))
            .unwrap_or(true);
        ctx.attempt_count() < self.max_attempts && ctx.elapsed() < self.max_duration && retryable
    }

    fn retry_delay(&self, _ctx: &RetryContext) -> Duration {
        self.delay
    }

    fn is_retryable(&self, message: &str) -> bool {
        is_default_retryable(message)
    }
}

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_duration: Duration,
    pub jitter_enabled: bool,
    pub jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_duration: Duration,
        jitter_enabled: bool,
        jitter_factor: f64,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            max_duration,
            jitter_enabled,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Pure delay computation: `n` is the 0-based post-failure attempt
    /// count. Exposed standalone so the monotonicity/jitter-bound tests can
    /// exercise it without going through a `RetryContext`.
    pub fn base_delay(&self, n: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(n as i32);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms.round() as u64)
    }

    fn jittered_delay(&self, n: u32) -> Duration {
        let base = self.base_delay(n);
        if !self.jitter_enabled || self.jitter_factor == 0.0 {
            return base;
        }
        let lo = 1.0 - self.jitter_factor;
        let hi = 1.0 + self.jitter_factor;
        let factor = rand::thread_rng().gen_range(lo..=hi);
        let millis = (base.as_millis() as f64 * factor).max(0.0);
        Duration::from_millis(millis.round() as u64)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn max_attempts(&self) -> u32 {
        u32::MAX
    }

    fn max_duration(&self) -> Duration {
        self.max_duration
    }

    fn should_retry(&self, ctx: &RetryContext) -> bool {
        let retryable = ctx
            .last_error()
            .map(|e| self.is_retryable(&e))
            .unwrap_or(true);
        ctx.elapsed() < self.max_duration && retryable
    }

    fn retry_delay(&self, ctx: &RetryContext) -> Duration {
        let n = ctx.attempt_count().saturating_sub(1);
        self.jittered_delay(n)
    }

    fn is_retryable(&self, message: &str) -> bool {
        is_default_retryable(message)
    }
}

/// Wraps any fallible async operation with the policy's attempt/delay loop.
/// `operation` receives the 1-based attempt number on each call.
pub struct RetryExecutor<'a> {
    policy: &'a dyn RetryPolicy,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(policy: &'a dyn RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, OrcError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OrcError>>,
    {
        let ctx = RetryContext::new();
        loop {
            let attempt = ctx.attempt_count() + 1;
            match operation(attempt).await {
                Ok(value) => {
                    ctx.record_success();
                    return Ok(value);
                }
                Err(OrcError::Interrupted) => return Err(OrcError::Interrupted),
                Err(err) => {
                    ctx.record_failure(err.to_string());
                    if !self.policy.should_retry(&ctx) {
                        return Err(err);
                    }
                    let delay = self.policy.retry_delay(&ctx);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn no_retry_never_retries() {
        let ctx = RetryContext::new();
        ctx.record_failure("boom".into());
        assert!(!NoRetry.should_retry(&ctx));
        assert_eq!(NoRetry.max_attempts(), 1);
    }

    #[test]
    fn fixed_delay_retries_until_max_attempts() {
        let policy = FixedDelay::new(3, Duration::from_millis(5), Duration::from_secs(60));
        let ctx = RetryContext::new();
        ctx.record_failure("connection reset".into());
        assert!(policy.should_retry(&ctx));
        ctx.record_failure("connection reset".into());
        assert!(!policy.should_retry(&ctx));
    }

    #[test]
    fn non_retryable_message_stops_fixed_delay() {
        let policy = FixedDelay::new(5, Duration::from_millis(5), Duration::from_secs(60));
        let ctx = RetryContext::new();
        ctx.record_failure("invalid argument".into());
        assert!(!policy.should_retry(&ctx));
    }

    #[test]
    fn exponential_backoff_monotonic_until_capped() {
        let policy = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(60),
            false,
            0.0,
        );
        let delays: Vec<Duration> = (0..6).map(|n| policy.base_delay(n)).collect();
        for w in delays.windows(2) {
            assert!(w[0] <= w[1]);
        }
        assert_eq!(delays[5], Duration::from_millis(100));
    }

    #[test]
    fn exponential_backoff_deterministic_without_jitter() {
        let policy = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(1000),
            2.0,
            Duration::from_secs(60),
            false,
            0.0,
        );
        assert_eq!(policy.base_delay(0), Duration::from_millis(10));
        assert_eq!(policy.base_delay(1), Duration::from_millis(20));
        assert_eq!(policy.base_delay(2), Duration::from_millis(40));
        assert_eq!(policy.jittered_delay(2), policy.base_delay(2));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(10_000),
            2.0,
            Duration::from_secs(60),
            true,
            0.3,
        );
        let base = policy.base_delay(1).as_millis() as f64;
        let lo = (base * 0.7).floor() as u128;
        let hi = (base * 1.3).ceil() as u128;
        for _ in 0..50 {
            let d = policy.jittered_delay(1).as_millis();
            assert!(d >= lo && d <= hi, "delay {d} out of [{lo}, {hi}]");
        }
    }

    #[tokio::test]
    async fn executor_succeeds_without_retry() {
        let policy = NoRetry;
        let executor = RetryExecutor::new(&policy);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, OrcError> = executor
            .execute(move |_attempt| {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { Ok("done") }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executor_retries_then_succeeds() {
        let policy = FixedDelay::new(3, Duration::from_millis(1), Duration::from_secs(5));
        let executor = RetryExecutor::new(&policy);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, OrcError> = executor
            .execute(move |_attempt| {
                let n = calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OrcError::AgentInvocation("connection reset".into()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn executor_stops_after_max_attempts() {
        let policy = FixedDelay::new(3, Duration::from_millis(1), Duration::from_secs(5));
        let executor = RetryExecutor::new(&policy);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, OrcError> = executor
            .execute(move |_attempt| {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { Err(OrcError::AgentInvocation("connection reset".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn executor_does_not_retry_interrupted() {
        let policy = FixedDelay::new(5, Duration::from_millis(1), Duration::from_secs(5));
        let executor = RetryExecutor::new(&policy);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, OrcError> = executor
            .execute(move |_attempt| {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { Err(OrcError::Interrupted) }
            })
            .await;
        assert!(matches!(result, Err(OrcError::Interrupted)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
