//! Exponential backoff retry with jitter and error classification.
//!
//! A [`RetryRunner`] re-attempts a fallible async operation up to
//! `max_retries` extra times. Delays grow as
//! `min(max_delay, base_delay * backoff_multiplier^index)` and may be
//! perturbed by `±jitter_factor`. Errors that classify as permanent stop the
//! loop immediately. Inter-attempt sleeps go through the injected [`Clock`]
//! and race the optional cancellation token.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use courier_core::{Clock, RealClock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// HTTP statuses that indicate a transient failure.
pub const RETRYABLE_HTTP_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Whether an HTTP status is worth retrying.
pub fn is_retryable_status(status_code: u16) -> bool {
    RETRYABLE_HTTP_STATUS_CODES.contains(&status_code)
}

/// Classification entry matched against an error's display text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryableError {
    /// Matches when the status digits appear in the message.
    Status(u16),
    /// Matches when the text appears in the message.
    Message(String),
}

impl RetryableError {
    fn matches(&self, message: &str) -> bool {
        match self {
            Self::Status(code) => message.contains(&code.to_string()),
            Self::Message(text) => message.contains(text.as_str()),
        }
    }
}

/// Classification entries for HTTP delivery failures.
pub fn http_retryable_errors() -> Vec<RetryableError> {
    let mut entries: Vec<RetryableError> =
        RETRYABLE_HTTP_STATUS_CODES.iter().copied().map(RetryableError::Status).collect();
    entries.push(RetryableError::Message("timeout".to_string()));
    entries.push(RetryableError::Message("network connection failed".to_string()));
    entries
}

/// Whether `error` should be retried under `retryable_errors`.
///
/// An empty list retries everything. Otherwise the error's display text must
/// contain one of the entries.
pub fn is_retryable_error<E: fmt::Display + ?Sized>(
    error: &E,
    retryable_errors: &[RetryableError],
) -> bool {
    if retryable_errors.is_empty() {
        return true;
    }
    let message = error.to_string();
    retryable_errors.iter().any(|entry| entry.matches(&message))
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Attempts allowed after the first.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the unjittered delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Whether to perturb delays.
    pub jitter_enabled: bool,
    /// Jitter amplitude as a fraction of the delay.
    pub jitter_factor: f64,
    /// Classification list; empty retries everything.
    pub retryable_errors: Vec<RetryableError>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_factor: 0.1,
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryOptions {
    /// Short delays for interactive paths.
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// The defaults.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Long delays for batch work.
    pub fn slow() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            ..Self::default()
        }
    }

    /// Many fast attempts.
    pub fn aggressive() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            ..Self::default()
        }
    }

    /// Standard timing restricted to transient HTTP failures.
    pub fn http_retry() -> Self {
        Self { retryable_errors: http_retryable_errors(), ..Self::default() }
    }

    /// Unjittered delay before retry `index` (0-based).
    pub fn delay_for_attempt(&self, index: u32) -> Duration {
        let exponent = i32::try_from(index).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let cap = self.max_delay.as_nanos() as f64;

        if !raw.is_finite() || raw >= cap {
            self.max_delay
        } else {
            Duration::from_nanos(raw.max(0.0) as u64)
        }
    }

    /// Delay before retry `index` with jitter applied when enabled.
    pub fn jittered_delay(&self, index: u32) -> Duration {
        let delay = self.delay_for_attempt(index);
        if self.jitter_enabled {
            apply_jitter(delay, self.jitter_factor)
        } else {
            delay
        }
    }
}

/// Applies jitter to a duration to prevent thundering herd effects.
///
/// Randomizes the delay by ±jitter_factor percentage, clamped at zero.
/// A non-finite factor, or a result too large for `Duration`, leaves the
/// delay unjittered.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if !jitter_factor.is_finite() || jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::try_from_secs_f64(jittered_secs.max(0.0)).unwrap_or(duration)
}

/// Why a retry loop stopped without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStop {
    /// Every allowed attempt failed.
    Exhausted,
    /// An error classified as permanent.
    NonRetryable,
    /// The cancellation token fired.
    Cancelled,
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError<E> {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// The attempt's error.
    pub error: E,
}

/// Aggregate failure of a retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryError<E> {
    /// Why the loop stopped.
    pub reason: RetryStop,
    /// Attempts started.
    pub attempts: u32,
    /// Every attempt's error, in order.
    pub errors: Vec<AttemptError<E>>,
}

impl<E> RetryError<E> {
    /// The final attempt's error.
    pub fn last_error(&self) -> Option<&E> {
        self.errors.last().map(|attempt| &attempt.error)
    }

    /// Consumes the aggregate and returns the final attempt's error.
    pub fn into_last_error(self) -> Option<E> {
        self.errors.into_iter().last().map(|attempt| attempt.error)
    }

    /// Whether the loop was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.reason == RetryStop::Cancelled
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            RetryStop::Exhausted => write!(f, "operation failed after {} attempts", self.attempts)?,
            RetryStop::NonRetryable => {
                write!(f, "non-retryable error on attempt {}", self.attempts)?;
            },
            RetryStop::Cancelled => write!(f, "cancelled after {} attempts", self.attempts)?,
        }
        match self.last_error() {
            Some(error) => write!(f, ": {error}"),
            None => Ok(()),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last_error().map(|error| error as &(dyn std::error::Error + 'static))
    }
}

/// Non-failing summary of a retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T, E> {
    /// Whether an attempt succeeded.
    pub success: bool,
    /// The successful value.
    pub data: Option<T>,
    /// The aggregate error when no attempt succeeded.
    pub error: Option<RetryError<E>>,
    /// Attempts started.
    pub attempts: u32,
    /// Sum of the delays actually slept.
    pub total_delay: Duration,
}

/// Executes operations under [`RetryOptions`].
#[derive(Debug, Clone)]
pub struct RetryRunner {
    options: RetryOptions,
    clock: Arc<dyn Clock>,
    cancellation: Option<CancellationToken>,
}

impl RetryRunner {
    /// Creates a runner sleeping on `clock`.
    pub fn new(options: RetryOptions, clock: Arc<dyn Clock>) -> Self {
        Self { options, clock, cancellation: None }
    }

    /// Stops retrying and aborts the in-flight attempt when `token` fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// The runner's options.
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Retries errors matching the configured classification list.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when no attempt succeeded.
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let retryable = self.options.retryable_errors.clone();
        self.run_if(operation, move |error: &E| is_retryable_error(error, &retryable)).await
    }

    /// Retries errors accepted by `should_retry`.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when no attempt succeeded.
    pub async fn run_if<T, E, F, Fut, P>(&self, operation: F, should_retry: P) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.execute(operation, should_retry).await.result
    }

    /// Like [`run`](Self::run) but never fails.
    pub async fn run_with_result<T, E, F, Fut>(&self, operation: F) -> RetryOutcome<T, E>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let retryable = self.options.retryable_errors.clone();
        self.run_with_result_if(operation, move |error: &E| is_retryable_error(error, &retryable))
            .await
    }

    /// Like [`run_if`](Self::run_if) but never fails.
    pub async fn run_with_result_if<T, E, F, Fut, P>(
        &self,
        operation: F,
        should_retry: P,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let run = self.execute(operation, should_retry).await;
        match run.result {
            Ok(data) => RetryOutcome {
                success: true,
                data: Some(data),
                error: None,
                attempts: run.attempts,
                total_delay: run.total_delay,
            },
            Err(error) => RetryOutcome {
                success: false,
                data: None,
                error: Some(error),
                attempts: run.attempts,
                total_delay: run.total_delay,
            },
        }
    }

    async fn execute<T, E, F, Fut, P>(&self, mut operation: F, should_retry: P) -> Run<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let total_attempts = self.options.max_retries.saturating_add(1);
        let mut errors = Vec::new();
        let mut total_delay = Duration::ZERO;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match &self.cancellation {
                Some(token) => {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            return Run::stopped(RetryStop::Cancelled, attempt, errors, total_delay);
                        },
                        result = operation() => result,
                    }
                },
                None => operation().await,
            };

            let error = match result {
                Ok(value) => return Run { result: Ok(value), attempts: attempt, total_delay },
                Err(error) => error,
            };

            let retryable = should_retry(&error);
            errors.push(AttemptError { attempt_number: attempt, error });

            if !retryable {
                debug!(attempt, "non-retryable error, giving up");
                return Run::stopped(RetryStop::NonRetryable, attempt, errors, total_delay);
            }
            if attempt >= total_attempts {
                debug!(attempt, "retries exhausted");
                return Run::stopped(RetryStop::Exhausted, attempt, errors, total_delay);
            }

            let delay = self.options.jittered_delay(attempt - 1);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");

            match &self.cancellation {
                Some(token) => {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            return Run::stopped(RetryStop::Cancelled, attempt, errors, total_delay);
                        },
                        () = self.clock.sleep(delay) => {},
                    }
                },
                None => self.clock.sleep(delay).await,
            }
            total_delay += delay;
        }
    }
}

struct Run<T, E> {
    result: Result<T, RetryError<E>>,
    attempts: u32,
    total_delay: Duration,
}

impl<T, E> Run<T, E> {
    fn stopped(
        reason: RetryStop,
        attempts: u32,
        errors: Vec<AttemptError<E>>,
        total_delay: Duration,
    ) -> Self {
        Self { result: Err(RetryError { reason, attempts, errors }), attempts, total_delay }
    }
}

/// Retries `operation` under `options` on the real clock.
///
/// # Errors
///
/// Returns [`RetryError`] when no attempt succeeded.
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation: F,
    options: RetryOptions,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    RetryRunner::new(options, RealClock::shared()).run(operation).await
}

/// Non-failing form of [`retry_with_backoff`].
pub async fn retry_with_result<T, E, F, Fut>(operation: F, options: RetryOptions) -> RetryOutcome<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    RetryRunner::new(options, RealClock::shared()).run_with_result(operation).await
}
