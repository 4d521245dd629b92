//! Circuit breaker implementation for destination failure protection.
//!
//! Provides per-destination circuit breakers that fail fast during outages
//! and test recovery with a bounded number of requests.
//!
//! # Circuit Breaker State Machine
//!
//! ```text
//!                          ┌─────────────────────────┐
//!                          │        CLOSED           │
//!                          │   (Normal Operation)    │
//!                          │                         │
//!                          │ ● All requests allowed  │
//!                          │ ● Counting failures     │
//!                          └─────────────────────────┘
//!                           │                        ▲
//!                           │                        │
//!       failure_threshold   │                        │ success_threshold
//!       consecutive fails   │                        │ trial successes
//!                           ▼                        │
//!    ┌─────────────────────────┐                  ┌───────────────────────┐
//!    │         OPEN            │                  │       HALF-OPEN       │
//!    │      (Fail Fast)        │  timeout elapsed │                       │
//!    │                         │  on next execute │ ● Limited trials      │
//!    │ ● Operation never runs  │ ───────────────▶ │ ● Any failure reopens │
//!    └─────────────────────────┘                  └───────────────────────┘
//! ```
//!
//! The open → half-open transition is lazy: it is evaluated when `execute`
//! is next called, never by a background timer. Checking state never moves
//! it.
//!
//! Every transition starts a new generation. A call that finishes after the
//! generation it was admitted under has ended still counts toward the totals,
//! but it cannot open or close the circuit.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::RealClock;
//! use courier_delivery::circuit::{CircuitBreakerManager, CircuitConfig, CircuitError};
//!
//! # async fn example() {
//! let manager = CircuitBreakerManager::new(CircuitConfig::default(), RealClock::shared());
//! let breaker = manager.get("webhook:https://example.com/hook");
//!
//! let result: Result<u16, CircuitError<String>> =
//!     breaker.execute(|| async { Ok::<_, String>(200) }).await;
//! # }
//! ```

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use courier_core::Clock;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::{DeliveryError, Result};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Trial successes that close a half-open circuit.
    pub success_threshold: u32,
    /// Time an open circuit waits before admitting trials.
    pub timeout: Duration,
    /// Concurrent trials admitted while half-open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_requests: 2,
        }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all requests allowed.
    Closed,
    /// Destination unhealthy - requests fail immediately.
    Open,
    /// Testing recovery - limited requests allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of a breaker for operator tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    /// Current circuit state.
    pub state: CircuitState,
    /// Consecutive failures in the current closed window.
    pub failure_count: u32,
    /// Successes since the last failure or reset.
    pub success_count: u32,
    /// Calls that ran since the last reset.
    pub total_calls: u64,
    /// Calls that failed since the last reset.
    pub total_failures: u64,
    /// Wall-clock time of the last failure.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Wall-clock time of the last success.
    pub last_success_time: Option<DateTime<Utc>>,
    /// `total_failures / total_calls`, 0 when no calls ran.
    pub failure_rate: f64,
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitError<E> {
    /// The circuit rejected the call; the operation never ran.
    #[error("circuit breaker open for {key}")]
    Open {
        /// Breaker key
        key: String,
    },
    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Whether the call was rejected without running.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The operation's error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(error) => Some(error),
        }
    }
}

impl From<CircuitError<DeliveryError>> for DeliveryError {
    fn from(error: CircuitError<DeliveryError>) -> Self {
        match error {
            CircuitError::Open { key } => Self::CircuitOpen { key },
            CircuitError::Inner(inner) => inner,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition; outcomes admitted under an older value are stale.
    generation: u64,
    failure_count: u32,
    success_count: u32,
    total_calls: u64,
    total_failures: u64,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            failure_count: 0,
            success_count: 0,
            total_calls: 0,
            total_failures: 0,
            opened_at: None,
            last_failure_time: None,
            last_success_time: None,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_calls as f64
        }
    }
}

/// Releases a half-open trial slot when the call finishes or is dropped.
struct TrialPermit<'a> {
    in_flight: &'a AtomicU32,
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// State a call was admitted under.
struct Admission<'a> {
    generation: u64,
    _trial: Option<TrialPermit<'a>>,
}

/// A single destination's circuit breaker.
///
/// Admission and bookkeeping are serialized by a per-breaker mutex that is
/// never held while the wrapped operation runs, so slow destinations do not
/// stall unrelated callers of the same breaker longer than a state check.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
    half_open_in_flight: AtomicU32,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(key: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            key: key.into(),
            config,
            clock,
            state: Mutex::new(BreakerState::new()),
            half_open_in_flight: AtomicU32::new(0),
        }
    }

    /// Breaker key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Runs `operation` if the circuit admits it.
    ///
    /// An open circuit returns [`CircuitError::Open`] without invoking
    /// `operation`. Any `Ok` value, including `()` or `None`, counts as a
    /// success; any `Err` counts as a failure and is returned as
    /// [`CircuitError::Inner`].
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let Some(admission) = self.admit().await else {
            return Err(CircuitError::Open { key: self.key.clone() });
        };

        let outcome = operation().await;
        match &outcome {
            Ok(_) => self.on_success(admission.generation).await,
            Err(_) => self.on_failure(admission.generation).await,
        }
        drop(admission);

        outcome.map_err(CircuitError::Inner)
    }

    /// Runs `operation`, substituting `fallback` when the circuit is open or
    /// the operation fails.
    pub async fn execute_with_fallback<T, E, F, Fut, G, GFut>(&self, operation: F, fallback: G) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        G: FnOnce(CircuitError<E>) -> GFut,
        GFut: Future<Output = T>,
    {
        match self.execute(operation).await {
            Ok(value) => value,
            Err(error) => fallback(error).await,
        }
    }

    /// Whether a call would be admitted right now.
    ///
    /// Read-only: an open circuit whose timeout has elapsed reports `true`
    /// but stays open until the next [`execute`](Self::execute).
    pub async fn is_call_permitted(&self) -> bool {
        let state = self.state.lock().await;
        let trials_available = || {
            self.half_open_in_flight.load(Ordering::Acquire) < self.config.half_open_max_requests
        };
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.open_timeout_elapsed(&state) && trials_available(),
            CircuitState::HalfOpen => trials_available(),
        }
    }

    /// Current state without applying the lazy transition.
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Returns a statistics snapshot.
    pub async fn stats(&self) -> CircuitStats {
        let state = self.state.lock().await;
        CircuitStats {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            total_calls: state.total_calls,
            total_failures: state.total_failures,
            last_failure_time: state.last_failure_time,
            last_success_time: state.last_success_time,
            failure_rate: state.failure_rate(),
        }
    }

    /// Forces the breaker closed with zeroed counters and timestamps.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        let generation = state.generation + 1;
        *state = BreakerState::new();
        state.generation = generation;
        tracing::info!(circuit = %self.key, "circuit breaker reset");
    }

    async fn admit(&self) -> Option<Admission<'_>> {
        let mut state = self.state.lock().await;
        if state.state == CircuitState::Open && self.open_timeout_elapsed(&state) {
            self.transition_to_half_open(&mut state);
        }

        let trial = match state.state {
            CircuitState::Closed => None,
            CircuitState::Open => return None,
            CircuitState::HalfOpen => {
                let in_flight = self.half_open_in_flight.load(Ordering::Acquire);
                if in_flight >= self.config.half_open_max_requests {
                    return None;
                }
                self.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
                Some(TrialPermit { in_flight: &self.half_open_in_flight })
            },
        };
        Some(Admission { generation: state.generation, _trial: trial })
    }

    fn open_timeout_elapsed(&self, state: &BreakerState) -> bool {
        let elapsed = state
            .opened_at
            .map_or(Duration::MAX, |opened_at| self.clock.now().saturating_duration_since(opened_at));
        elapsed >= self.config.timeout
    }

    async fn on_success(&self, generation: u64) {
        let mut state = self.state.lock().await;
        state.total_calls += 1;
        state.last_success_time = Some(self.clock.now_utc());

        if generation != state.generation {
            tracing::debug!(circuit = %self.key, "ignoring success admitted before last transition");
            return;
        }

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
                state.success_count += 1;
            },
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition_to_closed(&mut state);
                }
            },
            CircuitState::Open => {},
        }
    }

    async fn on_failure(&self, generation: u64) {
        let mut state = self.state.lock().await;
        state.total_calls += 1;
        state.total_failures += 1;
        state.last_failure_time = Some(self.clock.now_utc());

        if generation != state.generation {
            tracing::debug!(circuit = %self.key, "ignoring failure admitted before last transition");
            return;
        }

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut state);
                }
            },
            CircuitState::HalfOpen => {
                state.failure_count += 1;
                self.transition_to_open(&mut state);
            },
            CircuitState::Open => {},
        }
    }

    fn transition_to_open(&self, state: &mut BreakerState) {
        tracing::warn!(
            circuit = %self.key,
            failures = state.failure_count,
            failure_rate = state.failure_rate(),
            "circuit breaker opening"
        );

        state.state = CircuitState::Open;
        state.generation += 1;
        state.success_count = 0;
        state.opened_at = Some(self.clock.now());
    }

    fn transition_to_half_open(&self, state: &mut BreakerState) {
        tracing::info!(circuit = %self.key, "circuit breaker transitioning to half-open");

        state.state = CircuitState::HalfOpen;
        state.generation += 1;
        state.success_count = 0;
    }

    fn transition_to_closed(&self, state: &mut BreakerState) {
        tracing::info!(circuit = %self.key, "circuit breaker closing - destination recovered");

        state.state = CircuitState::Closed;
        state.generation += 1;
        state.failure_count = 0;
        state.opened_at = None;
    }
}

/// Registry of breakers keyed by destination.
///
/// Breakers are created lazily on first use. The map is sharded, so lookups
/// and creation for unrelated keys never contend on one lock.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    /// Creates a manager whose breakers default to `config`.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, breakers: DashMap::new() }
    }

    /// Returns the breaker for `key`, creating it with the default config.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        self.get_with_config(key, &self.config)
    }

    /// Returns the breaker for `key`, creating it with `config` on first use.
    ///
    /// An existing breaker keeps the configuration it was created with.
    pub fn get_with_config(&self, key: &str, config: &CircuitConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(key.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(key, config.clone(), Arc::clone(&self.clock)))
        });
        Arc::clone(entry.value())
    }

    /// Resets one breaker, returning whether it existed.
    pub async fn reset(&self, key: &str) -> bool {
        let breaker = self.breakers.get(key).map(|entry| Arc::clone(entry.value()));
        match breaker {
            Some(breaker) => {
                breaker.reset().await;
                true
            },
            None => false,
        }
    }

    /// Resets every breaker.
    pub async fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset().await;
        }
    }

    /// Stats for one breaker.
    pub async fn stats(&self, key: &str) -> Option<CircuitStats> {
        let breaker = self.breakers.get(key).map(|entry| Arc::clone(entry.value()))?;
        Some(breaker.stats().await)
    }

    /// Stats for every breaker, keyed by breaker key.
    pub async fn all_stats(&self) -> HashMap<String, CircuitStats> {
        let mut stats = HashMap::new();
        for breaker in self.snapshot() {
            stats.insert(breaker.key().to_string(), breaker.stats().await);
        }
        stats
    }

    /// Number of breakers created so far.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker has been created.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

/// Checks if a delivery should be blocked by circuit breaker.
///
/// Convenience function that returns a circuit breaker error if the request
/// should be blocked, or Ok(()) if it should proceed.
pub async fn check_circuit_breaker(manager: &CircuitBreakerManager, key: &str) -> Result<()> {
    if manager.get(key).is_call_permitted().await {
        Ok(())
    } else {
        Err(DeliveryError::circuit_open(key))
    }
}
