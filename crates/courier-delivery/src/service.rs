//! Webhook delivery service.
//!
//! Turns a `(webhook, payload)` pair into exactly one recorded delivery
//! outcome: the payload is signed, sent through the destination's circuit
//! breaker, optionally retried, and the result is written to the delivery
//! record, the webhook counters and, for permanent failures, the dead-letter
//! queue.
//!
//! # Flow
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌─────────────────┐   ┌─────────────┐
//! │ Idempotency  │──▶│ RetryRunner │──▶│ CircuitBreaker  │──▶│ HTTP Client │
//! │ key lock     │   └─────────────┘   └─────────────────┘   └─────────────┘
//! └──────────────┘          │
//!                           ▼
//!            delivery record, webhook counters, dead letter
//! ```

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use courier_core::{
    models::{
        circuit_key_for, DeadLetterWebhook, DeliveryAttemptRecord, DeliveryId, DeliveryOutcome,
        DeliveryStatus, QueueItemId, SignedPayload, Webhook, WebhookDelivery, WebhookPayload,
        WebhookQueueItem, DEFAULT_QUEUE_MAX_RETRIES,
    },
    Clock,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    circuit::{CircuitBreaker, CircuitBreakerManager, CircuitConfig, CircuitStats},
    client::{validate_url, ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse},
    error::{DeliveryError, ErrorCategory, Result},
    retry::{RetryError, RetryOptions, RetryRunner, RetryStop},
    signing,
    storage::DeliveryStorage,
};

/// Response message recorded when the circuit blocked every attempt.
pub const CIRCUIT_OPEN_MESSAGE: &str = "circuit breaker open";

/// Response message recorded for cancelled deliveries.
pub const CANCELLED_MESSAGE: &str = "delivery cancelled";

/// Configuration for the delivery service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP client settings.
    pub client: ClientConfig,
    /// Breaker settings applied to every destination.
    pub circuit: CircuitConfig,
    /// Retry policy for `deliver_webhook_with_retry`.
    pub retry: RetryOptions,
    /// Retry budget given to queued deliveries.
    pub queue_max_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            circuit: CircuitConfig::default(),
            retry: RetryOptions::default(),
            queue_max_retries: DEFAULT_QUEUE_MAX_RETRIES,
        }
    }
}

/// Per-call delivery options.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    /// Returns the recorded delivery instead of sending again when set.
    pub idempotency_key: Option<String>,
    /// Retry transient failures and dead-letter permanent ones.
    pub retry: bool,
    /// Aborts the in-flight attempt and any pending retry.
    pub cancellation: Option<CancellationToken>,
}

impl DeliveryOptions {
    /// One attempt, no idempotency key.
    pub fn once() -> Self {
        Self::default()
    }

    /// Retries under the service's retry policy.
    pub fn with_retry() -> Self {
        Self { retry: true, ..Self::default() }
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Everything a delivery produced.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// The completed delivery record.
    pub delivery: WebhookDelivery,
    /// Error of the final attempt, `None` on success.
    pub last_error: Option<DeliveryError>,
    /// Failed HTTP attempts in order.
    pub attempts: Vec<DeliveryAttemptRecord>,
    /// Whether a dead letter was written.
    pub dead_lettered: bool,
    /// Whether the record was returned from the idempotency index.
    pub replayed: bool,
}

impl DeliveryReport {
    /// Whether the delivery succeeded.
    pub fn is_success(&self) -> bool {
        self.delivery.status == DeliveryStatus::Success
    }
}

/// Result of fanning an event out to its subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Webhooks a delivery was started for.
    pub attempted: usize,
    /// Deliveries that succeeded.
    pub succeeded: usize,
    /// Deliveries that failed or could not be started.
    pub failed: usize,
    /// Recorded deliveries, in subscriber order.
    pub deliveries: Vec<DeliveryId>,
}

/// Signs, sends and records webhook deliveries.
pub struct WebhookDeliveryService {
    storage: Arc<dyn DeliveryStorage>,
    client: DeliveryClient,
    circuits: CircuitBreakerManager,
    config: ServiceConfig,
    clock: Arc<dyn Clock>,
    idempotency_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for WebhookDeliveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDeliveryService")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .finish_non_exhaustive()
    }
}

/// Bookkeeping shared by the attempts of one delivery.
#[derive(Default)]
struct AttemptLog {
    http_attempts: AtomicU32,
    calls: AtomicU32,
    failures: Mutex<Vec<DeliveryAttemptRecord>>,
}

impl WebhookDeliveryService {
    /// Creates a service.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = DeliveryClient::new(config.client.clone())?;
        let circuits = CircuitBreakerManager::new(config.circuit.clone(), Arc::clone(&clock));

        Ok(Self {
            storage,
            client,
            circuits,
            config,
            clock,
            idempotency_locks: DashMap::new(),
        })
    }

    /// Service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Breakers guarding each destination.
    pub fn circuit_breakers(&self) -> &CircuitBreakerManager {
        &self.circuits
    }

    /// Storage the service records through.
    pub fn storage(&self) -> &Arc<dyn DeliveryStorage> {
        &self.storage
    }

    /// Makes one delivery attempt.
    ///
    /// Returns whether the destination answered 2xx. Ordinary delivery
    /// failures are recorded and reported as `false`.
    ///
    /// # Errors
    ///
    /// Returns an error only for an invalid webhook or a storage failure.
    pub async fn deliver_webhook(&self, webhook: &Webhook, payload: &WebhookPayload) -> Result<bool> {
        Ok(self.deliver_detailed(webhook, payload, DeliveryOptions::once()).await?.is_success())
    }

    /// Delivers with retries, dead-lettering permanent failures.
    ///
    /// # Errors
    ///
    /// Returns an error only for an invalid webhook or a storage failure.
    pub async fn deliver_webhook_with_retry(
        &self,
        webhook: &Webhook,
        payload: &WebhookPayload,
    ) -> Result<bool> {
        Ok(self
            .deliver_detailed(webhook, payload, DeliveryOptions::with_retry())
            .await?
            .is_success())
    }

    /// Delivers and returns the recorded delivery.
    ///
    /// # Errors
    ///
    /// Returns an error only for an invalid webhook or a storage failure.
    pub async fn deliver(
        &self,
        webhook: &Webhook,
        payload: &WebhookPayload,
        options: DeliveryOptions,
    ) -> Result<WebhookDelivery> {
        Ok(self.deliver_detailed(webhook, payload, options).await?.delivery)
    }

    /// Delivers and returns the full report.
    ///
    /// With an idempotency key, concurrent calls for the same key are
    /// serialized and every call after the first returns the recorded
    /// delivery without sending.
    ///
    /// # Errors
    ///
    /// Returns an error only for an invalid webhook or a storage failure.
    pub async fn deliver_detailed(
        &self,
        webhook: &Webhook,
        payload: &WebhookPayload,
        options: DeliveryOptions,
    ) -> Result<DeliveryReport> {
        validate_url(&webhook.url)?;

        let Some(key) = options.idempotency_key.clone() else {
            return self.execute_delivery(webhook, payload, &options).await;
        };
        if key.is_empty() {
            return Err(DeliveryError::configuration("idempotency key must not be empty"));
        }

        let lock = self.idempotency_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            match self.storage.find_idempotent_delivery(key.clone()).await? {
                Some(recorded) => {
                    debug!(
                        idempotency_key = %key,
                        delivery_id = %recorded.id,
                        "idempotency key already used, returning recorded delivery"
                    );
                    let delivery =
                        self.storage.find_delivery(recorded.id).await?.unwrap_or(recorded);
                    Ok(DeliveryReport {
                        delivery,
                        last_error: None,
                        attempts: Vec::new(),
                        dead_lettered: false,
                        replayed: true,
                    })
                },
                None => self.execute_delivery(webhook, payload, &options).await,
            }
        };
        drop(lock);
        self.idempotency_locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    /// Aggregated breaker stats keyed by `webhook:<url>`.
    pub async fn webhook_delivery_stats(&self) -> HashMap<String, CircuitStats> {
        self.circuits.all_stats().await
    }

    /// Resets the breaker for a destination, returning whether it existed.
    pub async fn reset_circuit_breaker(&self, url: &str) -> bool {
        let reset = self.circuits.reset(&circuit_key_for(url)).await;
        if reset {
            info!(url, "circuit breaker reset by operator");
        }
        reset
    }

    /// Delivers `event` with retries to every active subscribed webhook.
    ///
    /// Deliveries run concurrently. A delivery that fails to start is counted
    /// as failed and logged.
    ///
    /// # Errors
    ///
    /// Returns an error if subscribers cannot be loaded.
    pub async fn dispatch_event(&self, event: &str, data: Value) -> Result<DispatchSummary> {
        let payload = WebhookPayload::at(event, data, self.clock.now_utc());
        let webhooks = self.storage.find_webhooks_by_event(event.to_string()).await?;

        let deliveries = webhooks.iter().filter(|webhook| webhook.active).map(|webhook| {
            self.deliver_detailed(webhook, &payload, DeliveryOptions::with_retry())
        });
        let results = futures::future::join_all(deliveries).await;

        let mut summary = DispatchSummary { attempted: results.len(), ..DispatchSummary::default() };
        for result in results {
            match result {
                Ok(report) => {
                    if report.is_success() {
                        summary.succeeded += 1;
                    } else {
                        summary.failed += 1;
                    }
                    summary.deliveries.push(report.delivery.id);
                },
                Err(e) => {
                    error!(event, error = %e, "failed to start delivery");
                    summary.failed += 1;
                },
            }
        }

        info!(
            event,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "event dispatched"
        );
        Ok(summary)
    }

    /// Schedules a delivery on the queue.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid webhook or a storage failure.
    pub async fn enqueue(
        &self,
        webhook: &Webhook,
        payload: WebhookPayload,
        priority: i32,
        delay: Duration,
    ) -> Result<QueueItemId> {
        validate_url(&webhook.url)?;

        let now = self.clock.now_utc();
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| DeliveryError::configuration(format!("invalid queue delay: {e}")))?;
        let item = WebhookQueueItem::new(webhook.id, payload, now + delay, now)
            .with_priority(priority)
            .with_max_retries(self.config.queue_max_retries);
        let id = item.id;

        self.storage.enqueue(item).await?;
        debug!(webhook_id = %webhook.id, queue_item_id = %id, priority, "delivery queued");
        Ok(id)
    }

    fn idempotency_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let entry = self
            .idempotency_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    async fn execute_delivery(
        &self,
        webhook: &Webhook,
        payload: &WebhookPayload,
        options: &DeliveryOptions,
    ) -> Result<DeliveryReport> {
        let signature = signing::sign_optional(payload, webhook.secret.as_deref())?;
        let mut delivery = WebhookDelivery::new(
            webhook.id,
            SignedPayload::new(payload, signature),
            self.clock.now_utc(),
        );
        delivery.idempotency_key = options.idempotency_key.clone();

        self.storage.create_delivery(delivery.clone()).await?;
        if let Some(key) = &options.idempotency_key {
            self.storage.store_idempotent_delivery(key.clone(), delivery.clone()).await?;
        }

        let request =
            DeliveryRequest::new(delivery.id, webhook.id, &webhook.url, &delivery.payload, 1)?;
        let breaker = self.circuits.get(&webhook.circuit_key());

        let retry_options = if options.retry {
            self.config.retry.clone()
        } else {
            RetryOptions { max_retries: 0, ..self.config.retry.clone() }
        };
        let mut runner = RetryRunner::new(retry_options, Arc::clone(&self.clock));
        if let Some(token) = &options.cancellation {
            runner = runner.with_cancellation(token.clone());
        }

        let log = AttemptLog::default();
        let result = runner
            .run_if(
                || self.attempt(&breaker, &request, &delivery, &log),
                DeliveryError::is_retryable,
            )
            .await;

        let http_attempts = log.http_attempts.load(Ordering::Acquire);
        let attempts = log.failures.into_inner();
        let finished_at = self.clock.now_utc();
        delivery.attempt_count = http_attempts;

        let (outcome, last_error) = match result {
            Ok(response) => {
                delivery.complete(
                    DeliveryOutcome::Success,
                    Some(response.status_code),
                    Some(response.body),
                    finished_at,
                );
                (DeliveryOutcome::Success, None)
            },
            Err(retry_error) => {
                let (code, message, last_error) = failure_details(&retry_error);
                delivery.complete(DeliveryOutcome::Failed, code, Some(message), finished_at);
                (DeliveryOutcome::Failed, last_error)
            },
        };

        self.storage.update_delivery(delivery.clone()).await?;
        if let Some(key) = &options.idempotency_key {
            self.storage.store_idempotent_delivery(key.clone(), delivery.clone()).await?;
        }
        self.storage.record_webhook_outcome(webhook.id, outcome, finished_at).await?;

        let cancelled = matches!(last_error, Some(DeliveryError::Cancelled));
        let dead_lettered =
            options.retry && outcome == DeliveryOutcome::Failed && !cancelled && http_attempts > 0;
        if dead_lettered {
            let reason = last_error
                .as_ref()
                .map_or_else(|| "delivery failed".to_string(), ToString::to_string);
            let dead_letter = DeadLetterWebhook::new(
                webhook.id,
                payload.clone(),
                reason,
                attempts.clone(),
                finished_at,
            );
            self.storage.create_dead_letter(dead_letter).await?;
        }

        match &last_error {
            None => info!(
                webhook_id = %webhook.id,
                delivery_id = %delivery.id,
                attempts = http_attempts,
                "webhook delivered"
            ),
            Some(e) => warn!(
                webhook_id = %webhook.id,
                delivery_id = %delivery.id,
                attempts = http_attempts,
                category = %ErrorCategory::from(e),
                dead_lettered,
                error = %e,
                "webhook delivery failed"
            ),
        }

        Ok(DeliveryReport { delivery, last_error, attempts, dead_lettered, replayed: false })
    }

    /// One pass through the breaker.
    async fn attempt(
        &self,
        breaker: &CircuitBreaker,
        request: &DeliveryRequest,
        delivery: &WebhookDelivery,
        log: &AttemptLog,
    ) -> Result<DeliveryResponse> {
        if log.calls.fetch_add(1, Ordering::AcqRel) > 0 {
            self.mark_retrying(delivery, log).await;
        }

        let result = breaker
            .execute(|| async {
                let attempt_number = log.http_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                let mut request = request.clone();
                request.attempt_number = attempt_number;
                self.client.deliver(request).await?.into_result()
            })
            .await
            .map_err(DeliveryError::from);

        if let Err(e) = &result {
            if !e.is_pre_flight() {
                log.failures.lock().await.push(DeliveryAttemptRecord {
                    attempt_number: log.http_attempts.load(Ordering::Acquire),
                    error: e.to_string(),
                    response_code: e.status_code(),
                    attempted_at: self.clock.now_utc(),
                });
            }
        }
        result
    }

    /// Marks the record as retrying before the next attempt starts.
    async fn mark_retrying(&self, delivery: &WebhookDelivery, log: &AttemptLog) {
        let mut retrying = delivery.clone();
        retrying.status = DeliveryStatus::Retrying;
        retrying.attempt_count = log.http_attempts.load(Ordering::Acquire);
        if let Some(last) = log.failures.lock().await.last() {
            retrying.response_code = last.response_code;
            retrying.response_message = Some(last.error.clone());
        }

        if let Err(e) = self.storage.update_delivery(retrying).await {
            warn!(delivery_id = %delivery.id, error = %e, "failed to mark delivery retrying");
        }
    }
}

/// Response code, message and final error for a failed delivery.
fn failure_details(
    error: &RetryError<DeliveryError>,
) -> (Option<u16>, String, Option<DeliveryError>) {
    if error.reason == RetryStop::Cancelled {
        let code = error.last_error().and_then(DeliveryError::status_code);
        return (code, CANCELLED_MESSAGE.to_string(), Some(DeliveryError::Cancelled));
    }

    match error.last_error() {
        Some(last @ DeliveryError::CircuitOpen { .. }) => {
            (None, CIRCUIT_OPEN_MESSAGE.to_string(), Some(last.clone()))
        },
        Some(last) => {
            let message = match last {
                DeliveryError::ClientError { body, .. } | DeliveryError::ServerError { body, .. }
                    if !body.is_empty() =>
                {
                    format!("{last}: {body}")
                },
                _ => last.to_string(),
            };
            (last.status_code(), message, Some(last.clone()))
        },
        None => (None, error.to_string(), None),
    }
}
