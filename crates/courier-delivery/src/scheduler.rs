//! Queue scheduler for deferred deliveries.
//!
//! Polls the delivery queue for due items and attempts each one once through
//! the [`WebhookDeliveryService`]. Failed items are put back on the queue with
//! a backoff delay until their retry budget runs out, then dead-lettered with
//! the attempt history they accumulated.
//!
//! Items whose webhook is gone or inactive, or that fail before any HTTP
//! attempt, are discarded with a warning rather than dead-lettered. An item
//! whose processing hits a storage error goes back on the queue after
//! `error_backoff`.

use std::{sync::Arc, time::Duration};

use courier_core::{
    models::{DeadLetterWebhook, WebhookQueueItem},
    Clock,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    service::{DeliveryOptions, WebhookDeliveryService},
};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wait between polls when the queue had nothing due.
    pub poll_interval: Duration,
    /// Maximum items claimed per poll.
    pub batch_size: usize,
    /// Wait after a failed poll.
    pub error_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: crate::DEFAULT_BATCH_SIZE,
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Counts from one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Items claimed from the queue.
    pub claimed: usize,
    /// Items delivered successfully.
    pub delivered: usize,
    /// Items put back on the queue.
    pub rescheduled: usize,
    /// Items moved to the dead-letter queue.
    pub dead_lettered: usize,
    /// Items dropped without any delivery attempt.
    pub discarded: usize,
    /// Items returned to the queue after a processing error.
    pub requeued: usize,
}

enum ItemOutcome {
    Delivered,
    Rescheduled,
    DeadLettered,
    Discarded,
}

/// Drains due queue items through the delivery service.
#[derive(Debug)]
pub struct QueueScheduler {
    service: Arc<WebhookDeliveryService>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
}

impl QueueScheduler {
    /// Creates a scheduler.
    pub fn new(
        service: Arc<WebhookDeliveryService>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { service, config, clock }
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Claims and processes one batch of due items.
    ///
    /// Items are processed in queue order. An item whose processing fails is
    /// put back on the queue after `error_backoff`; the rest of the batch
    /// continues.
    ///
    /// # Errors
    ///
    /// Returns an error if due items cannot be claimed.
    pub async fn process_due(&self) -> Result<PassSummary> {
        let now = self.clock.now_utc();
        let items =
            self.service.storage().take_due_queue_items(now, self.config.batch_size).await?;

        let mut summary = PassSummary { claimed: items.len(), ..PassSummary::default() };
        if items.is_empty() {
            return Ok(summary);
        }
        debug!(claimed = items.len(), "processing due queue items");

        for item in items {
            let claimed = item.clone();
            match self.process_item(item).await {
                Ok(ItemOutcome::Delivered) => summary.delivered += 1,
                Ok(ItemOutcome::Rescheduled) => summary.rescheduled += 1,
                Ok(ItemOutcome::DeadLettered) => summary.dead_lettered += 1,
                Ok(ItemOutcome::Discarded) => summary.discarded += 1,
                Err(e) => {
                    error!(queue_item_id = %claimed.id, error = %e, "queue item processing failed");
                    if self.requeue(claimed).await {
                        summary.requeued += 1;
                    }
                },
            }
        }

        Ok(summary)
    }

    /// Polls until `token` is cancelled.
    ///
    /// In-flight deliveries finish before the loop exits.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "queue scheduler starting"
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            match self.process_due().await {
                Ok(summary) if summary.claimed > 0 => {
                    debug!(
                        delivered = summary.delivered,
                        rescheduled = summary.rescheduled,
                        dead_lettered = summary.dead_lettered,
                        discarded = summary.discarded,
                        requeued = summary.requeued,
                        "queue pass completed"
                    );
                },
                Ok(_) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = token.cancelled() => break,
                    }
                },
                Err(e) => {
                    error!(error = %e, "queue poll failed");
                    tokio::select! {
                        () = self.clock.sleep(self.config.error_backoff) => {},
                        () = token.cancelled() => break,
                    }
                },
            }
        }

        info!("queue scheduler stopped");
    }

    /// Runs the scheduler on a new task.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    async fn process_item(&self, mut item: WebhookQueueItem) -> Result<ItemOutcome> {
        let storage = self.service.storage();

        let webhook = match storage.find_webhook(item.webhook_id).await? {
            Some(webhook) if webhook.active => webhook,
            Some(_) => return Ok(discard(&item, "webhook inactive")),
            None => return Ok(discard(&item, "webhook not found")),
        };

        let report = match self
            .service
            .deliver_detailed(&webhook, &item.payload, DeliveryOptions::once())
            .await
        {
            Ok(report) => report,
            Err(e) if e.is_pre_flight() => return Ok(discard(&item, &e.to_string())),
            Err(e) => return Err(e),
        };

        if report.is_success() {
            return Ok(ItemOutcome::Delivered);
        }

        for mut attempt in report.attempts {
            attempt.attempt_number = item.retry_count + 1;
            item.attempt_history.push(attempt);
        }
        let error = report.last_error.unwrap_or_else(|| DeliveryError::internal("delivery failed"));
        let reschedulable =
            error.is_retryable() || matches!(error, DeliveryError::CircuitOpen { .. });

        if !reschedulable || !item.has_retries_left() {
            if item.attempt_history.is_empty() {
                return Ok(discard(&item, &error.to_string()));
            }
            return self.dead_letter(item, &error.to_string()).await;
        }

        let backoff = self.service.config().retry.jittered_delay(item.retry_count);
        let retry_after = error.retry_after_seconds().map_or(Duration::ZERO, Duration::from_secs);
        let delay = backoff.max(retry_after);

        item.retry_count += 1;
        item.scheduled_for = self.clock.now_utc()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        debug!(
            queue_item_id = %item.id,
            retry_count = item.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "rescheduling queued delivery"
        );
        storage.enqueue(item).await?;
        Ok(ItemOutcome::Rescheduled)
    }

    /// Puts a claimed item back after a processing error.
    async fn requeue(&self, mut item: WebhookQueueItem) -> bool {
        item.scheduled_for = self.clock.now_utc()
            + chrono::Duration::from_std(self.config.error_backoff)
                .unwrap_or_else(|_| chrono::Duration::zero());

        match self.service.storage().enqueue(item.clone()).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    queue_item_id = %item.id,
                    webhook_id = %item.webhook_id,
                    error = %e,
                    "failed to return queue item to the queue"
                );
                false
            },
        }
    }

    async fn dead_letter(&self, item: WebhookQueueItem, reason: &str) -> Result<ItemOutcome> {
        warn!(
            queue_item_id = %item.id,
            webhook_id = %item.webhook_id,
            attempts = item.attempt_history.len(),
            reason,
            "moving queued delivery to dead-letter queue"
        );

        let dead_letter = DeadLetterWebhook::new(
            item.webhook_id,
            item.payload,
            reason,
            item.attempt_history,
            self.clock.now_utc(),
        );
        self.service.storage().create_dead_letter(dead_letter).await?;
        Ok(ItemOutcome::DeadLettered)
    }
}

fn discard(item: &WebhookQueueItem, reason: &str) -> ItemOutcome {
    warn!(
        queue_item_id = %item.id,
        webhook_id = %item.webhook_id,
        reason,
        "discarding queued delivery without an attempt"
    );
    ItemOutcome::Discarded
}
