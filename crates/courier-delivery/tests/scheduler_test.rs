//! Integration tests for the queue scheduler.
//!
//! Validates due-item selection, backoff rescheduling, Retry-After handling
//! and dead-lettering once the retry budget is spent.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    Clock, CoreError, DeadLetterWebhook, DeliveryId, DeliveryOutcome, RealClock, Storage,
    TestClock, Webhook, WebhookDelivery, WebhookId, WebhookPayload, WebhookQueueItem,
};
use courier_delivery::{
    storage::StorageFuture, DeliveryStorage, MemoryDeliveryStorage, PassSummary, QueueScheduler,
    RetryOptions, SchedulerConfig, ServiceConfig, WebhookDeliveryService,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

struct Harness {
    storage: Storage,
    service: Arc<WebhookDeliveryService>,
    scheduler: QueueScheduler,
    clock: TestClock,
}

fn harness() -> Harness {
    let storage = Storage::new();
    let clock = TestClock::new();
    let config = ServiceConfig {
        retry: RetryOptions {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_enabled: false,
            ..RetryOptions::default()
        },
        queue_max_retries: 2,
        ..ServiceConfig::default()
    };
    let service = Arc::new(
        WebhookDeliveryService::new(
            Arc::new(MemoryDeliveryStorage::new(storage.clone())),
            config,
            clock.shared(),
        )
        .unwrap(),
    );
    let scheduler =
        QueueScheduler::new(Arc::clone(&service), SchedulerConfig::default(), clock.shared());

    Harness { storage, service, scheduler, clock }
}

async fn register(storage: &Storage, url: String) -> Webhook {
    let webhook = Webhook::new(url, ["resource.created"]);
    storage.webhooks.create(&webhook).await.unwrap();
    webhook
}

fn payload() -> WebhookPayload {
    WebhookPayload::new("resource.created", json!({"id": 9}))
}

#[tokio::test]
async fn due_item_delivered_and_removed() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let webhook = register(&h.storage, server.uri()).await;
    h.service.enqueue(&webhook, payload(), 0, Duration::ZERO).await.unwrap();

    let summary = h.scheduler.process_due().await.unwrap();

    assert_eq!(summary, PassSummary { claimed: 1, delivered: 1, ..PassSummary::default() });
    assert!(h.storage.queue.is_empty().await);
    let stored = h.storage.webhooks.find_by_id(webhook.id).await.unwrap().unwrap();
    assert_eq!(stored.delivery_count, 1);
}

#[tokio::test]
async fn future_item_waits_until_scheduled() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let webhook = register(&h.storage, server.uri()).await;
    h.service.enqueue(&webhook, payload(), 0, Duration::from_secs(60)).await.unwrap();

    assert_eq!(h.scheduler.process_due().await.unwrap().claimed, 0);
    assert_eq!(h.storage.queue.len().await, 1);

    h.clock.advance(Duration::from_secs(60));
    assert_eq!(h.scheduler.process_due().await.unwrap().delivered, 1);
}

#[tokio::test]
async fn higher_priority_runs_first_at_same_time() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let h = harness();
    let low = register(&h.storage, format!("{}/low", server.uri())).await;
    let high = register(&h.storage, format!("{}/high", server.uri())).await;
    h.service.enqueue(&low, payload(), 0, Duration::ZERO).await.unwrap();
    h.service.enqueue(&high, payload(), 10, Duration::ZERO).await.unwrap();

    h.scheduler.process_due().await.unwrap();

    let paths: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(paths, vec!["/high", "/low"]);
}

#[tokio::test]
async fn failures_back_off_then_dead_letter() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let h = harness();
    let webhook = register(&h.storage, server.uri()).await;
    let queued = h.service.enqueue(&webhook, payload(), 0, Duration::ZERO).await.unwrap();
    let start = h.clock.now_utc();

    assert_eq!(h.scheduler.process_due().await.unwrap().rescheduled, 1);
    let item = h.storage.queue.find_by_id(queued).await.unwrap().unwrap();
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.scheduled_for - start, chrono::Duration::milliseconds(100));

    // Not due yet.
    assert_eq!(h.scheduler.process_due().await.unwrap().claimed, 0);

    h.clock.advance(Duration::from_millis(100));
    assert_eq!(h.scheduler.process_due().await.unwrap().rescheduled, 1);
    let item = h.storage.queue.find_by_id(queued).await.unwrap().unwrap();
    assert_eq!(item.retry_count, 2);

    h.clock.advance(Duration::from_millis(200));
    assert_eq!(h.scheduler.process_due().await.unwrap().dead_lettered, 1);
    assert!(h.storage.queue.is_empty().await);

    let dead_letters = h.storage.dead_letters.find_by_webhook(webhook.id).await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    let numbers: Vec<u32> =
        dead_letters[0].delivery_attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(dead_letters[0].failure_reason.contains("503"));
}

#[tokio::test]
async fn retry_after_extends_backoff() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "120"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let webhook = register(&h.storage, server.uri()).await;
    let queued = h.service.enqueue(&webhook, payload(), 0, Duration::ZERO).await.unwrap();
    let start = h.clock.now_utc();

    h.scheduler.process_due().await.unwrap();

    let item = h.storage.queue.find_by_id(queued).await.unwrap().unwrap();
    assert_eq!(item.scheduled_for - start, chrono::Duration::seconds(120));
}

#[tokio::test]
async fn client_error_dead_letters_immediately() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let webhook = register(&h.storage, server.uri()).await;
    h.service.enqueue(&webhook, payload(), 0, Duration::ZERO).await.unwrap();

    let summary = h.scheduler.process_due().await.unwrap();
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(h.storage.dead_letters.count().await, 1);
}

#[tokio::test]
async fn missing_or_inactive_webhook_discarded() {
    let h = harness();
    let now = Utc::now();

    let orphan = WebhookQueueItem::new(WebhookId::new(), payload(), now, now);
    h.storage.queue.enqueue(&orphan).await.unwrap();

    let inactive = Webhook::new("https://inactive.example/hook", ["resource.created"])
        .with_active(false);
    h.storage.webhooks.create(&inactive).await.unwrap();
    let parked = WebhookQueueItem::new(inactive.id, payload(), now, now);
    h.storage.queue.enqueue(&parked).await.unwrap();

    h.clock.advance(Duration::from_secs(1));
    let summary = h.scheduler.process_due().await.unwrap();
    assert_eq!(summary, PassSummary { claimed: 2, discarded: 2, ..PassSummary::default() });

    // Nothing was attempted, so nothing is dead-lettered.
    assert_eq!(h.storage.dead_letters.count().await, 0);
    assert!(h.storage.queue.is_empty().await);
}

/// Delegates to the in-memory storage but cannot write dead letters.
struct DeadLetterOutage(MemoryDeliveryStorage);

impl DeliveryStorage for DeadLetterOutage {
    fn find_webhook(&self, id: WebhookId) -> StorageFuture<'_, Option<Webhook>> {
        self.0.find_webhook(id)
    }

    fn find_webhooks_by_event(&self, event: String) -> StorageFuture<'_, Vec<Webhook>> {
        self.0.find_webhooks_by_event(event)
    }

    fn create_delivery(&self, delivery: WebhookDelivery) -> StorageFuture<'_, ()> {
        self.0.create_delivery(delivery)
    }

    fn update_delivery(&self, delivery: WebhookDelivery) -> StorageFuture<'_, ()> {
        self.0.update_delivery(delivery)
    }

    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<WebhookDelivery>> {
        self.0.find_delivery(id)
    }

    fn record_webhook_outcome(
        &self,
        id: WebhookId,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, Webhook> {
        self.0.record_webhook_outcome(id, outcome, at)
    }

    fn find_idempotent_delivery(&self, key: String) -> StorageFuture<'_, Option<WebhookDelivery>> {
        self.0.find_idempotent_delivery(key)
    }

    fn store_idempotent_delivery(
        &self,
        key: String,
        delivery: WebhookDelivery,
    ) -> StorageFuture<'_, ()> {
        self.0.store_idempotent_delivery(key, delivery)
    }

    fn enqueue(&self, item: WebhookQueueItem) -> StorageFuture<'_, ()> {
        self.0.enqueue(item)
    }

    fn take_due_queue_items(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<WebhookQueueItem>> {
        self.0.take_due_queue_items(now, limit)
    }

    fn create_dead_letter(&self, _dead_letter: DeadLetterWebhook) -> StorageFuture<'_, ()> {
        Box::pin(async { Err(CoreError::Storage("dead-letter store unavailable".to_string())) })
    }
}

#[tokio::test]
async fn storage_failure_returns_item_to_queue() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Storage::new();
    let clock = TestClock::new();
    let service = Arc::new(
        WebhookDeliveryService::new(
            Arc::new(DeadLetterOutage(MemoryDeliveryStorage::new(storage.clone()))),
            ServiceConfig::default(),
            clock.shared(),
        )
        .unwrap(),
    );
    let scheduler =
        QueueScheduler::new(Arc::clone(&service), SchedulerConfig::default(), clock.shared());

    let webhook = register(&storage, server.uri()).await;
    let queued = service.enqueue(&webhook, payload(), 0, Duration::ZERO).await.unwrap();
    let start = clock.now_utc();

    let summary = scheduler.process_due().await.unwrap();
    assert_eq!(summary, PassSummary { claimed: 1, requeued: 1, ..PassSummary::default() });

    let item = storage.queue.find_by_id(queued).await.unwrap().unwrap();
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.scheduled_for - start, chrono::Duration::seconds(5));
    assert_eq!(storage.dead_letters.count().await, 0);
}

#[tokio::test]
async fn run_loop_stops_on_cancellation() {
    let h = harness();
    let scheduler = Arc::new(QueueScheduler::new(
        Arc::clone(&h.service),
        SchedulerConfig { poll_interval: Duration::from_millis(10), ..SchedulerConfig::default() },
        RealClock::shared(),
    ));

    let token = CancellationToken::new();
    let handle = scheduler.spawn(token.clone());

    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}
