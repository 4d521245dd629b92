//! Storage abstraction layer for the delivery service.
//!
//! The service and scheduler reach persisted state only through
//! [`DeliveryStorage`], so a persistent backend can replace the in-memory
//! repositories without touching breaker, retry or delivery logic.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{
        DeadLetterWebhook, DeliveryId, DeliveryOutcome, Webhook, WebhookDelivery, WebhookId,
        WebhookQueueItem,
    },
    Storage,
};

/// Boxed future returned by [`DeliveryStorage`] methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the delivery service.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Finds a webhook by ID.
    fn find_webhook(&self, id: WebhookId) -> StorageFuture<'_, Option<Webhook>>;

    /// Finds active webhooks subscribed to `event`.
    fn find_webhooks_by_event(&self, event: String) -> StorageFuture<'_, Vec<Webhook>>;

    /// Creates a delivery record. The webhook must exist.
    fn create_delivery(&self, delivery: WebhookDelivery) -> StorageFuture<'_, ()>;

    /// Replaces a delivery record that has not completed yet.
    fn update_delivery(&self, delivery: WebhookDelivery) -> StorageFuture<'_, ()>;

    /// Finds a delivery by ID.
    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<WebhookDelivery>>;

    /// Applies a delivery outcome to the webhook counters atomically.
    fn record_webhook_outcome(
        &self,
        id: WebhookId,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, Webhook>;

    /// Looks up the delivery bound to an idempotency key.
    fn find_idempotent_delivery(&self, key: String)
        -> StorageFuture<'_, Option<WebhookDelivery>>;

    /// Binds an idempotency key to a delivery.
    ///
    /// Re-binding to the same delivery refreshes the stored snapshot; binding
    /// to a different delivery fails.
    fn store_idempotent_delivery(
        &self,
        key: String,
        delivery: WebhookDelivery,
    ) -> StorageFuture<'_, ()>;

    /// Adds an item to the delivery queue.
    fn enqueue(&self, item: WebhookQueueItem) -> StorageFuture<'_, ()>;

    /// Removes and returns up to `limit` due items in schedule order.
    fn take_due_queue_items(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<WebhookQueueItem>>;

    /// Writes a dead letter.
    fn create_dead_letter(&self, dead_letter: DeadLetterWebhook) -> StorageFuture<'_, ()>;
}

/// [`DeliveryStorage`] backed by the in-memory repositories.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeliveryStorage {
    storage: Storage,
}

impl MemoryDeliveryStorage {
    /// Wraps an existing repository container.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Underlying repositories, for operator tooling and tests.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl DeliveryStorage for MemoryDeliveryStorage {
    fn find_webhook(&self, id: WebhookId) -> StorageFuture<'_, Option<Webhook>> {
        Box::pin(async move { self.storage.webhooks.find_by_id(id).await })
    }

    fn find_webhooks_by_event(&self, event: String) -> StorageFuture<'_, Vec<Webhook>> {
        Box::pin(async move { self.storage.webhooks.find_by_event(&event).await })
    }

    fn create_delivery(&self, delivery: WebhookDelivery) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.deliveries.create(&delivery).await.map(|_| ()) })
    }

    fn update_delivery(&self, delivery: WebhookDelivery) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.deliveries.update(&delivery).await })
    }

    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<WebhookDelivery>> {
        Box::pin(async move { self.storage.deliveries.find_by_id(id).await })
    }

    fn record_webhook_outcome(
        &self,
        id: WebhookId,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, Webhook> {
        Box::pin(async move { self.storage.webhooks.record_outcome(id, outcome, at).await })
    }

    fn find_idempotent_delivery(
        &self,
        key: String,
    ) -> StorageFuture<'_, Option<WebhookDelivery>> {
        Box::pin(async move { self.storage.idempotency.get(&key).await })
    }

    fn store_idempotent_delivery(
        &self,
        key: String,
        delivery: WebhookDelivery,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.idempotency.set(&key, &delivery).await })
    }

    fn enqueue(&self, item: WebhookQueueItem) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.queue.enqueue(&item).await.map(|_| ()) })
    }

    fn take_due_queue_items(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<WebhookQueueItem>> {
        Box::pin(async move { self.storage.queue.take_due(now, limit).await })
    }

    fn create_dead_letter(&self, dead_letter: DeadLetterWebhook) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.dead_letters.create(&dead_letter).await.map(|_| ()) })
    }
}

#[cfg(test)]
mod tests {
    use courier_core::models::{SignedPayload, WebhookPayload};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn adapter_round_trips_through_repositories() {
        let adapter = MemoryDeliveryStorage::default();
        let webhook = Webhook::new("https://example.com/hook", ["resource.created"]);
        adapter.storage().webhooks.create(&webhook).await.unwrap();

        let payload = WebhookPayload::new("resource.created", json!({"id": 1}));
        let delivery =
            WebhookDelivery::new(webhook.id, SignedPayload::new(&payload, None), Utc::now());
        adapter.create_delivery(delivery.clone()).await.unwrap();

        let found = adapter.find_delivery(delivery.id).await.unwrap();
        assert_eq!(found, Some(delivery));

        let subscribed = adapter.find_webhooks_by_event("resource.created".into()).await.unwrap();
        assert_eq!(subscribed.len(), 1);
    }

    #[tokio::test]
    async fn idempotency_binding_is_strict() {
        let adapter = MemoryDeliveryStorage::default();
        let webhook = Webhook::new("https://example.com/hook", ["e"]);
        let payload = SignedPayload::new(&WebhookPayload::new("e", json!(null)), None);

        let first = WebhookDelivery::new(webhook.id, payload.clone(), Utc::now());
        let second = WebhookDelivery::new(webhook.id, payload, Utc::now());

        adapter.store_idempotent_delivery("key-1".into(), first.clone()).await.unwrap();
        adapter.store_idempotent_delivery("key-1".into(), first.clone()).await.unwrap();
        assert!(adapter.store_idempotent_delivery("key-1".into(), second).await.is_err());

        let bound = adapter.find_idempotent_delivery("key-1".into()).await.unwrap();
        assert_eq!(bound.map(|d| d.id), Some(first.id));
    }
}
