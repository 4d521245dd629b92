//! Repository for scheduled deliveries.
//!
//! Items are always read back in schedule order (earliest `scheduled_for`
//! first), never insertion order, because the scheduler picks due work from
//! the front.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    error::{CoreError, Result},
    models::{QueueItemId, WebhookQueueItem},
};

/// In-memory retry queue.
#[derive(Debug, Default)]
pub struct Repository {
    rows: RwLock<HashMap<QueueItemId, WebhookQueueItem>>,
}

impl Repository {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an item, replacing any item with the same ID.
    pub async fn enqueue(&self, item: &WebhookQueueItem) -> Result<QueueItemId> {
        self.rows.write().await.insert(item.id, item.clone());
        Ok(item.id)
    }

    /// Finds an item by ID.
    pub async fn find_by_id(&self, id: QueueItemId) -> Result<Option<WebhookQueueItem>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    /// Returns every item in schedule order.
    pub async fn list(&self) -> Result<Vec<WebhookQueueItem>> {
        let mut items: Vec<WebhookQueueItem> = self.rows.read().await.values().cloned().collect();
        items.sort_by(WebhookQueueItem::schedule_order);
        Ok(items)
    }

    /// Returns up to `limit` items due at `now`, in schedule order.
    pub async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WebhookQueueItem>> {
        let mut items: Vec<WebhookQueueItem> =
            self.rows.read().await.values().filter(|item| item.is_due(now)).cloned().collect();
        items.sort_by(WebhookQueueItem::schedule_order);
        items.truncate(limit);
        Ok(items)
    }

    /// Removes and returns up to `limit` due items in schedule order.
    ///
    /// Claiming under a single write lock keeps concurrent schedulers from
    /// processing the same item twice.
    pub async fn take_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookQueueItem>> {
        let mut rows = self.rows.write().await;
        let mut items: Vec<WebhookQueueItem> =
            rows.values().filter(|item| item.is_due(now)).cloned().collect();
        items.sort_by(WebhookQueueItem::schedule_order);
        items.truncate(limit);

        for item in &items {
            rows.remove(&item.id);
        }
        if !items.is_empty() {
            debug!(claimed = items.len(), remaining = rows.len(), "claimed due queue items");
        }
        Ok(items)
    }

    /// Replaces a queued item.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item is not queued.
    pub async fn update(&self, item: &WebhookQueueItem) -> Result<()> {
        let mut rows = self.rows.write().await;
        let slot = rows
            .get_mut(&item.id)
            .ok_or_else(|| CoreError::NotFound(format!("queue item {}", item.id)))?;
        *slot = item.clone();
        Ok(())
    }

    /// Removes an item, returning whether it was queued.
    pub async fn remove(&self, id: QueueItemId) -> Result<bool> {
        Ok(self.rows.write().await.remove(&id).is_some())
    }

    /// Number of queued items.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}
