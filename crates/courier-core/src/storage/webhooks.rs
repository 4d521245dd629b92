//! Repository for webhook subscriptions.
//!
//! Registration and deletion belong to external admin flows; the delivery
//! layer reads subscriptions and records outcomes through `record_outcome`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    error::{CoreError, Result},
    models::{DeliveryOutcome, Webhook, WebhookId},
};

/// In-memory webhook repository.
#[derive(Debug, Default)]
pub struct Repository {
    rows: RwLock<HashMap<WebhookId, Webhook>>,
}

impl Repository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new webhook.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` if the ID is taken and `InvalidInput`
    /// if the URL is empty.
    pub async fn create(&self, webhook: &Webhook) -> Result<WebhookId> {
        if webhook.url.trim().is_empty() {
            return Err(CoreError::InvalidInput("webhook url must not be empty".to_string()));
        }

        let mut rows = self.rows.write().await;
        if rows.contains_key(&webhook.id) {
            return Err(CoreError::ConstraintViolation(format!(
                "webhook {} already exists",
                webhook.id
            )));
        }
        rows.insert(webhook.id, webhook.clone());
        Ok(webhook.id)
    }

    /// Finds a webhook by ID.
    pub async fn find_by_id(&self, id: WebhookId) -> Result<Option<Webhook>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    /// Lists all webhooks, oldest first.
    pub async fn list(&self) -> Result<Vec<Webhook>> {
        let mut webhooks: Vec<Webhook> = self.rows.read().await.values().cloned().collect();
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(webhooks)
    }

    /// Lists active webhooks subscribed to `event`, oldest first.
    pub async fn find_by_event(&self, event: &str) -> Result<Vec<Webhook>> {
        let mut webhooks: Vec<Webhook> = self
            .rows
            .read()
            .await
            .values()
            .filter(|webhook| webhook.active && webhook.subscribes_to(event))
            .cloned()
            .collect();
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(webhooks)
    }

    /// Replaces a stored webhook.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the webhook does not exist.
    pub async fn update(&self, webhook: &Webhook) -> Result<()> {
        let mut rows = self.rows.write().await;
        let slot = rows
            .get_mut(&webhook.id)
            .ok_or_else(|| CoreError::NotFound(format!("webhook {}", webhook.id)))?;
        *slot = webhook.clone();
        Ok(())
    }

    /// Removes a webhook, returning whether it existed.
    pub async fn delete(&self, id: WebhookId) -> Result<bool> {
        Ok(self.rows.write().await.remove(&id).is_some())
    }

    /// Records a delivery outcome atomically and returns the updated row.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the webhook does not exist.
    pub async fn record_outcome(
        &self,
        id: WebhookId,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> Result<Webhook> {
        let mut rows = self.rows.write().await;
        let webhook =
            rows.get_mut(&id).ok_or_else(|| CoreError::NotFound(format!("webhook {id}")))?;
        webhook.record_outcome(outcome, at);
        Ok(webhook.clone())
    }

    /// Number of stored webhooks.
    pub async fn count(&self) -> usize {
        self.rows.read().await.len()
    }
}
