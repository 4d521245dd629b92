//! Repository for permanently failed deliveries.
//!
//! Entries are written by the delivery layer and only removed by an operator
//! after remediation or export.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::{
    error::{CoreError, Result},
    models::{DeadLetterId, DeadLetterWebhook, WebhookId},
};

/// In-memory dead-letter queue.
#[derive(Debug, Default)]
pub struct Repository {
    rows: RwLock<HashMap<DeadLetterId, DeadLetterWebhook>>,
}

impl Repository {
    /// Creates an empty dead-letter queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a dead letter.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` if the ID is taken.
    pub async fn create(&self, dead_letter: &DeadLetterWebhook) -> Result<DeadLetterId> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&dead_letter.id) {
            return Err(CoreError::ConstraintViolation(format!(
                "dead letter {} already exists",
                dead_letter.id
            )));
        }
        rows.insert(dead_letter.id, dead_letter.clone());
        Ok(dead_letter.id)
    }

    /// Finds a dead letter by ID.
    pub async fn find_by_id(&self, id: DeadLetterId) -> Result<Option<DeadLetterWebhook>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    /// Lists dead letters, oldest first.
    pub async fn list(&self) -> Result<Vec<DeadLetterWebhook>> {
        let mut rows: Vec<DeadLetterWebhook> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    /// Lists dead letters for one webhook, oldest first.
    pub async fn find_by_webhook(&self, webhook_id: WebhookId) -> Result<Vec<DeadLetterWebhook>> {
        let mut rows: Vec<DeadLetterWebhook> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.webhook_id == webhook_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    /// Removes a dead letter, returning whether it existed.
    pub async fn remove(&self, id: DeadLetterId) -> Result<bool> {
        Ok(self.rows.write().await.remove(&id).is_some())
    }

    /// Serializes every dead letter as a JSON array for operator export.
    pub async fn export(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.list().await?)?)
    }

    /// Number of dead letters.
    pub async fn count(&self) -> usize {
        self.rows.read().await.len()
    }
}
