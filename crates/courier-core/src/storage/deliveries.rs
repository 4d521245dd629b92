//! Repository for delivery records.
//!
//! A record is created when a delivery starts and updated in place until it
//! completes. Completed records are an audit trail and are never modified.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::{
    error::{CoreError, Result},
    models::{DeliveryId, WebhookDelivery, WebhookId},
};

/// In-memory delivery repository.
#[derive(Debug)]
pub struct Repository {
    rows: RwLock<HashMap<DeliveryId, WebhookDelivery>>,
    webhooks: Arc<super::webhooks::Repository>,
}

impl Repository {
    /// Creates an empty repository validating against `webhooks`.
    pub fn new(webhooks: Arc<super::webhooks::Repository>) -> Self {
        Self { rows: RwLock::new(HashMap::new()), webhooks }
    }

    /// Stores a new delivery.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the owning webhook does not exist and
    /// `ConstraintViolation` if the ID is taken.
    pub async fn create(&self, delivery: &WebhookDelivery) -> Result<DeliveryId> {
        if self.webhooks.find_by_id(delivery.webhook_id).await?.is_none() {
            return Err(CoreError::NotFound(format!(
                "webhook {} for delivery {}",
                delivery.webhook_id, delivery.id
            )));
        }

        let mut rows = self.rows.write().await;
        if rows.contains_key(&delivery.id) {
            return Err(CoreError::ConstraintViolation(format!(
                "delivery {} already exists",
                delivery.id
            )));
        }
        rows.insert(delivery.id, delivery.clone());
        Ok(delivery.id)
    }

    /// Finds a delivery by ID.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    /// Replaces an in-progress delivery.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown deliveries and `ConstraintViolation`
    /// when the stored record is already completed.
    pub async fn update(&self, delivery: &WebhookDelivery) -> Result<()> {
        let mut rows = self.rows.write().await;
        let slot = rows
            .get_mut(&delivery.id)
            .ok_or_else(|| CoreError::NotFound(format!("delivery {}", delivery.id)))?;

        if slot.is_completed() {
            return Err(CoreError::ConstraintViolation(format!(
                "delivery {} is completed and immutable",
                delivery.id
            )));
        }

        *slot = delivery.clone();
        Ok(())
    }

    /// Lists deliveries for a webhook, oldest first.
    pub async fn find_by_webhook(&self, webhook_id: WebhookId) -> Result<Vec<WebhookDelivery>> {
        let mut deliveries: Vec<WebhookDelivery> = self
            .rows
            .read()
            .await
            .values()
            .filter(|delivery| delivery.webhook_id == webhook_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deliveries)
    }

    /// Lists every delivery, oldest first.
    pub async fn list(&self) -> Result<Vec<WebhookDelivery>> {
        let mut deliveries: Vec<WebhookDelivery> =
            self.rows.read().await.values().cloned().collect();
        deliveries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deliveries)
    }

    /// Number of stored deliveries.
    pub async fn count(&self) -> usize {
        self.rows.read().await.len()
    }
}
