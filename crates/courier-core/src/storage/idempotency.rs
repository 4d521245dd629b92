//! Idempotency index mapping caller keys to the delivery they produced.
//!
//! Entries are immutable: a key bound to one delivery can be refreshed with a
//! newer snapshot of that same delivery but never rebound to another one.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::{
    error::{CoreError, Result},
    models::WebhookDelivery,
};

/// In-memory idempotency index.
#[derive(Debug, Default)]
pub struct Repository {
    rows: RwLock<HashMap<String, WebhookDelivery>>,
}

impl Repository {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the delivery recorded for `key`.
    pub async fn get(&self, key: &str) -> Result<Option<WebhookDelivery>> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    /// Whether `key` has been used.
    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.rows.read().await.contains_key(key))
    }

    /// Binds `key` to `delivery`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an empty key and `ConstraintViolation` if
    /// the key is already bound to a different delivery.
    pub async fn set(&self, key: &str, delivery: &WebhookDelivery) -> Result<()> {
        if key.is_empty() {
            return Err(CoreError::InvalidInput("idempotency key must not be empty".to_string()));
        }

        let mut rows = self.rows.write().await;
        if let Some(existing) = rows.get(key) {
            if existing.id != delivery.id {
                return Err(CoreError::ConstraintViolation(format!(
                    "idempotency key {key} already bound to delivery {}",
                    existing.id
                )));
            }
        }
        rows.insert(key.to_string(), delivery.clone());
        Ok(())
    }

    /// Drops a key, returning whether it existed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.rows.write().await.remove(key).is_some())
    }
}
