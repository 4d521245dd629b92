//! Repository for API keys.
//!
//! Keys are stored by hash only. The delivery layer never consults them; they
//! exist for the admin surface that registers webhooks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    error::{CoreError, Result},
    models::ApiKeyId,
};

/// Stored API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    /// Unique identifier for the API key
    pub id: ApiKeyId,
    /// Human-readable name for the API key
    pub name: String,
    /// Hashed representation of the key
    pub key_hash: String,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Timestamp when the API key was created
    pub created_at: DateTime<Utc>,
    /// Last successful use
    pub last_used_at: Option<DateTime<Utc>>,
    /// Optional expiration timestamp
    pub expires_at: Option<DateTime<Utc>>,
    /// Set when the key was disabled
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Creates an unexpired, unrevoked key.
    pub fn new(name: impl Into<String>, key_hash: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            id: ApiKeyId::new(),
            name: name.into(),
            key_hash: key_hash.into(),
            scopes,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: None,
            revoked_at: None,
        }
    }

    /// Whether the key may authenticate at `now`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// In-memory API key repository.
#[derive(Debug, Default)]
pub struct Repository {
    rows: RwLock<HashMap<ApiKeyId, ApiKey>>,
}

impl Repository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new API key.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` if the ID or hash is already stored.
    pub async fn create(&self, api_key: &ApiKey) -> Result<ApiKeyId> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&api_key.id)
            || rows.values().any(|existing| existing.key_hash == api_key.key_hash)
        {
            return Err(CoreError::ConstraintViolation(format!(
                "api key {} already exists",
                api_key.id
            )));
        }
        rows.insert(api_key.id, api_key.clone());
        Ok(api_key.id)
    }

    /// Finds an API key by ID.
    pub async fn find_by_id(&self, id: ApiKeyId) -> Result<Option<ApiKey>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    /// Finds an API key by its hash.
    pub async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        Ok(self.rows.read().await.values().find(|key| key.key_hash == key_hash).cloned())
    }

    /// Lists keys, oldest first. Revoked keys are included only on request.
    pub async fn list(&self, include_revoked: bool) -> Result<Vec<ApiKey>> {
        let mut keys: Vec<ApiKey> = self
            .rows
            .read()
            .await
            .values()
            .filter(|key| include_revoked || key.revoked_at.is_none())
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(keys)
    }

    /// Validates a key and updates `last_used_at`.
    ///
    /// Returns `None` for unknown, revoked or expired keys.
    pub async fn touch(&self, key_hash: &str, now: DateTime<Utc>) -> Result<Option<ApiKey>> {
        let mut rows = self.rows.write().await;
        let Some(key) = rows.values_mut().find(|key| key.key_hash == key_hash) else {
            return Ok(None);
        };
        if !key.is_usable(now) {
            return Ok(None);
        }
        key.last_used_at = Some(now);
        Ok(Some(key.clone()))
    }

    /// Revokes a key by hash.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no key has this hash.
    pub async fn revoke(&self, key_hash: &str, at: DateTime<Utc>) -> Result<()> {
        let mut rows = self.rows.write().await;
        let key = rows
            .values_mut()
            .find(|key| key.key_hash == key_hash)
            .ok_or_else(|| CoreError::NotFound("api key".to_string()))?;
        key.revoked_at.get_or_insert(at);
        Ok(())
    }

    /// Deletes a key, returning whether it existed.
    pub async fn delete(&self, id: ApiKeyId) -> Result<bool> {
        Ok(self.rows.write().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_rejects_revoked_and_expired_keys() {
        let repo = Repository::new();
        let now = Utc::now();

        let live = ApiKey::new("live", "hash-live", vec!["webhooks:write".to_string()]);
        let mut expired = ApiKey::new("expired", "hash-expired", Vec::new());
        expired.expires_at = Some(now - chrono::Duration::minutes(1));
        let revoked = ApiKey::new("revoked", "hash-revoked", Vec::new());

        for key in [&live, &expired, &revoked] {
            repo.create(key).await.unwrap();
        }
        repo.revoke("hash-revoked", now).await.unwrap();

        let touched = repo.touch("hash-live", now).await.unwrap().unwrap();
        assert_eq!(touched.last_used_at, Some(now));
        assert!(repo.touch("hash-expired", now).await.unwrap().is_none());
        assert!(repo.touch("hash-revoked", now).await.unwrap().is_none());
        assert!(repo.touch("missing", now).await.unwrap().is_none());

        assert_eq!(repo.list(false).await.unwrap().len(), 2);
        assert_eq!(repo.list(true).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn duplicate_hash_rejected() {
        let repo = Repository::new();
        repo.create(&ApiKey::new("a", "same", Vec::new())).await.unwrap();

        let err = repo.create(&ApiKey::new("b", "same", Vec::new())).await.unwrap_err();
        assert!(matches!(err, CoreError::ConstraintViolation(_)));
    }
}
