//! In-memory repositories for webhook delivery state.
//!
//! Each repository owns one entity behind its own `RwLock`, so a slow scan of
//! one table never blocks writes to another. The delivery layer reaches these
//! only through its `DeliveryStorage` trait, which keeps the persistence
//! engine swappable.

use std::sync::Arc;

pub mod api_keys;
pub mod dead_letters;
pub mod deliveries;
pub mod idempotency;
pub mod queue;
pub mod webhooks;

/// Container for all repository instances.
///
/// Cloning is cheap and every clone shares the same underlying data.
#[derive(Debug, Clone)]
pub struct Storage {
    /// Webhook subscriptions.
    pub webhooks: Arc<webhooks::Repository>,

    /// Delivery audit records.
    pub deliveries: Arc<deliveries::Repository>,

    /// Scheduled deliveries.
    pub queue: Arc<queue::Repository>,

    /// Permanently failed deliveries.
    pub dead_letters: Arc<dead_letters::Repository>,

    /// Idempotency key index.
    pub idempotency: Arc<idempotency::Repository>,

    /// API keys for the admin surface.
    pub api_keys: Arc<api_keys::Repository>,
}

impl Storage {
    /// Creates empty storage.
    pub fn new() -> Self {
        let webhooks = Arc::new(webhooks::Repository::new());

        Self {
            deliveries: Arc::new(deliveries::Repository::new(webhooks.clone())),
            webhooks,
            queue: Arc::new(queue::Repository::new()),
            dead_letters: Arc::new(dead_letters::Repository::new()),
            idempotency: Arc::new(idempotency::Repository::new()),
            api_keys: Arc::new(api_keys::Repository::new()),
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}
