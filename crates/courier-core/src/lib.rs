//! Core domain models, storage and time for webhook delivery.
//!
//! Provides strongly-typed domain primitives, the in-memory repositories the
//! delivery layer persists through, and the `Clock` abstraction every
//! time-dependent component takes. All other crates depend on these
//! foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    circuit_key_for, DeadLetterId, DeadLetterWebhook, DeliveryAttemptRecord, DeliveryId,
    DeliveryOutcome, DeliveryStatus, QueueItemId, SignedPayload, Webhook, WebhookDelivery,
    WebhookId, WebhookPayload, WebhookQueueItem,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
