//! Resilient outbound webhook delivery.
//!
//! Delivers signed webhook payloads to subscriber URLs with per-destination
//! circuit breakers, exponential backoff with jitter, idempotent delivery
//! records and a dead-letter queue for permanent failures.
//!
//! # Architecture
//!
//! Each delivery runs through the same pipeline:
//!
//! 1. **Idempotency** - A repeated key returns the recorded delivery
//! 2. **Signing** - HMAC-SHA256 over the canonical payload, `v1=<hex>`
//! 3. **Circuit Check** - An open breaker fails fast without network I/O
//! 4. **HTTP Delivery** - POST with timeout, retried on transient failures
//! 5. **Recording** - Delivery record, webhook counters and dead letters
//!
//! Deferred deliveries go through the [`QueueScheduler`], which re-queues
//! failures with backoff until their retry budget runs out.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{RealClock, Storage, Webhook, WebhookPayload};
//! use courier_delivery::{MemoryDeliveryStorage, ServiceConfig, WebhookDeliveryService};
//! use serde_json::json;
//!
//! # async fn example() -> courier_delivery::Result<()> {
//! let storage = Storage::new();
//! let webhook = Webhook::new("https://example.com/hooks", ["resource.created"])
//!     .with_secret("whsec_example");
//! storage.webhooks.create(&webhook).await?;
//!
//! let service = WebhookDeliveryService::new(
//!     Arc::new(MemoryDeliveryStorage::new(storage)),
//!     ServiceConfig::default(),
//!     RealClock::shared(),
//! )?;
//!
//! let payload = WebhookPayload::new("resource.created", json!({"id": 42}));
//! let delivered = service.deliver_webhook_with_retry(&webhook, &payload).await?;
//! # let _ = delivered;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod client;
pub mod error;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod signing;
pub mod storage;

pub use circuit::{
    check_circuit_breaker, CircuitBreaker, CircuitBreakerManager, CircuitConfig, CircuitError,
    CircuitState, CircuitStats,
};
pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use retry::{
    is_retryable_error, retry_with_backoff, retry_with_result, RetryError, RetryOptions,
    RetryOutcome, RetryRunner, RetryStop, RetryableError,
};
pub use scheduler::{PassSummary, QueueScheduler, SchedulerConfig};
pub use service::{
    DeliveryOptions, DeliveryReport, DispatchSummary, ServiceConfig, WebhookDeliveryService,
};
pub use signing::{sign_payload, verify_signature, SignatureError};
pub use storage::{DeliveryStorage, MemoryDeliveryStorage};

/// Default batch size for claiming due queue items.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
