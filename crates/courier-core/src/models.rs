//! Core domain models and strongly-typed identifiers.
//!
//! Defines webhook subscriptions, payload envelopes, delivery records, queue
//! items and dead letters, plus newtype ID wrappers for compile-time type
//! safety.

use std::{cmp::Ordering, collections::BTreeSet, fmt};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Strongly-typed webhook subscription identifier.
    ///
    /// Every delivery, queue item and dead letter points back to one of these.
    WebhookId
);

uuid_id!(
    /// Identifier of a single delivery record.
    DeliveryId
);

uuid_id!(
    /// Identifier of a scheduled queue item.
    QueueItemId
);

uuid_id!(
    /// Identifier of a dead-lettered delivery.
    DeadLetterId
);

uuid_id!(
    /// Identifier of an API key.
    ApiKeyId
);

/// Event name matching every event.
pub const WILDCARD_EVENT: &str = "*";

/// Formats a timestamp the way it travels on the wire.
///
/// Millisecond precision with a `Z` suffix, e.g. `2024-05-01T12:00:00.000Z`.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Serde adapter keeping payload timestamps in wire format.
pub mod iso8601 {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes with millisecond precision.
    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    /// Accepts any RFC 3339 timestamp.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Final outcome of a delivery as tracked on the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Endpoint answered with a 2xx status.
    Success,
    /// Delivery did not succeed.
    Failed,
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A webhook subscription.
///
/// Registered by an external flow. The delivery layer only touches the
/// counters and the last-delivery fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    /// Unique identifier.
    pub id: WebhookId,
    /// Destination URL.
    pub url: String,
    /// Event names this webhook subscribes to.
    pub events: BTreeSet<String>,
    /// Inactive webhooks are skipped by event fan-out.
    pub active: bool,
    /// Optional HMAC signing key.
    pub secret: Option<String>,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
    /// When the subscription was last modified.
    pub updated_at: DateTime<Utc>,
    /// Successful deliveries so far.
    pub delivery_count: u64,
    /// Failed deliveries so far.
    pub failure_count: u64,
    /// When the last delivery completed.
    pub last_delivery_at: Option<DateTime<Utc>>,
    /// Outcome of the last delivery.
    pub last_delivery_status: Option<DeliveryOutcome>,
}

impl Webhook {
    /// Creates an active, unsigned subscription.
    pub fn new<I, S>(url: impl Into<String>, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: WebhookId::new(),
            url: url.into(),
            events: events.into_iter().map(Into::into).collect(),
            active: true,
            secret: None,
            created_at: now,
            updated_at: now,
            delivery_count: 0,
            failure_count: 0,
            last_delivery_at: None,
            last_delivery_status: None,
        }
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Marks the subscription active or inactive.
    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Whether this webhook wants `event`.
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.contains(event) || self.events.contains(WILDCARD_EVENT)
    }

    /// Key of the circuit breaker guarding this webhook's destination.
    pub fn circuit_key(&self) -> String {
        circuit_key_for(&self.url)
    }

    /// Applies the bookkeeping for a completed delivery.
    pub fn record_outcome(&mut self, outcome: DeliveryOutcome, at: DateTime<Utc>) {
        match outcome {
            DeliveryOutcome::Success => self.delivery_count += 1,
            DeliveryOutcome::Failed => self.failure_count += 1,
        }
        self.last_delivery_status = Some(outcome);
        self.last_delivery_at = Some(at);
        self.updated_at = at;
    }
}

/// Circuit breaker key for a destination URL.
pub fn circuit_key_for(url: &str) -> String {
    format!("webhook:{url}")
}

/// Logical event envelope.
///
/// The timestamp is fixed when the payload is built and reused for every
/// attempt, so retries carry byte-identical signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Event name, e.g. `resource.created`.
    pub event: String,
    /// Arbitrary JSON body, may be `null`.
    pub data: Value,
    /// Construction time.
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    /// Builds a payload stamped with the current time.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self::at(event, data, Utc::now())
    }

    /// Builds a payload with an explicit timestamp.
    pub fn at(event: impl Into<String>, data: Value, timestamp: DateTime<Utc>) -> Self {
        Self { event: event.into(), data, timestamp }
    }

    /// Timestamp as sent in the `X-Webhook-Timestamp` header.
    pub fn timestamp_header(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

/// Payload as sent on the wire and recorded in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPayload {
    /// Event name.
    pub event: String,
    /// Event data.
    pub data: Value,
    /// Construction time of the logical payload.
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
    /// `v1=<hex>` signature, absent when the webhook has no secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl SignedPayload {
    /// Wraps a payload with an optional signature.
    pub fn new(payload: &WebhookPayload, signature: Option<String>) -> Self {
        Self {
            event: payload.event.clone(),
            data: payload.data.clone(),
            timestamp: payload.timestamp,
            signature,
        }
    }

    /// Whether a signature is attached.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Recovers the logical payload.
    pub fn to_payload(&self) -> WebhookPayload {
        WebhookPayload::at(self.event.clone(), self.data.clone(), self.timestamp)
    }
}

/// Lifecycle state of a delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, first attempt not resolved yet.
    Pending,
    /// At least one attempt failed, more are coming.
    Retrying,
    /// Terminal success.
    Success,
    /// Terminal failure.
    Failed,
}

impl DeliveryStatus {
    /// Terminal states freeze the record.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Retrying => write!(f, "retrying"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl From<DeliveryOutcome> for DeliveryStatus {
    fn from(outcome: DeliveryOutcome) -> Self {
        match outcome {
            DeliveryOutcome::Success => Self::Success,
            DeliveryOutcome::Failed => Self::Failed,
        }
    }
}

/// Record of one logical delivery of a payload to a webhook.
///
/// Created when the delivery starts and updated in place until
/// `completed_at` is set, after which it is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Unique identifier.
    pub id: DeliveryId,
    /// Owning webhook.
    pub webhook_id: WebhookId,
    /// Event name.
    pub event: String,
    /// Signed body as sent.
    pub payload: SignedPayload,
    /// Current status.
    pub status: DeliveryStatus,
    /// HTTP status of the last response, if any.
    pub response_code: Option<u16>,
    /// Response body excerpt or error description.
    pub response_message: Option<String>,
    /// HTTP attempts made so far.
    pub attempt_count: u32,
    /// Caller-supplied idempotency key.
    pub idempotency_key: Option<String>,
    /// When the delivery started.
    pub created_at: DateTime<Utc>,
    /// When the delivery reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    /// Creates a pending delivery.
    pub fn new(webhook_id: WebhookId, payload: SignedPayload, created_at: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            webhook_id,
            event: payload.event.clone(),
            payload,
            status: DeliveryStatus::Pending,
            response_code: None,
            response_message: None,
            attempt_count: 0,
            idempotency_key: None,
            created_at,
            completed_at: None,
        }
    }

    /// Whether the record is frozen.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Moves the record to a terminal state.
    pub fn complete(
        &mut self,
        outcome: DeliveryOutcome,
        response_code: Option<u16>,
        response_message: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.status = outcome.into();
        self.response_code = response_code;
        self.response_message = response_message;
        self.completed_at = Some(at);
    }

    /// Outcome of a completed delivery.
    pub fn outcome(&self) -> Option<DeliveryOutcome> {
        match self.status {
            DeliveryStatus::Success => Some(DeliveryOutcome::Success),
            DeliveryStatus::Failed => Some(DeliveryOutcome::Failed),
            DeliveryStatus::Pending | DeliveryStatus::Retrying => None,
        }
    }
}

/// One failed attempt, kept as history on queue items and dead letters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttemptRecord {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Error description.
    pub error: String,
    /// HTTP status, when a response was received.
    pub response_code: Option<u16>,
    /// When the attempt finished.
    pub attempted_at: DateTime<Utc>,
}

/// Default retry budget for queued deliveries.
pub const DEFAULT_QUEUE_MAX_RETRIES: u32 = 3;

/// A delivery scheduled for a future time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookQueueItem {
    /// Unique identifier.
    pub id: QueueItemId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Event name.
    pub event: String,
    /// Logical payload, signed at send time.
    pub payload: WebhookPayload,
    /// Higher runs first among items due at the same instant.
    pub priority: i32,
    /// Earliest time the item may run.
    pub scheduled_for: DateTime<Utc>,
    /// When the item was first queued.
    pub created_at: DateTime<Utc>,
    /// Attempts already made.
    pub retry_count: u32,
    /// Attempts allowed after the first.
    pub max_retries: u32,
    /// Failures accumulated across reschedules.
    #[serde(default)]
    pub attempt_history: Vec<DeliveryAttemptRecord>,
}

impl WebhookQueueItem {
    /// Creates an item with default priority and retry budget.
    pub fn new(
        webhook_id: WebhookId,
        payload: WebhookPayload,
        scheduled_for: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: QueueItemId::new(),
            webhook_id,
            event: payload.event.clone(),
            payload,
            priority: 0,
            scheduled_for,
            created_at,
            retry_count: 0,
            max_retries: DEFAULT_QUEUE_MAX_RETRIES,
            attempt_history: Vec::new(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether the item may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for <= now
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Queue order: earliest `scheduled_for` first, then higher priority,
    /// then oldest `created_at`.
    pub fn schedule_order(a: &Self, b: &Self) -> Ordering {
        a.scheduled_for
            .cmp(&b.scheduled_for)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.created_at.cmp(&b.created_at))
    }
}

/// A delivery that failed permanently.
///
/// Never removed automatically, only by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterWebhook {
    /// Unique identifier.
    pub id: DeadLetterId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Event name.
    pub event: String,
    /// Logical payload, kept for replay.
    pub payload: WebhookPayload,
    /// Last error.
    pub failure_reason: String,
    /// When the last attempt finished.
    pub last_attempt_at: DateTime<Utc>,
    /// When the dead letter was written.
    pub created_at: DateTime<Utc>,
    /// Every attempt made.
    pub delivery_attempts: Vec<DeliveryAttemptRecord>,
}

impl DeadLetterWebhook {
    /// Creates a dead letter from a payload and its attempt history.
    pub fn new(
        webhook_id: WebhookId,
        payload: WebhookPayload,
        failure_reason: impl Into<String>,
        delivery_attempts: Vec<DeliveryAttemptRecord>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let last_attempt_at =
            delivery_attempts.last().map_or(created_at, |attempt| attempt.attempted_at);
        Self {
            id: DeadLetterId::new(),
            webhook_id,
            event: payload.event.clone(),
            payload,
            failure_reason: failure_reason.into(),
            last_attempt_at,
            created_at,
            delivery_attempts,
        }
    }
}
