//! Error types for webhook delivery operations.
//!
//! Defines every condition a delivery can end in, from network failures and
//! HTTP error classes to circuit breaker rejection and cancellation. Errors
//! carry enough context for the audit record and are categorized for retry
//! decisions.

use std::fmt;

use courier_core::CoreError;
use thiserror::Error;

use crate::retry::is_retryable_status;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Comprehensive error types for webhook delivery operations.
///
/// Display strings include the HTTP status digits where one exists so that
/// substring-based retry classification can match on them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Configured request timeout
        timeout_ms: u64,
    },

    /// HTTP response indicated client error (4xx).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body excerpt
        body: String,
    },

    /// HTTP response indicated server error (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body excerpt
        body: String,
    },

    /// Destination answered 429.
    #[error("rate limited: HTTP 429")]
    RateLimited {
        /// Seconds from the `Retry-After` header, if present
        retry_after_seconds: Option<u64>,
    },

    /// Circuit breaker is open, delivery blocked without I/O.
    #[error("circuit breaker open for {key}")]
    CircuitOpen {
        /// Circuit breaker key, `webhook:<url>`
        key: String,
    },

    /// Caller cancelled the delivery.
    #[error("delivery cancelled")]
    Cancelled,

    /// Storage operation failed during delivery.
    #[error("storage error: {message}")]
    StorageError {
        /// Storage error message
        message: String,
    },

    /// Invalid webhook or client configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Payload could not be serialized.
    #[error("serialization error: {message}")]
    SerializationError {
        /// Serializer message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with optional retry guidance.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(key: impl Into<String>) -> Self {
        Self::CircuitOpen { key: key.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Determines if this error represents a temporary failure that should be
    /// retried.
    ///
    /// Network errors, timeouts and the statuses in
    /// [`RETRYABLE_HTTP_STATUS_CODES`](crate::retry::RETRYABLE_HTTP_STATUS_CODES)
    /// are transient. Other HTTP statuses, circuit rejection, configuration
    /// problems and cancellation are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::StorageError { .. } => true,

            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                is_retryable_status(*status_code)
            },

            Self::CircuitOpen { .. }
            | Self::Cancelled
            | Self::ConfigurationError { .. }
            | Self::SerializationError { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// HTTP status the destination answered with, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Returns the suggested retry delay in seconds.
    ///
    /// `None` means standard exponential backoff applies.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Whether the error means no HTTP request was sent.
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::ConfigurationError { .. }
                | Self::SerializationError { .. }
        )
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidInput(message) => Self::ConfigurationError { message },
            other => Self::StorageError { message: other.to_string() },
        }
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerializationError { message: error.to_string() }
    }
}

/// Category of delivery error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Rate limiting.
    RateLimit,
    /// Circuit breaker protection.
    Circuit,
    /// Storage operations.
    Storage,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::CircuitOpen { .. } => Self::Circuit,
            DeliveryError::StorageError { .. } => Self::Storage,
            DeliveryError::ConfigurationError { .. } | DeliveryError::SerializationError { .. } => {
                Self::Configuration
            },
            DeliveryError::Cancelled | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Circuit => write!(f, "circuit"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
