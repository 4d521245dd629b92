//! HTTP client for webhook delivery with configurable timeouts.
//!
//! Handles request construction, response processing, and error categorization
//! for retry logic and circuit breaker integration.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use courier_core::models::{DeliveryId, SignedPayload, WebhookId};
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use url::Url;

use crate::error::{DeliveryError, Result};

/// Header carrying the event name.
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Header carrying the payload timestamp.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
/// Header carrying the `v1=<hex>` signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
/// Header carrying the delivery ID.
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Delivery-Id";
/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Response bodies longer than this are truncated before storage.
const MAX_AUDIT_SIZE: usize = 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for each HTTP request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("courier-webhooks/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// HTTP client optimized for webhook delivery.
///
/// Uses connection pooling and a per-request timeout to deliver webhooks to
/// many destinations concurrently.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One HTTP attempt of a delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery record this attempt belongs to.
    pub delivery_id: DeliveryId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Destination URL.
    pub url: String,
    /// Event name.
    pub event: String,
    /// Payload timestamp in wire format.
    pub timestamp: String,
    /// Signature, absent for unsigned webhooks.
    pub signature: Option<String>,
    /// JSON body.
    pub body: Bytes,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

impl DeliveryRequest {
    /// Builds the request for a signed payload.
    ///
    /// The body is the payload as recorded in storage, including its
    /// `signature` field when present.
    ///
    /// # Errors
    ///
    /// Returns `SerializationError` if the payload cannot be encoded.
    pub fn new(
        delivery_id: DeliveryId,
        webhook_id: WebhookId,
        url: impl Into<String>,
        payload: &SignedPayload,
        attempt_number: u32,
    ) -> Result<Self> {
        Ok(Self {
            delivery_id,
            webhook_id,
            url: url.into(),
            event: payload.event.clone(),
            timestamp: payload.to_payload().timestamp_header(),
            signature: payload.signature.clone(),
            body: Bytes::from(serde_json::to_vec(payload)?),
            attempt_number,
        })
    }
}

/// Response from a webhook delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers, lowercase names.
    pub headers: HashMap<String, String>,
    /// Response body, truncated for audit storage.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the request was successful (2xx status).
    pub is_success: bool,
}

impl DeliveryResponse {
    /// Converts a non-2xx response into its error class.
    ///
    /// # Errors
    ///
    /// `RateLimited` for 429, `ServerError` for 5xx and `ClientError` for any
    /// other non-2xx status.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success {
            return Ok(self);
        }
        match self.status_code {
            429 => Err(DeliveryError::rate_limited(extract_retry_after_seconds(&self.headers))),
            500..=599 => Err(DeliveryError::server_error(self.status_code, self.body)),
            code => Err(DeliveryError::client_error(code, self.body)),
        }
    }
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("request timeout must be positive"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends one webhook attempt.
    ///
    /// Any HTTP response, including 4xx and 5xx, is returned as `Ok`; use
    /// [`DeliveryResponse::into_result`] to classify it.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError` for an invalid destination URL
    /// - `Timeout` when no response arrived within the configured timeout
    /// - `NetworkError` for connection failures
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let url = validate_url(&request.url)?;
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            webhook_id = %request.webhook_id,
            delivery_id = %request.delivery_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let mut http_request = self
                .client
                .post(url)
                .body(request.body.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(EVENT_HEADER, &request.event)
                .header(TIMESTAMP_HEADER, &request.timestamp)
                .header(DELIVERY_ID_HEADER, request.delivery_id.to_string())
                .header(ATTEMPT_HEADER, request.attempt_number.to_string());

            if let Some(signature) = &request.signature {
                http_request = http_request.header(SIGNATURE_HEADER, signature);
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis() as u64, "request failed: {}", e);

                    if e.is_timeout() {
                        let timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
                        return Err(DeliveryError::timeout(timeout_ms));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = parse_response(response, start_time).await;

            tracing::debug!(
                status_code = delivery_response.status_code,
                duration_ms = delivery_response.duration.as_millis() as u64,
                "received response"
            );

            match delivery_response.status_code {
                200..=299 => tracing::info!("webhook delivered successfully"),
                400..=499 => {
                    tracing::warn!(status_code = delivery_response.status_code, "client error response");
                },
                500..=599 => {
                    tracing::warn!(status_code = delivery_response.status_code, "server error response");
                },
                _ => {
                    tracing::warn!(
                        status_code = delivery_response.status_code,
                        "unexpected status code"
                    );
                },
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

/// Checks that `raw` is an absolute http(s) URL.
///
/// # Errors
///
/// Returns `ConfigurationError` otherwise.
pub fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| DeliveryError::configuration(format!("invalid webhook url {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(DeliveryError::configuration(format!(
            "unsupported webhook url scheme {scheme:?}"
        ))),
    }
}

/// Parses an HTTP response into a delivery response.
async fn parse_response(response: Response, start_time: std::time::Instant) -> DeliveryResponse {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();
    let headers = extract_headers(response.headers());

    let body = match response.bytes().await {
        Ok(bytes) => truncate_for_audit(&bytes),
        Err(e) => {
            tracing::warn!("failed to read response body: {}", e);
            format!("[failed to read response body: {e}]")
        },
    };

    DeliveryResponse { status_code, headers, body, duration: start_time.elapsed(), is_success }
}

fn truncate_for_audit(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_AUDIT_SIZE {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let suffix = "... (truncated)";
    let max_content = MAX_AUDIT_SIZE - suffix.len();
    let truncated = String::from_utf8_lossy(&bytes[..max_content]);
    format!("{truncated}{suffix}")
}

/// Extracts headers from reqwest HeaderMap into a standard HashMap.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }

    headers
}

/// Extracts retry-after delay from response headers.
///
/// Supports both seconds format and HTTP-date format. Returns the delay in
/// seconds, or a default value (60s) if parsing fails.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let retry_after = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;

    if let Ok(seconds) = retry_after.trim().parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let now = chrono::Utc::now();
        let retry_time = date_time.with_timezone(&chrono::Utc);

        return Some(retry_time.signed_duration_since(now).to_std().map_or(0, |d| d.as_secs()));
    }

    Some(DEFAULT_RETRY_AFTER)
}

#[cfg(test)]
mod tests {
    use courier_core::models::WebhookPayload;
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn create_test_request(url: String, signature: Option<&str>) -> DeliveryRequest {
        let payload = WebhookPayload::new("resource.created", json!({"id": 7}));
        let signed = SignedPayload::new(&payload, signature.map(str::to_string));
        DeliveryRequest::new(DeliveryId::new(), WebhookId::new(), url, &signed, 1).unwrap()
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request(format!("{}/webhook", mock_server.uri()), None);

        let response = client.deliver(request).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
        assert_eq!(response.body, "OK");
        assert!(response.into_result().is_ok());
    }

    #[tokio::test]
    async fn webhook_headers_sent() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header(EVENT_HEADER, "resource.created"))
            .and(matchers::header_exists(TIMESTAMP_HEADER))
            .and(matchers::header(SIGNATURE_HEADER, "v1=abc"))
            .and(matchers::header(ATTEMPT_HEADER, "1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request(format!("{}/hook", mock_server.uri()), Some("v1=abc"));

        let response = client.deliver(request).await.unwrap();
        assert_eq!(response.status_code, 204);
    }

    #[tokio::test]
    async fn unsigned_request_has_no_signature_header() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request(format!("{}/hook", mock_server.uri()), None);

        let response = client.deliver(request).await.unwrap();
        assert_eq!(response.status_code, 200);
    }

    #[tokio::test]
    async fn error_statuses_classified() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&mock_server)
            .await;
        Mock::given(matchers::path("/broken"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Unavailable"))
            .mount(&mock_server)
            .await;
        Mock::given(matchers::path("/busy"))
            .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "120"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let send = |path: &str| {
            let request = create_test_request(format!("{}{path}", mock_server.uri()), None);
            let client = client.clone();
            async move { client.deliver(request).await.unwrap().into_result() }
        };

        assert_eq!(send("/missing").await.unwrap_err(), DeliveryError::client_error(404, "Not Found"));
        assert_eq!(
            send("/broken").await.unwrap_err(),
            DeliveryError::server_error(503, "Unavailable")
        );
        assert_eq!(send("/busy").await.unwrap_err(), DeliveryError::rate_limited(Some(120)));
    }

    #[tokio::test]
    async fn slow_destination_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&mock_server)
            .await;

        let config = ClientConfig { timeout: Duration::from_millis(50), ..ClientConfig::default() };
        let client = DeliveryClient::new(config).unwrap();
        let request = create_test_request(mock_server.uri(), None);

        let err = client.deliver(request).await.unwrap_err();
        assert_eq!(err, DeliveryError::timeout(50));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn invalid_url_rejected_before_send() {
        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request("ftp://example.com/hook".to_string(), None);

        let err = client.deliver(request).await.unwrap_err();
        assert!(matches!(err, DeliveryError::ConfigurationError { .. }));
    }

    #[test]
    fn long_bodies_truncated() {
        let body = vec![b'x'; MAX_AUDIT_SIZE * 4];
        let truncated = truncate_for_audit(&body);
        assert_eq!(truncated.len(), MAX_AUDIT_SIZE);
        assert!(truncated.ends_with("... (truncated)"));
    }

    #[test]
    fn retry_after_parsing() {
        let mut headers = HashMap::new();

        headers.insert("retry-after".to_string(), "120".to_string());
        assert_eq!(extract_retry_after_seconds(&headers), Some(120));

        headers.clear();
        assert_eq!(extract_retry_after_seconds(&headers), None);

        headers.insert("retry-after".to_string(), "invalid".to_string());
        assert_eq!(extract_retry_after_seconds(&headers), Some(60));
    }
}
