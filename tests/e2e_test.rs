//! End-to-end tests for complete webhook delivery workflows.
//!
//! Exercises event fan-out to signed subscribers, inline retries, background
//! queue draining and circuit recovery against real HTTP destinations.

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration};

use courier_core::{
    DeliveryStatus, RealClock, SignedPayload, Storage, TestClock, Webhook, WebhookPayload,
};
use courier_delivery::{
    client::SIGNATURE_HEADER, verify_signature, CircuitConfig, CircuitState, DeliveryOptions,
    MemoryDeliveryStorage, QueueScheduler, RetryOptions, SchedulerConfig, ServiceConfig,
    WebhookDeliveryService,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn config() -> ServiceConfig {
    ServiceConfig {
        circuit: CircuitConfig { failure_threshold: 3, ..CircuitConfig::default() },
        retry: RetryOptions {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter_enabled: false,
            ..RetryOptions::default()
        },
        queue_max_retries: 2,
        ..ServiceConfig::default()
    }
}

fn service(storage: &Storage, config: ServiceConfig, clock: &TestClock) -> WebhookDeliveryService {
    WebhookDeliveryService::new(
        Arc::new(MemoryDeliveryStorage::new(storage.clone())),
        config,
        clock.shared(),
    )
    .unwrap()
}

async fn register(storage: &Storage, webhook: Webhook) -> Webhook {
    storage.webhooks.create(&webhook).await.unwrap();
    webhook
}

/// The golden path: an event reaches every subscriber and each one can
/// verify what it received.
#[tokio::test]
async fn subscribers_verify_signed_fan_out() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let storage = Storage::new();
    let clock = TestClock::new();
    let service = service(&storage, config(), &clock);

    let billing = register(
        &storage,
        Webhook::new(format!("{}/billing", server.uri()), ["order.paid"]).with_secret("whsec_billing"),
    )
    .await;
    register(
        &storage,
        Webhook::new(format!("{}/audit", server.uri()), ["*"]).with_secret("whsec_audit"),
    )
    .await;
    register(&storage, Webhook::new(format!("{}/other", server.uri()), ["order.refunded"])).await;

    let summary = service.dispatch_event("order.paid", json!({"order": 1001})).await.unwrap();
    assert_eq!((summary.attempted, summary.succeeded, summary.failed), (2, 2, 0));

    for request in server.received_requests().await.unwrap() {
        let secret = match request.url.path() {
            "/billing" => "whsec_billing",
            "/audit" => "whsec_audit",
            other => panic!("unexpected delivery to {other}"),
        };
        let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        let body: SignedPayload = serde_json::from_slice(&request.body).unwrap();

        assert_eq!(body.signature.as_deref(), Some(signature));
        assert_eq!(body.data, json!({"order": 1001}));
        verify_signature(&body.to_payload(), signature, secret).unwrap();
    }

    let stored = storage.webhooks.find_by_id(billing.id).await.unwrap().unwrap();
    assert_eq!(stored.delivery_count, 1);
}

/// Transient failures are retried with backoff until the destination
/// recovers, leaving no dead letter behind.
#[tokio::test]
async fn transient_outage_recovers_with_backoff() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "processed"})))
        .mount(&server)
        .await;

    let storage = Storage::new();
    let clock = TestClock::new();
    let service = service(&storage, config(), &clock);
    let webhook = register(&storage, Webhook::new(server.uri(), ["order.paid"])).await;

    let payload = WebhookPayload::new("order.paid", json!({"order": 7}));
    let report = service
        .deliver_detailed(
            &webhook,
            &payload,
            DeliveryOptions::with_retry().idempotency_key("order-7-paid"),
        )
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.delivery.status, DeliveryStatus::Success);
    assert_eq!(report.delivery.attempt_count, 3);
    assert_eq!(report.delivery.response_code, Some(200));
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(clock.elapsed(), Duration::from_millis(300));

    // Replays never reach the network.
    let replay = service
        .deliver_detailed(
            &webhook,
            &payload,
            DeliveryOptions::with_retry().idempotency_key("order-7-paid"),
        )
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.delivery.id, report.delivery.id);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    assert_eq!(storage.dead_letters.count().await, 0);
    let stats = service.webhook_delivery_stats().await;
    assert_eq!(stats.values().next().unwrap().state, CircuitState::Closed);
}

/// A destination outage opens its circuit without affecting other
/// destinations, and an operator reset restores delivery.
#[tokio::test]
async fn outage_isolated_until_reset() {
    let down = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&down)
        .await;
    let up = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&up)
        .await;

    let storage = Storage::new();
    let clock = TestClock::new();
    let service = service(&storage, config(), &clock);
    let failing = register(&storage, Webhook::new(down.uri(), ["order.paid"])).await;
    let healthy = register(&storage, Webhook::new(up.uri(), ["order.paid"])).await;
    let payload = WebhookPayload::new("order.paid", json!({"order": 9}));

    for _ in 0..3 {
        assert!(!service.deliver_webhook(&failing, &payload).await.unwrap());
    }
    // Open: fails fast without a request.
    let blocked = service.deliver(&failing, &payload, DeliveryOptions::once()).await.unwrap();
    assert_eq!(blocked.status, DeliveryStatus::Failed);
    assert_eq!(blocked.attempt_count, 0);

    assert!(service.deliver_webhook(&healthy, &payload).await.unwrap());
    down.verify().await;

    down.reset().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&down)
        .await;

    assert!(service.reset_circuit_breaker(&failing.url).await);
    assert!(service.deliver_webhook(&failing, &payload).await.unwrap());

    let stored = storage.webhooks.find_by_id(failing.id).await.unwrap().unwrap();
    assert_eq!(stored.failure_count, 4);
    assert_eq!(stored.delivery_count, 1);
}

/// Queued deliveries are drained by the background scheduler, retried
/// after a failure and removed once delivered.
#[tokio::test]
async fn background_scheduler_drains_queue() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let storage = Storage::new();
    let clock = RealClock::shared();
    let config = ServiceConfig {
        retry: RetryOptions {
            base_delay: Duration::from_millis(20),
            jitter_enabled: false,
            ..RetryOptions::default()
        },
        ..config()
    };
    let service = Arc::new(
        WebhookDeliveryService::new(
            Arc::new(MemoryDeliveryStorage::new(storage.clone())),
            config,
            Arc::clone(&clock),
        )
        .unwrap(),
    );
    let webhook = register(&storage, Webhook::new(server.uri(), ["order.paid"])).await;

    let scheduler = Arc::new(QueueScheduler::new(
        Arc::clone(&service),
        SchedulerConfig { poll_interval: Duration::from_millis(10), ..SchedulerConfig::default() },
        clock,
    ));
    let token = CancellationToken::new();
    let handle = scheduler.spawn(token.clone());

    let payload = WebhookPayload::new("order.paid", json!({"order": 12}));
    service.enqueue(&webhook, payload, 0, Duration::ZERO).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stored = storage.webhooks.find_by_id(webhook.id).await.unwrap().unwrap();
            if stored.delivery_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

    assert!(storage.queue.is_empty().await);
    assert_eq!(storage.dead_letters.count().await, 0);
    let stored = storage.webhooks.find_by_id(webhook.id).await.unwrap().unwrap();
    assert_eq!(stored.failure_count, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
