//! End-to-end tests driving `handle_envelope` against an in-process HTTP
//! receiver, covering the seed scenarios enumerated in the router spec:
//! fan-out, cross-tenant isolation, filter matching, failure accounting,
//! test delivery, and poison messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;

use webhook_dispatch::crypto::{HmacSigner, Signer};
use webhook_dispatch::delivery::DeliveryEngine;
use webhook_dispatch::router::{handle_envelope, Outcome};
use webhook_dispatch::store::{InMemorySubscriptionStore, SubscriptionStore};
use webhook_dispatch::types::{CreateSubscriptionInput, EventKind, Filter, Platform};

#[derive(Clone, Default)]
struct Captured {
    received: Arc<Mutex<Vec<(HeaderMap, Vec<u8>)>>>,
    status: Arc<Mutex<StatusCode>>,
}

async fn capture_handler(State(state): State<Captured>, headers: HeaderMap, body: axum::body::Bytes) -> StatusCode {
    state.received.lock().unwrap().push((headers, body.to_vec()));
    *state.status.lock().unwrap()
}

/// Starts a receiver on an ephemeral port, returning its base URL and the
/// shared capture handle.
async fn spawn_receiver(initial_status: StatusCode) -> (String, Captured) {
    let state = Captured {
        received: Arc::new(Mutex::new(Vec::new())),
        status: Arc::new(Mutex::new(initial_status)),
    };
    let app = Router::new().route("/hook", post(capture_handler)).with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), state)
}

fn engine() -> DeliveryEngine {
    DeliveryEngine::new(Arc::new(HmacSigner), "a".repeat(32), Duration::from_secs(30), Duration::from_secs(10))
}

async fn make_subscription(
    store: &InMemorySubscriptionStore,
    tenant_id: &str,
    target_url: &str,
    filters: Option<Filter>,
) -> webhook_dispatch::Subscription {
    store
        .create(
            tenant_id,
            CreateSubscriptionInput {
                owner_id: None,
                platform: Platform::Custom,
                name: "hook".to_string(),
                target_url: target_url.to_string(),
                event_kind: EventKind::LinkCreated,
                filters,
                extra_headers: HashMap::new(),
                secret: None,
                enabled: None,
            },
        )
        .await
        .unwrap()
}

fn link_created_envelope(team_id: &str, link_id: &str) -> Vec<u8> {
    serde_json::json!({
        "id": "e1",
        "type": "link.created",
        "timestamp": "2024-01-01T00:00:00Z",
        "data": {"teamId": team_id, "linkId": link_id, "shortCode": "abc", "userId": "U", "tags": ["x"]}
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn fan_out_delivers_to_every_matching_subscription_with_a_valid_signature() {
    let (url, captured) = spawn_receiver(StatusCode::OK).await;
    let store = InMemorySubscriptionStore::new();
    let s1 = make_subscription(&store, "T", &url, None).await;
    let s2 = make_subscription(&store, "T", &url, None).await;
    let engine = engine();

    let outcome = handle_envelope(&store, &engine, &link_created_envelope("T", "L")).await;
    assert!(matches!(outcome, Outcome::Processed));

    let received = captured.received.lock().unwrap();
    assert_eq!(received.len(), 2);
    for (headers, raw_body) in received.iter() {
        let body: serde_json::Value = serde_json::from_slice(raw_body).unwrap();
        assert_eq!(body["event"], "link.created");
        assert_eq!(body["data"]["linkId"], "L");
        let webhook_id = body["webhookId"].as_str().unwrap();
        assert!(webhook_id == s1.id || webhook_id == s2.id);

        let secret = if webhook_id == s1.id { &s1.secret } else { &s2.secret };
        let signature = headers.get("x-webhook-signature").unwrap().to_str().unwrap();
        assert!(HmacSigner.verify(raw_body, signature, secret).unwrap());
    }

    let s1_after = store.get(&s1.id, "T").await.unwrap();
    let s2_after = store.get(&s2.id, "T").await.unwrap();
    assert_eq!(s1_after.success_count, 1);
    assert_eq!(s2_after.success_count, 1);
}

#[tokio::test]
async fn cross_tenant_event_does_not_trigger_delivery() {
    let (url, captured) = spawn_receiver(StatusCode::OK).await;
    let store = InMemorySubscriptionStore::new();
    let s = make_subscription(&store, "A", &url, None).await;
    let engine = engine();

    handle_envelope(&store, &engine, &link_created_envelope("B", "L")).await;

    assert!(captured.received.lock().unwrap().is_empty());
    let after = store.get(&s.id, "A").await.unwrap();
    assert_eq!(after.success_count, 0);
    assert_eq!(after.failure_count, 0);
}

#[tokio::test]
async fn filter_on_link_id_admits_only_the_matching_event() {
    let (url, captured) = spawn_receiver(StatusCode::OK).await;
    let store = InMemorySubscriptionStore::new();
    let filter = Filter { link_ids: vec!["L1".to_string()], ..Default::default() };
    let s = make_subscription(&store, "T", &url, Some(filter)).await;
    let engine = engine();

    handle_envelope(&store, &engine, &link_created_envelope("T", "L1")).await;
    handle_envelope(&store, &engine, &link_created_envelope("T", "L2")).await;

    assert_eq!(captured.received.lock().unwrap().len(), 1);
    let after = store.get(&s.id, "T").await.unwrap();
    assert_eq!(after.success_count, 1);
}

#[tokio::test]
async fn subscriber_returning_503_is_recorded_as_a_single_failure() {
    let (url, _captured) = spawn_receiver(StatusCode::SERVICE_UNAVAILABLE).await;
    let store = InMemorySubscriptionStore::new();
    let s = make_subscription(&store, "T", &url, None).await;
    let engine = engine();

    let outcome = handle_envelope(&store, &engine, &link_created_envelope("T", "L")).await;
    assert!(matches!(outcome, Outcome::Processed));

    let after = store.get(&s.id, "T").await.unwrap();
    assert_eq!(after.failure_count, 1);
    assert_eq!(after.success_count, 0);
    assert!(after.last_error.is_some());
    assert!(after.last_triggered_at.is_some());
}

#[tokio::test]
async fn test_delivery_reports_outcome_without_mutating_counters() {
    let (url, _captured) = spawn_receiver(StatusCode::OK).await;
    let store = InMemorySubscriptionStore::new();
    let s = make_subscription(&store, "T", &url, None).await;
    let engine = engine();

    let outcome = engine.test(&s).await;
    assert!(outcome.success);
    assert_eq!(outcome.status_code, Some(200));

    let after = store.get(&s.id, "T").await.unwrap();
    assert_eq!(after.success_count, 0);
    assert_eq!(after.failure_count, 0);
    assert!(after.last_triggered_at.is_none());
}

#[tokio::test]
async fn poison_message_is_dropped_without_touching_any_subscription() {
    let (url, captured) = spawn_receiver(StatusCode::OK).await;
    let store = InMemorySubscriptionStore::new();
    let s = make_subscription(&store, "T", &url, None).await;
    let engine = engine();

    let outcome = handle_envelope(&store, &engine, b"not valid json at all").await;
    assert!(matches!(outcome, Outcome::Malformed));

    assert!(captured.received.lock().unwrap().is_empty());
    let after = store.get(&s.id, "T").await.unwrap();
    assert_eq!(after.success_count, 0);
    assert_eq!(after.failure_count, 0);
}
