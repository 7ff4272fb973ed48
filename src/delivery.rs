//! Delivery Engine: builds the canonical envelope, signs it, issues the
//! outbound HTTP request under a timeout, interprets the response, and
//! updates the store's counters (§4.3).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::redirect::Policy;
use reqwest::Client;
use serde_json::Value;

use crate::crypto::Signer;
use crate::store::SubscriptionStore;
use crate::types::{Platform, Subscription, TestDeliveryOutcome, WebhookEnvelope};

const MAX_ERROR_LEN: usize = 500;
const TEST_BANNER: &str = "This is a test delivery from your webhook subscription.";
const MAX_REDIRECTS: usize = 3;

/// Stateless per call; holds only the shared HTTP client, signer, and the
/// two fixed timeouts (§4.3). Safe to share across fan-out.
pub struct DeliveryEngine {
    client: Client,
    signer: Arc<dyn Signer>,
    default_secret: String,
    delivery_timeout: Duration,
    test_delivery_timeout: Duration,
}

impl DeliveryEngine {
    pub fn new(
        signer: Arc<dyn Signer>,
        default_secret: String,
        delivery_timeout: Duration,
        test_delivery_timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self {
            client,
            signer,
            default_secret,
            delivery_timeout,
            test_delivery_timeout,
        }
    }

    /// Delivers `data` for `event_kind` to `subscription`, then records the
    /// outcome on `store`. Never returns an error to the caller — delivery
    /// failures are terminal and isolated per subscription (§4.3, §7).
    pub async fn deliver(
        &self,
        store: &dyn SubscriptionStore,
        subscription: &Subscription,
        event_kind: &str,
        data: Value,
    ) {
        let envelope = self.build_envelope(subscription, event_kind, data);
        let body = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(subscription_id = %subscription.id, error = %e, "failed to encode envelope");
                let _ = store.record_failure(&subscription.id, &truncate(&e.to_string())).await;
                return;
            }
        };

        let headers = match self.build_headers(subscription, &envelope, &body, false) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(subscription_id = %subscription.id, error = %e, "failed to sign envelope");
                let _ = store.record_failure(&subscription.id, &truncate(&e.to_string())).await;
                return;
            }
        };

        let outcome = self
            .send(&subscription.target_url, headers, body, self.delivery_timeout)
            .await;

        match outcome {
            Ok(status) if (200..300).contains(&status) => {
                tracing::info!(subscription_id = %subscription.id, %event_kind, status, "delivery succeeded");
                if let Err(e) = store.record_success(&subscription.id).await {
                    tracing::warn!(subscription_id = %subscription.id, error = %e, "failed to record success");
                }
            }
            Ok(status) => {
                let msg = format!("unexpected status: {status}");
                tracing::warn!(subscription_id = %subscription.id, %event_kind, status, "delivery failed");
                let _ = store.record_failure(&subscription.id, &msg).await;
            }
            Err(e) => {
                let msg = truncate(&e);
                tracing::warn!(subscription_id = %subscription.id, %event_kind, error = %msg, "delivery failed");
                let _ = store.record_failure(&subscription.id, &msg).await;
            }
        }
    }

    /// Manual test delivery (§4.3): same envelope construction with a fixed
    /// banner payload, 10s timeout, and no counter mutation — the outcome is
    /// returned to the caller instead.
    pub async fn test(&self, subscription: &Subscription) -> TestDeliveryOutcome {
        let data = serde_json::json!({"test": true, "message": TEST_BANNER});
        let envelope = self.build_envelope(subscription, subscription.event_kind.as_str(), data);
        let body = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                return TestDeliveryOutcome {
                    success: false,
                    status_code: None,
                    response_time_ms: 0,
                    error: Some(truncate(&e.to_string())),
                }
            }
        };
        let headers = match self.build_headers(subscription, &envelope, &body, true) {
            Ok(h) => h,
            Err(e) => {
                return TestDeliveryOutcome {
                    success: false,
                    status_code: None,
                    response_time_ms: 0,
                    error: Some(truncate(&e.to_string())),
                }
            }
        };

        let started = Instant::now();
        let result = self
            .send(&subscription.target_url, headers, body, self.test_delivery_timeout)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(status) if (200..300).contains(&status) => TestDeliveryOutcome {
                success: true,
                status_code: Some(status),
                response_time_ms: elapsed_ms,
                error: None,
            },
            Ok(status) => TestDeliveryOutcome {
                success: false,
                status_code: Some(status),
                response_time_ms: elapsed_ms,
                error: Some(format!("unexpected status: {status}")),
            },
            Err(e) => TestDeliveryOutcome {
                success: false,
                status_code: None,
                response_time_ms: elapsed_ms,
                error: Some(truncate(&e)),
            },
        }
    }

    fn build_envelope(&self, subscription: &Subscription, event_kind: &str, data: Value) -> WebhookEnvelope {
        WebhookEnvelope {
            event: event_kind.to_string(),
            data,
            timestamp: Utc::now().to_rfc3339(),
            team_id: subscription.tenant_id.clone(),
            webhook_id: subscription.id.clone(),
        }
    }

    fn build_headers(
        &self,
        subscription: &Subscription,
        envelope: &WebhookEnvelope,
        body: &[u8],
        is_test: bool,
    ) -> Result<reqwest::header::HeaderMap, crate::error::DispatchError> {
        use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

        let secret = if subscription.secret.is_empty() {
            &self.default_secret
        } else {
            &subscription.secret
        };
        let signature = self.signer.sign(body, secret)?;

        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("x-webhook-signature"),
            HeaderValue::from_str(&signature)
                .map_err(|e| crate::error::DispatchError::DeliveryFailure(e.to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("x-webhook-event"),
            HeaderValue::from_str(&envelope.event)
                .map_err(|e| crate::error::DispatchError::DeliveryFailure(e.to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("x-webhook-id"),
            HeaderValue::from_str(&envelope.webhook_id)
                .map_err(|e| crate::error::DispatchError::DeliveryFailure(e.to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("x-timestamp"),
            HeaderValue::from_str(&envelope.timestamp)
                .map_err(|e| crate::error::DispatchError::DeliveryFailure(e.to_string()))?,
        );
        if is_test {
            headers.insert(HeaderName::from_static("x-webhook-test"), HeaderValue::from_static("true"));
        }

        match subscription.platform {
            Platform::Make => {
                headers.insert(HeaderName::from_static("x-make-request"), HeaderValue::from_static("true"));
            }
            Platform::N8n => {
                headers.insert(HeaderName::from_static("x-n8n-request"), HeaderValue::from_static("true"));
            }
            _ => {}
        }

        // Merge extra_headers last, for any key not already reserved above.
        for (key, value) in &subscription.extra_headers {
            if let Ok(name) = HeaderName::try_from(key.as_str()) {
                if headers.contains_key(&name) {
                    continue;
                }
                if let Ok(val) = HeaderValue::from_str(value) {
                    headers.insert(name, val);
                }
            }
        }

        Ok(headers)
    }

    async fn send(
        &self,
        url: &str,
        headers: reqwest::header::HeaderMap,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<u16, String> {
        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(MAX_ERROR_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HmacSigner;
    use crate::store::InMemorySubscriptionStore;
    use crate::types::{CreateSubscriptionInput, EventKind};
    use std::collections::HashMap;

    fn engine() -> DeliveryEngine {
        DeliveryEngine::new(
            Arc::new(HmacSigner),
            "a".repeat(32),
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
    }

    async fn make_subscription(store: &InMemorySubscriptionStore, target_url: &str) -> Subscription {
        store
            .create(
                "tenant-a",
                CreateSubscriptionInput {
                    owner_id: None,
                    platform: Platform::Make,
                    name: "hook".to_string(),
                    target_url: target_url.to_string(),
                    event_kind: EventKind::LinkCreated,
                    filters: None,
                    extra_headers: HashMap::new(),
                    secret: None,
                    enabled: None,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn deliver_to_unreachable_host_records_failure() {
        let store = InMemorySubscriptionStore::new();
        // Port 1 is reserved and will refuse/connection-fail quickly.
        let sub = make_subscription(&store, "http://127.0.0.1:1/hook").await;
        let engine = engine();

        engine
            .deliver(&store, &sub, "link.created", serde_json::json!({"linkId": "L1"}))
            .await;

        let updated = store.get(&sub.id, "tenant-a").await.unwrap();
        assert_eq!(updated.failure_count, 1);
        assert_eq!(updated.success_count, 0);
        assert!(updated.last_error.is_some());
    }

    #[tokio::test]
    async fn test_delivery_to_unreachable_host_does_not_mutate_counters() {
        let store = InMemorySubscriptionStore::new();
        let sub = make_subscription(&store, "http://127.0.0.1:1/hook").await;
        let engine = engine();

        let outcome = engine.test(&sub).await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());

        let unchanged = store.get(&sub.id, "tenant-a").await.unwrap();
        assert_eq!(unchanged.success_count, 0);
        assert_eq!(unchanged.failure_count, 0);
        assert!(unchanged.last_triggered_at.is_none());
    }

    #[test]
    fn platform_headers_are_additive_per_spec() {
        let engine = engine();
        let sub = Subscription {
            id: "sub-1".to_string(),
            tenant_id: "t".to_string(),
            owner_id: None,
            platform: Platform::N8n,
            name: "n".to_string(),
            target_url: "https://example.com".to_string(),
            event_kind: EventKind::LinkCreated,
            enabled: true,
            secret: "a".repeat(32),
            filters: None,
            extra_headers: HashMap::new(),
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let envelope = engine.build_envelope(&sub, "link.created", serde_json::json!({}));
        let body = serde_json::to_vec(&envelope).unwrap();
        let headers = engine.build_headers(&sub, &envelope, &body, false).unwrap();
        assert!(headers.contains_key("x-n8n-request"));
        assert!(!headers.contains_key("x-make-request"));
    }

    #[test]
    fn extra_headers_cannot_override_reserved_keys() {
        let engine = engine();
        let mut extra = HashMap::new();
        extra.insert("x-webhook-event".to_string(), "tampered".to_string());
        extra.insert("x-custom".to_string(), "value".to_string());

        let sub = Subscription {
            id: "sub-1".to_string(),
            tenant_id: "t".to_string(),
            owner_id: None,
            platform: Platform::Custom,
            name: "n".to_string(),
            target_url: "https://example.com".to_string(),
            event_kind: EventKind::LinkCreated,
            enabled: true,
            secret: "a".repeat(32),
            filters: None,
            extra_headers: extra,
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let envelope = engine.build_envelope(&sub, "link.created", serde_json::json!({}));
        let body = serde_json::to_vec(&envelope).unwrap();
        let headers = engine.build_headers(&sub, &envelope, &body, false).unwrap();
        assert_eq!(headers.get("x-webhook-event").unwrap(), "link.created");
        assert_eq!(headers.get("x-custom").unwrap(), "value");
    }
}
