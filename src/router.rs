//! Event Router: the consumption loop that ties the bus, the subscription
//! store, the filter evaluator, and the delivery engine together (§4.4).
//!
//! `handle_envelope` is the pure-ish core (suspending only on store reads
//! and delivery I/O, never on bus plumbing) so it can be driven directly in
//! tests without a broker. `EventRouter::run` is the thin AMQP-facing loop.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;

use crate::bus::{Bus, Delivery};
use crate::delivery::DeliveryEngine;
use crate::filter;
use crate::store::SubscriptionStore;
use crate::types::BusEnvelope;

/// Translates an upstream bus `type` into the webhook `event` kind this
/// system dispatches on, per the closed mapping table in §6. `None` means
/// the upstream kind is unmapped and the message should be acked silently.
fn map_event_kind(upstream_type: &str) -> Option<&'static str> {
    Some(match upstream_type {
        "link.created" => "link.created",
        "link.updated" => "link.updated",
        "link.deleted" => "link.deleted",
        "click.recorded" => "link.clicked",
        "campaign.created" => "campaign.started",
        "campaign.goal.reached" => "conversion.tracked",
        "user.created" => "user.invited",
        _ => return None,
    })
}

/// Per-kind tenant extraction (§6). `click.recorded` and
/// `campaign.goal.reached` carry no tenant in this version and are skipped
/// (§9 open question, resolved as documented in SPEC_FULL.md).
fn extract_tenant<'a>(upstream_type: &str, data: &'a Value) -> Option<&'a str> {
    match upstream_type {
        "click.recorded" | "campaign.goal.reached" => None,
        _ => data.get("teamId").and_then(Value::as_str),
    }
}

/// Builds the per-kind `data` projection sent to subscribers (§6). Missing
/// optional fields are simply omitted by `serde_json::json!`'s null
/// collapsing where the source field is absent.
fn build_projection(mapped_kind: &str, event_id: &str, timestamp: &str, upstream: &Value) -> Value {
    let get = |field: &str| upstream.get(field).cloned().unwrap_or(Value::Null);

    match mapped_kind {
        "link.clicked" => serde_json::json!({
            "eventId": event_id,
            "eventType": mapped_kind,
            "timestamp": timestamp,
            "linkId": get("linkId"),
            "shortCode": get("shortCode"),
            "country": get("country"),
            "city": get("city"),
            "device": get("device"),
            "browser": get("browser"),
            "referer": get("referer"),
        }),
        "campaign.started" => serde_json::json!({
            "eventId": event_id,
            "eventType": mapped_kind,
            "timestamp": timestamp,
            "campaignId": get("campaignId"),
            "name": get("name"),
            "teamId": get("teamId"),
        }),
        "conversion.tracked" => serde_json::json!({
            "eventId": event_id,
            "eventType": mapped_kind,
            "timestamp": timestamp,
            "campaignId": get("campaignId"),
            "goalId": get("goalId"),
            "goalName": get("goalName"),
            "currentValue": get("currentValue"),
            "targetValue": get("targetValue"),
            "userId": get("userId"),
        }),
        "user.invited" => serde_json::json!({
            "eventId": event_id,
            "eventType": mapped_kind,
            "timestamp": timestamp,
            "userId": get("userId"),
            "email": get("email"),
            "teamId": get("teamId"),
        }),
        // link.created / link.updated / link.deleted and anything else
        // mapped from the link.* family.
        _ => serde_json::json!({
            "eventId": event_id,
            "eventType": mapped_kind,
            "timestamp": timestamp,
            "linkId": get("linkId"),
            "shortCode": get("shortCode"),
            "originalUrl": get("originalUrl"),
            "teamId": get("teamId"),
            "userId": get("userId"),
            "tags": get("tags"),
        }),
    }
}

/// Outcome of processing one bus message, used by the AMQP-facing loop to
/// decide ack vs. nack(requeue) vs. nack(no-requeue).
pub enum Outcome {
    /// Decoded, routed (or legitimately skipped) — ack regardless of how
    /// many deliveries succeeded or failed.
    Processed,
    /// JSON decode failed — malformed messages cannot be retried (§4.4.2).
    Malformed,
    /// A store or bus-adjacent error occurred before dispatch could
    /// complete; the caller inspects `x-retry-count` to decide nack mode.
    Transient(String),
}

/// Decodes one bus message body and drives it through lookup, filtering,
/// and delivery fan-out. Does not touch the bus itself.
pub async fn handle_envelope(
    store: &dyn SubscriptionStore,
    delivery_engine: &DeliveryEngine,
    body: &[u8],
) -> Outcome {
    let envelope: BusEnvelope = match serde_json::from_slice(body) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed bus message");
            return Outcome::Malformed;
        }
    };

    let Some(mapped_kind) = map_event_kind(&envelope.kind) else {
        tracing::debug!(upstream_type = %envelope.kind, "unmapped event kind, skipping");
        return Outcome::Processed;
    };

    let Some(tenant_id) = extract_tenant(&envelope.kind, &envelope.data) else {
        tracing::warn!(upstream_type = %envelope.kind, "no tenant in payload, skipping");
        return Outcome::Processed;
    };

    let matches = match store.find_matches(tenant_id, mapped_kind).await {
        Ok(m) => m,
        Err(e) => return Outcome::Transient(e.to_string()),
    };

    if matches.is_empty() {
        return Outcome::Processed;
    }

    let timestamp = envelope.timestamp.to_rfc3339();
    let projection = build_projection(mapped_kind, &envelope.id, &timestamp, &envelope.data);

    let deliveries = matches.into_iter().filter_map(|subscription| {
        if !filter::matches(subscription.filters.as_ref(), &projection) {
            return None;
        }
        let data = projection.clone();
        let kind = mapped_kind.to_string();
        Some(async move {
            delivery_engine.deliver(store, &subscription, &kind, data).await;
        })
    });

    join_all(deliveries).await;
    Outcome::Processed
}

/// Drives the AMQP consumption loop: pulls messages, routes them, and
/// applies the ack/nack discipline of §4.4 step 9.
pub struct EventRouter {
    bus: Arc<dyn Bus>,
    store: Arc<dyn SubscriptionStore>,
    delivery_engine: Arc<DeliveryEngine>,
    max_requeue_count: u32,
}

impl EventRouter {
    pub fn new(
        bus: Arc<dyn Bus>,
        store: Arc<dyn SubscriptionStore>,
        delivery_engine: Arc<DeliveryEngine>,
        max_requeue_count: u32,
    ) -> Self {
        Self { bus, store, delivery_engine, max_requeue_count }
    }

    /// Runs until `shutdown` resolves. Stops pulling new messages first,
    /// lets in-flight delivery fan-out finish, then returns (§5).
    pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("router shutting down, no longer accepting new messages");
                    return;
                }
                next = self.bus.next_delivery() => next,
            };

            let delivery = match next {
                Ok(Some(d)) => d,
                Ok(None) => {
                    tracing::info!("bus consumer stream ended");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "bus error while polling for next delivery");
                    continue;
                }
            };

            self.process(delivery).await;
        }
    }

    async fn process(&self, delivery: Delivery) {
        let outcome = handle_envelope(self.store.as_ref(), &self.delivery_engine, &delivery.data).await;

        let result = match outcome {
            Outcome::Processed | Outcome::Malformed => self.bus.ack(&delivery).await,
            Outcome::Transient(reason) => {
                let requeue = delivery.retry_count < self.max_requeue_count;
                tracing::warn!(retry_count = delivery.retry_count, requeue, %reason, "nacking message");
                self.bus.nack(&delivery, requeue).await
            }
        };

        if let Err(e) = result {
            tracing::error!(error = %e, "failed to ack/nack bus message");
        }
    }
}
