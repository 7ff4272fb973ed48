//! # webhook-dispatch
//!
//! The webhook dispatch subsystem of a URL-shortening / marketing platform:
//! consumes domain events off the internal bus, resolves matching
//! user-registered subscriptions, signs and delivers payloads to
//! third-party HTTP endpoints, and tracks delivery outcomes.
//!
//! ## Architecture
//!
//! - **store** — `SubscriptionStore` trait plus the in-memory reference
//!   implementation; durable mapping of tenant to subscriptions.
//! - **filter** — pure predicate evaluator deciding whether an event
//!   payload matches a subscription's filter.
//! - **crypto** — HMAC-SHA-256 request signing.
//! - **delivery** — builds the outbound envelope, signs it, issues the
//!   HTTP request, and records the outcome.
//! - **bus** — AMQP transport: topology declaration, consume, ack/nack.
//! - **router** — ties the above together into the consumption loop.
//!
//! ## Quick Start
//!
//! ```rust
//! use webhook_dispatch::store::{InMemorySubscriptionStore, SubscriptionStore};
//! use webhook_dispatch::types::{CreateSubscriptionInput, EventKind, Platform};
//! use std::collections::HashMap;
//!
//! # async fn example() -> webhook_dispatch::Result<()> {
//! let store = InMemorySubscriptionStore::new();
//! let subscription = store.create("team-1", CreateSubscriptionInput {
//!     owner_id: None,
//!     platform: Platform::Zapier,
//!     name: "new links".to_string(),
//!     target_url: "https://hooks.zapier.com/abc".to_string(),
//!     event_kind: EventKind::LinkCreated,
//!     filters: None,
//!     extra_headers: HashMap::new(),
//!     secret: None,
//!     enabled: None,
//! }).await?;
//! println!("created: {}", subscription.id);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod error;
pub mod filter;
pub mod router;
pub mod store;
pub mod types;

pub use config::DispatchConfig;
pub use crypto::{HmacSigner, Signer};
pub use delivery::DeliveryEngine;
pub use error::{DispatchError, Result};
pub use router::EventRouter;
pub use store::{InMemorySubscriptionStore, SubscriptionStore};
pub use types::{
    all_event_kinds, all_platforms, CreateSubscriptionInput, EventKind, Filter, GlobalStats,
    ListQuery, Platform, Subscription, SubscriptionStats, TestDeliveryOutcome,
    UpdateSubscriptionPatch,
};
