//! Bus transport: topology declaration and consumption primitives over
//! AMQP (§6). Kept narrow — the router owns all decode/dispatch logic and
//! only asks this module to hand back raw deliveries and to ack/nack them.

pub mod amqp;

pub use amqp::{AmqpBus, Delivery};

use async_trait::async_trait;

use crate::error::Result;

/// What the router needs from a bus connection. Exists so the router's
/// consumption loop can be exercised in tests against a fake without a
/// running broker.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Blocks until the next message is available.
    async fn next_delivery(&self) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;
}
