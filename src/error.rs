//! Error types for webhook-dispatch

use thiserror::Error;

/// Errors that can occur anywhere in the dispatch pipeline.
///
/// Variant choice follows the taxonomy the management surface and the
/// router both key off of: `InvalidInput`/`NotFound` bubble straight back
/// to callers, `Transient` drives the router's requeue discipline,
/// `DeliveryFailure` is recorded on the subscription and never propagated,
/// and `MalformedEvent` is acked-and-dropped at the router.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Caller-supplied data violates an invariant: bad URL, unknown event
    /// kind, over-length field.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Subscription absent under the given tenant. Also returned for
    /// cross-tenant access so that leak and absence are indistinguishable.
    #[error("subscription not found: {0}")]
    NotFound(String),

    /// Storage or bus hiccup. Surfaced verbatim on the management path;
    /// inside the router this drives the nack/requeue decision.
    #[error("transient error: {0}")]
    Transient(String),

    /// Outbound HTTP failed: non-2xx, timeout, or transport error.
    /// Never propagated past the delivery engine's own bookkeeping.
    #[error("delivery failed: {0}")]
    DeliveryFailure(String),

    /// Bus message could not be decoded as a JSON event envelope.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// JSON encode/decode failure outside the router's own decode step
    /// (e.g. envelope construction, config parsing).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// AMQP connection or channel failure.
    #[error("bus error: {0}")]
    Bus(String),

    /// Configuration value missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Bus(_))
    }
}

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
