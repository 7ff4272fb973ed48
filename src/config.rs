//! Process configuration.
//!
//! Loaded from environment variables, following the enumerated key set the
//! external management layer and deployment tooling agree on. There is no
//! file-based layer here: the subsystem only has seven scalar knobs, so a
//! `config`-crate builder would be ceremony without payoff.

use std::env;
use std::time::Duration;

use rand::RngCore;

const DEFAULT_CONSUMER_PREFETCH: u16 = 10;
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_TEST_DELIVERY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_REQUEUE_COUNT: u32 = 3;
const DEFAULT_SERVICE_NAME: &str = "webhook-dispatch";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Runtime configuration for the router and delivery engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// AMQP connection string for the upstream bus.
    pub bus_url: String,
    /// Fallback HMAC key used when a subscription has no secret of its own.
    /// Never empty: generated at startup (with a warning) if unset.
    pub default_webhook_secret: String,
    /// Per-consumer prefetch (bounded in-flight messages).
    pub consumer_prefetch: u16,
    /// Hard deadline for a normal fan-out delivery.
    pub delivery_timeout: Duration,
    /// Hard deadline for a manual test delivery.
    pub test_delivery_timeout: Duration,
    /// Requeue attempts before a message is routed to the dead-letter exchange.
    pub max_requeue_count: u32,
    /// Service name, used in logs and tracing spans.
    pub service_name: String,
    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "debug".
    pub log_level: String,
}

impl DispatchConfig {
    /// Loads configuration from the environment, falling back to the
    /// documented defaults for anything unset.
    ///
    /// `bus_url` has no sane default — it is a genuine dependency on the
    /// broker the process is meant to talk to — so its absence is an error
    /// rather than a silently-generated fallback.
    pub fn from_env() -> Result<Self, crate::error::DispatchError> {
        let bus_url = env::var("BUS_URL")
            .map_err(|_| crate::error::DispatchError::Config("BUS_URL is required".into()))?;

        let default_webhook_secret = match env::var("DEFAULT_WEBHOOK_SECRET") {
            Ok(v) if !v.is_empty() => v,
            _ => {
                tracing::warn!(
                    "DEFAULT_WEBHOOK_SECRET not set; generating a random per-process secret"
                );
                generate_secret()
            }
        };

        let consumer_prefetch = env_parsed("CONSUMER_PREFETCH", DEFAULT_CONSUMER_PREFETCH);
        let delivery_timeout_ms = env_parsed("DELIVERY_TIMEOUT_MS", DEFAULT_DELIVERY_TIMEOUT_MS);
        let test_delivery_timeout_ms =
            env_parsed("TEST_DELIVERY_TIMEOUT_MS", DEFAULT_TEST_DELIVERY_TIMEOUT_MS);
        let max_requeue_count = env_parsed("MAX_REQUEUE_COUNT", DEFAULT_MAX_REQUEUE_COUNT);
        let service_name =
            env::var("SERVICE_NAME").unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

        Ok(Self {
            bus_url,
            default_webhook_secret,
            consumer_prefetch,
            delivery_timeout: Duration::from_millis(delivery_timeout_ms),
            test_delivery_timeout: Duration::from_millis(test_delivery_timeout_ms),
            max_requeue_count,
            service_name,
            log_level,
        })
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Generates a 32-byte random secret, hex-encoded — used both as the
/// process-wide fallback and as the default for freshly created
/// subscriptions that do not supply their own.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_has_enough_entropy() {
        let secret = generate_secret();
        assert!(secret.len() >= 32);
        let other = generate_secret();
        assert_ne!(secret, other);
    }

    #[test]
    fn env_parsed_falls_back_on_missing_or_invalid() {
        assert_eq!(env_parsed::<u16>("WEBHOOK_DISPATCH_NONEXISTENT_KEY", 10), 10);
    }
}
