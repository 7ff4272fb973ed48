use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use webhook_dispatch::bus::{AmqpBus, Bus};
use webhook_dispatch::config::DispatchConfig;
use webhook_dispatch::crypto::HmacSigner;
use webhook_dispatch::store::InMemorySubscriptionStore;
use webhook_dispatch::{DeliveryEngine, DispatchError, EventRouter, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let config = DispatchConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(service = %config.service_name, "starting webhook dispatch router");

    let store = Arc::new(InMemorySubscriptionStore::new());
    let engine = Arc::new(DeliveryEngine::new(
        Arc::new(HmacSigner),
        config.default_webhook_secret.clone(),
        config.delivery_timeout,
        config.test_delivery_timeout,
    ));
    let bus: Arc<dyn Bus> = Arc::new(
        AmqpBus::connect(&config.bus_url, config.consumer_prefetch)
            .await
            .map_err(|e| DispatchError::Bus(format!("failed to initialize bus: {e}")))?,
    );

    let router = EventRouter::new(bus, store, engine, config.max_requeue_count);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    router.run(shutdown_rx).await;
    tracing::info!("router stopped");
    Ok(())
}
