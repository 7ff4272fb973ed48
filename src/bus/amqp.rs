//! Lapin-backed AMQP transport implementing the topology fixed by §6: four
//! upstream topic exchanges, one durable queue bound to all of them with
//! wildcard routing keys, and a dead-letter exchange for messages that
//! exceed the requeue bound.

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;

use crate::error::{DispatchError, Result};

const UPSTREAM_EXCHANGES: &[&str] = &["link.events", "click.events", "campaign.events", "user.events"];
const DEAD_LETTER_EXCHANGE: &str = "dead.letter";
const QUEUE_NAME: &str = "webhook.all.events";
const DEAD_LETTER_ROUTING_KEY: &str = "webhook.events";
const CONSUMER_TAG: &str = "webhook-dispatch";

/// A single received message plus the broker metadata the router needs to
/// decide whether to requeue it (§4.4 step 9).
pub struct Delivery {
    pub data: Vec<u8>,
    pub retry_count: u32,
    inner: lapin::message::Delivery,
}

pub struct AmqpBus {
    channel: Channel,
    // lapin's Consumer is a Stream but not Sync; guarded so `next_delivery`
    // can take `&self` like the rest of the `Bus` trait.
    consumer: Mutex<lapin::Consumer>,
}

impl AmqpBus {
    /// Connects, declares the full topology, and starts consuming with the
    /// prefetch bound fixed by §4.4/§5.
    pub async fn connect(url: &str, prefetch: u16) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| DispatchError::Bus(format!("connect to {url}: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| DispatchError::Bus(format!("create channel: {e}")))?;

        declare_topology(&channel).await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| DispatchError::Bus(format!("set prefetch: {e}")))?;

        let consumer = channel
            .basic_consume(
                QUEUE_NAME,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| DispatchError::Bus(format!("start consumer: {e}")))?;

        Ok(Self {
            channel,
            consumer: Mutex::new(consumer),
        })
    }
}

#[async_trait::async_trait]
impl crate::bus::Bus for AmqpBus {
    async fn next_delivery(&self) -> Result<Option<Delivery>> {
        let mut consumer = self.consumer.lock().await;
        match consumer.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(DispatchError::Bus(format!("consume: {e}"))),
            Some(Ok(delivery)) => {
                let retry_count = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .and_then(|h| h.inner().get("x-retry-count"))
                    .and_then(|v| match v {
                        AMQPValue::ShortInt(n) => Some(*n as u32),
                        AMQPValue::LongInt(n) => Some(*n as u32),
                        AMQPValue::ShortShortInt(n) => Some(*n as u32),
                        _ => None,
                    })
                    .unwrap_or(0);
                let data = delivery.data.clone();
                Ok(Some(Delivery {
                    data,
                    retry_count,
                    inner: delivery,
                }))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        delivery
            .inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| DispatchError::Bus(format!("ack: {e}")))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        delivery
            .inner
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| DispatchError::Bus(format!("nack: {e}")))
    }
}

async fn declare_topology(channel: &Channel) -> Result<()> {
    for exchange in UPSTREAM_EXCHANGES {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DispatchError::Bus(format!("declare exchange {exchange}: {e}")))?;
    }

    channel
        .exchange_declare(
            DEAD_LETTER_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| DispatchError::Bus(format!("declare dead-letter exchange: {e}")))?;

    let mut queue_args = FieldTable::default();
    queue_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
    );
    queue_args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(DEAD_LETTER_ROUTING_KEY.into()),
    );

    channel
        .queue_declare(
            QUEUE_NAME,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            queue_args,
        )
        .await
        .map_err(|e| DispatchError::Bus(format!("declare queue {QUEUE_NAME}: {e}")))?;

    for exchange in UPSTREAM_EXCHANGES {
        let category = exchange.split('.').next().unwrap_or(exchange);
        let routing_key = format!("{category}.#");
        channel
            .queue_bind(
                QUEUE_NAME,
                exchange,
                &routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| DispatchError::Bus(format!("bind queue to {exchange}: {e}")))?;
    }

    Ok(())
}
