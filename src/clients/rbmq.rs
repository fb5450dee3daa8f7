use std::{collections::HashSet, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{config::Topology, models::message::CORRELATION_ID_HEADER};

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const MESSAGE_TTL_ARG: &str = "x-message-ttl";

/// Hands a message to the broker for delivery to `queue` after `delay`.
///
/// Returns only once the broker has confirmed the message; a nack or a lost
/// connection is an error.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        correlation_id: &str,
        delay: Duration,
    ) -> Result<(), Error>;
}

pub struct RabbitMqClient {
    connection: Connection,
    publish_channel: Channel,
    consume_channel: Channel,
    topology: Topology,
    declared_queues: Mutex<HashSet<String>>,
}

impl RabbitMqClient {
    pub async fn connect(
        rabbitmq_url: &str,
        prefetch_count: u16,
        topology: Topology,
    ) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ publish channel creation failed: {}", e))?;

        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        let consume_channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ consume channel creation failed: {}", e))?;

        consume_channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        info!(prefetch_count, "RabbitMQ connection established");

        Ok(Self {
            connection,
            publish_channel,
            consume_channel,
            topology,
            declared_queues: Mutex::new(HashSet::new()),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declares the delay and retry graph. Safe to run from every process
    /// at every start.
    pub async fn declare_topology(&self) -> Result<(), Error> {
        let topology = &self.topology;

        self.declare_exchange(&topology.exchange_incoming, ExchangeKind::Fanout)
            .await?;
        self.declare_exchange(&topology.exchange_sorter, ExchangeKind::Direct)
            .await?;
        self.declare_exchange(&topology.exchange_retry, ExchangeKind::Fanout)
            .await?;

        let mut depart_args = FieldTable::default();
        depart_args.insert(
            ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
            AMQPValue::LongString(LongString::from(topology.exchange_sorter.as_str())),
        );
        self.declare_queue(&topology.queue_waiting_depart, depart_args)
            .await?;
        self.bind_queue(&topology.queue_waiting_depart, &topology.exchange_incoming, "")
            .await?;

        let mut retry_args = FieldTable::default();
        retry_args.insert(
            ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
            AMQPValue::LongString(LongString::from(topology.exchange_sorter.as_str())),
        );
        retry_args.insert(
            ShortString::from(MESSAGE_TTL_ARG),
            AMQPValue::LongLongInt(i64::from(topology.default_message_ttl_ms)),
        );
        self.declare_queue(&topology.queue_waiting_retry, retry_args)
            .await?;
        self.bind_queue(&topology.queue_waiting_retry, &topology.exchange_retry, "")
            .await?;

        info!(
            exchange_incoming = %topology.exchange_incoming,
            exchange_sorter = %topology.exchange_sorter,
            exchange_retry = %topology.exchange_retry,
            retry_ttl_ms = topology.default_message_ttl_ms,
            "Broker topology declared"
        );

        Ok(())
    }

    /// Declares `queue` as a live queue routed by its own name from the
    /// sorter, dead-lettering rejects into the retry exchange.
    pub async fn declare_live_queue(&self, queue: &str) -> Result<(), Error> {
        let mut declared = self.declared_queues.lock().await;
        if declared.contains(queue) {
            return Ok(());
        }

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
            AMQPValue::LongString(LongString::from(self.topology.exchange_retry.as_str())),
        );
        self.declare_queue(queue, args).await?;
        self.bind_queue(queue, &self.topology.exchange_sorter, queue)
            .await?;

        declared.insert(queue.to_string());
        debug!(queue, "Live queue declared");

        Ok(())
    }

    pub async fn create_consumer(&self, queue: &str, consumer_tag: &str) -> Result<Consumer, Error> {
        self.declare_live_queue(queue).await?;

        let consumer = self
            .consume_channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer for {}: {}", queue, e))?;

        info!(queue, consumer_tag, "Consumer created for queue");

        Ok(consumer)
    }

    pub fn health_check(&self) -> Result<(), Error> {
        if self.connection.status().connected()
            && self.publish_channel.status().connected()
            && self.consume_channel.status().connected()
        {
            Ok(())
        } else {
            Err(anyhow!("RabbitMQ connection is not open"))
        }
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), Error> {
        self.publish_channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare exchange {}: {}", name, e))
    }

    async fn declare_queue(&self, name: &str, arguments: FieldTable) -> Result<(), Error> {
        self.publish_channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", name, e))?;

        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), Error> {
        self.publish_channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to bind {} to {}: {}", queue, exchange, e))
    }
}

#[async_trait]
impl MessagePublisher for RabbitMqClient {
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        correlation_id: &str,
        delay: Duration,
    ) -> Result<(), Error> {
        self.declare_live_queue(queue).await?;

        let confirmation = self
            .publish_channel
            .basic_publish(
                &self.topology.exchange_incoming,
                queue,
                BasicPublishOptions::default(),
                body,
                message_properties(correlation_id, delay),
            )
            .await
            .map_err(|e| anyhow!("Failed to publish message to {}: {}", queue, e))?
            .await
            .map_err(|e| anyhow!("Publish to {} was not confirmed: {}", queue, e))?;

        if confirmation.is_nack() {
            return Err(anyhow!("Broker refused message for {}", queue));
        }

        debug!(
            queue,
            correlation_id,
            delay_ms = delay.as_millis() as u64,
            "Message published"
        );

        Ok(())
    }
}

/// Persistent message carrying the correlation id, with the delay as its
/// expiration. The waiting queue has no TTL of its own, so the expiration
/// is always set.
fn message_properties(correlation_id: &str, delay: Duration) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(CORRELATION_ID_HEADER),
        AMQPValue::LongString(LongString::from(correlation_id)),
    );

    BasicProperties::default()
        .with_delivery_mode(2)
        .with_headers(headers)
        .with_expiration(ShortString::from(delay.as_millis().to_string()))
}
