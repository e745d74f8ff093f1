// src/transport/amqp.rs
// lapin-backed transport for a real RabbitMQ broker.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{Broker, BrokerChannel, BrokerConnection, BrokerResult, DeliveryHandler};
use crate::config::ConnectionParams;
use crate::gateway::errors::BrokerError;
use crate::gateway::topology::ExchangeType;

const REPLY_SUCCESS: u16 = 200;

#[derive(Clone, Default)]
pub struct AmqpBroker {
    properties: ConnectionProperties,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Connection = AmqpConnection;

    async fn connect(&self, params: &ConnectionParams) -> BrokerResult<AmqpConnection> {
        let uri = params
            .amqp_uri()
            .map_err(|e| BrokerError::InvalidAddress(e.to_string()))?;
        info!(host = %uri.authority.host, port = uri.authority.port, vhost = %uri.vhost, "Connecting to RabbitMQ");
        let connection = Connection::connect_uri(uri, self.properties.clone()).await?;
        debug!("Successfully connected to RabbitMQ");
        Ok(AmqpConnection { inner: connection })
    }
}

pub struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> BrokerResult<AmqpChannel> {
        let channel = self.inner.create_channel().await?;
        debug!(channel_id = channel.id(), "Channel opened");
        Ok(AmqpChannel { inner: channel })
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close(REPLY_SUCCESS, "Closing connection").await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> BrokerResult<()> {
        let kind = match kind {
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Direct => ExchangeKind::Direct,
        };
        self.inner
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<()> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(queue = %name, messages = queue.message_count(), "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> BrokerResult<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> BrokerResult<()> {
        let properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> BrokerResult<String> {
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Started consuming");

        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => handler(&delivery.data),
                    Err(e) => {
                        error!(queue = %queue, "Error receiving message: {}", e);
                        break;
                    }
                }
            }
            debug!(queue = %queue, "Consumer stream ended");
        });

        Ok(consumer_tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        debug!(consumer_tag = %consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close(REPLY_SUCCESS, "Closing channel").await?;
        Ok(())
    }
}
