// src/transport/mod.rs
// Broker capability consumed by the gateway, plus the shipped implementations.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionParams;
use crate::gateway::errors::BrokerError;
use crate::gateway::topology::ExchangeType;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Called by the transport once per delivered message body.
///
/// Must not block: it runs on whatever task drives the transport's deliveries.
pub type DeliveryHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(&self, params: &ConnectionParams) -> BrokerResult<Self::Connection>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> BrokerResult<Self::Channel>;

    async fn close(&self) -> BrokerResult<()>;
}

#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> BrokerResult<()>;

    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<()>;

    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> BrokerResult<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> BrokerResult<()>;

    /// Registers `handler` as a no-ack consumer of `queue` and returns its
    /// consumer tag. The broker treats a message as delivered as soon as it is
    /// dispatched. Deliveries keep flowing until the consumer is cancelled or
    /// the channel closes, after which the handler is dropped.
    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> BrokerResult<String>;

    /// Stops the consumer registered under `consumer_tag`. Messages routed to
    /// its queue afterwards stay there.
    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}
