use tracing::debug;

use super::errors::{GatewayError, Result};
use crate::transport::BrokerChannel;

/// Publishes already-encoded payloads to one fixed exchange and routing key.
#[derive(Clone)]
pub struct Sender<C: BrokerChannel> {
    channel: C,
    exchange: String,
    routing_key: String,
}

impl<C: BrokerChannel> Sender<C> {
    pub(crate) fn new(channel: C, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// One publish, no confirmation wait and no retry.
    pub async fn send(&self, message: impl AsRef<[u8]>) -> Result<()> {
        let payload = message.as_ref();
        self.channel
            .publish(&self.exchange, &self.routing_key, payload)
            .await
            .map_err(GatewayError::PublishError)?;

        debug!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            "Published message {:?}",
            String::from_utf8_lossy(payload)
        );
        Ok(())
    }
}
