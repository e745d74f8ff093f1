// src/gateway/connection.rs
// One participant's broker connection and channel, plus topology declaration.

use tracing::{debug, error, info};

use super::consumer::Receiver;
use super::errors::{GatewayError, Result};
use super::publisher::Sender;
use super::topology::Topology;
use crate::config::ConnectionParams;
use crate::transport::{Broker, BrokerChannel, BrokerConnection};

pub type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

/// Exclusively owns one connection and at most one channel on it.
pub struct Session<K: BrokerConnection> {
    connection: K,
    channel: Option<K::Channel>,
}

impl<K: BrokerConnection> Session<K> {
    pub async fn connect<B>(broker: &B, params: &ConnectionParams) -> Result<Self>
    where
        B: Broker<Connection = K>,
    {
        let connection = broker
            .connect(params)
            .await
            .map_err(GatewayError::setup("connecting"))?;
        Ok(Self { connection, channel: None })
    }

    pub async fn open_channel(&mut self) -> Result<K::Channel> {
        if let Some(channel) = &self.channel {
            return Ok(channel.clone());
        }
        let channel = self
            .connection
            .open_channel()
            .await
            .map_err(GatewayError::setup("opening channel"))?;
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Declares both exchanges, the receive queue and its binding, then hands
    /// out the send/receive pair. Every step is idempotent on the broker.
    pub async fn declare(&mut self, topology: &Topology) -> Result<(Sender<K::Channel>, Receiver<K::Channel>)> {
        let channel = self.open_channel().await?;

        for (name, kind) in topology.exchanges() {
            channel
                .declare_exchange(name, kind, true)
                .await
                .map_err(GatewayError::setup("declaring exchange"))?;
            debug!(exchange = %name, ?kind, "Exchange declared");
        }

        channel
            .declare_queue(&topology.receive_queue, true)
            .await
            .map_err(GatewayError::setup("declaring queue"))?;

        channel
            .bind_queue(&topology.bind_exchange, &topology.receive_queue, &topology.bind_routing_key)
            .await
            .map_err(GatewayError::setup("binding queue"))?;

        info!(
            queue = %topology.receive_queue,
            bind_exchange = %topology.bind_exchange,
            routing_key = %topology.bind_routing_key,
            "Topology declared"
        );

        Ok((
            Sender::new(channel.clone(), &topology.send_exchange, &topology.send_routing_key),
            Receiver::new(channel, &topology.receive_queue),
        ))
    }

    /// Closes the channel, then the connection. Failures are logged and
    /// swallowed; the connection close is attempted even if the channel close failed.
    pub async fn close(self) {
        if let Some(channel) = self.channel {
            if let Err(e) = channel.close().await.map_err(GatewayError::teardown("closing channel")) {
                error!("{}", e);
            }
        }
        if let Err(e) = self
            .connection
            .close()
            .await
            .map_err(GatewayError::teardown("closing connection"))
        {
            error!("{}", e);
        }
        debug!("Session closed");
    }
}
