// src/gateway/exchanger.rs
// Scoped entry point: enter builds the session, exit tears it down.

use std::fmt::Display;
use std::future::Future;

use tracing::{debug, info, warn};

use super::connection::{ChannelOf, Session};
use super::consumer::Receiver;
use super::errors::{GatewayError, Result};
use super::publisher::Sender;
use super::topology::{IntoRole, Role, Topology};
use crate::config::ConnectionParams;
use crate::transport::Broker;

/// Gateway facade for one participant of one logical channel.
///
/// ```ignore
/// let exchanger = Exchanger::new(AmqpBroker::new(), params, "room", Role::Ws, 7)?;
/// exchanger
///     .scope(|sender, mut receiver| async move {
///         sender.send("hello").await?;
///         while let Some(message) = receiver.next().await? {
///             println!("{}", message);
///         }
///         Ok::<_, GatewayError>(())
///     })
///     .await?;
/// ```
pub struct Exchanger<B: Broker> {
    broker: B,
    params: ConnectionParams,
    name: String,
    role: Role,
    topology: Topology,
    session: Option<Session<B::Connection>>,
}

impl<B: Broker> Exchanger<B> {
    /// Validates the role before any network activity.
    pub fn new(
        broker: B,
        params: ConnectionParams,
        name: impl Into<String>,
        role: impl IntoRole,
        client_id: impl Display,
    ) -> Result<Self> {
        let role = role.into_role()?;
        let name = name.into();
        if name.is_empty() {
            return Err(GatewayError::InvalidConfiguration("channel name cannot be empty".to_string()));
        }
        let topology = Topology::for_role(&name, role, &client_id.to_string());

        Ok(Self {
            broker,
            params,
            name,
            role,
            topology,
            session: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Connects, opens a channel and declares the topology.
    ///
    /// On failure whatever was opened stays owned by the exchanger, so
    /// [`exit`](Self::exit) still releases it.
    pub async fn enter(&mut self) -> Result<(Sender<ChannelOf<B>>, Receiver<ChannelOf<B>>)> {
        if self.session.is_some() {
            return Err(GatewayError::InvalidConfiguration(format!(
                "exchanger for {} is already entered",
                self.name
            )));
        }
        debug!(channel = %self.name, role = %self.role, "Connecting");

        let session = self
            .session
            .insert(Session::connect(&self.broker, &self.params).await?);
        let pair = session.declare(&self.topology).await?;

        info!(channel = %self.name, role = %self.role, queue = %self.topology.receive_queue, "Connected");
        Ok(pair)
    }

    /// Closes the channel and then the connection. Never fails; a second call
    /// is a no-op.
    pub async fn exit(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(channel = %self.name, role = %self.role, "Closing channel and connection");
            session.close().await;
        }
    }

    /// Runs `body` between [`enter`](Self::enter) and [`exit`](Self::exit).
    /// Exit always runs; the body's result is returned as is.
    pub async fn scope<F, Fut, T, E>(mut self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Sender<ChannelOf<B>>, Receiver<ChannelOf<B>>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<GatewayError>,
    {
        let result = match self.enter().await {
            Ok((sender, receiver)) => body(sender, receiver).await,
            Err(e) => Err(e.into()),
        };
        self.exit().await;
        result
    }
}

impl<B: Broker> Drop for Exchanger<B> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!(channel = %self.name, "Exchanger dropped without exit, closing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(session.close());
            }
            Err(_) => warn!(channel = %self.name, "No runtime available, session left open"),
        }
    }
}
