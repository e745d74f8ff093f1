use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::GatewayError;

/// Which side of a logical channel a participant sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Ws,
    App,
}

impl Role {
    /// Numeric value used by existing deployments (`1` = ws, `2` = app).
    pub fn code(self) -> u8 {
        match self {
            Role::Ws => 1,
            Role::App => 2,
        }
    }
}

impl TryFrom<u8> for Role {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Role::Ws),
            2 => Ok(Role::App),
            other => Err(GatewayError::InvalidConfiguration(format!("bad role {}", other))),
        }
    }
}

impl FromStr for Role {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ws" | "1" => Ok(Role::Ws),
            "app" | "2" => Ok(Role::App),
            _ => Err(GatewayError::InvalidConfiguration(format!("bad role {:?}", s))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Ws => f.write_str("ws"),
            Role::App => f.write_str("app"),
        }
    }
}

/// Anything a role can be given as: a [`Role`], its numeric code, or its name.
pub trait IntoRole {
    fn into_role(self) -> Result<Role, GatewayError>;
}

impl IntoRole for Role {
    fn into_role(self) -> Result<Role, GatewayError> {
        Ok(self)
    }
}

impl IntoRole for u8 {
    fn into_role(self) -> Result<Role, GatewayError> {
        Role::try_from(self)
    }
}

impl IntoRole for &str {
    fn into_role(self) -> Result<Role, GatewayError> {
        self.parse()
    }
}

impl IntoRole for String {
    fn into_role(self) -> Result<Role, GatewayError> {
        self.parse()
    }
}

/// AMQP exchange types used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Fanout,
    Direct,
}

/// Every broker entity name one participant session needs.
///
/// The app exchange fans out to every ws queue; the ws exchange routes by key
/// to the single app queue. Each side binds its queue to the other side's
/// exchange, so what one role publishes lands in the other role's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub app_exchange: String,
    pub ws_exchange: String,
    pub receive_queue: String,
    pub bind_exchange: String,
    pub bind_routing_key: String,
    pub send_exchange: String,
    pub send_routing_key: String,
}

impl Topology {
    pub fn for_role(name: &str, role: Role, client_id: &str) -> Self {
        let app_exchange = format!("{}.app", name);
        let ws_exchange = format!("{}.ws", name);

        // A sender targets the other side's exchange with the key the other
        // side's queue is bound with.
        let (receive_queue, bind_exchange, bind_routing_key, send_exchange, send_routing_key) = match role {
            Role::Ws => (
                format!("{}.ws.{}", name, client_id),
                app_exchange.clone(),
                ws_exchange.clone(),
                ws_exchange.clone(),
                app_exchange.clone(),
            ),
            Role::App => (
                app_exchange.clone(),
                ws_exchange.clone(),
                app_exchange.clone(),
                app_exchange.clone(),
                ws_exchange.clone(),
            ),
        };

        Self {
            app_exchange,
            ws_exchange,
            receive_queue,
            bind_exchange,
            bind_routing_key,
            send_exchange,
            send_routing_key,
        }
    }

    /// Exchanges to declare, in declaration order.
    pub fn exchanges(&self) -> [(&str, ExchangeType); 2] {
        [
            (self.app_exchange.as_str(), ExchangeType::Fanout),
            (self.ws_exchange.as_str(), ExchangeType::Direct),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_role_binds_own_queue_to_app_exchange() {
        let topology = Topology::for_role("x", Role::Ws, "7");
        assert_eq!(topology.receive_queue, "x.ws.7");
        assert_eq!(topology.bind_exchange, "x.app");
        assert_eq!(topology.bind_routing_key, "x.ws");
        assert_eq!(topology.send_exchange, "x.ws");
        assert_eq!(topology.send_routing_key, "x.app");
    }

    #[test]
    fn app_role_shares_one_queue_per_channel() {
        let topology = Topology::for_role("x", Role::App, "ignored");
        assert_eq!(topology.receive_queue, "x.app");
        assert_eq!(topology.bind_exchange, "x.ws");
        assert_eq!(topology.bind_routing_key, "x.app");
        assert_eq!(topology.send_exchange, "x.app");
        assert_eq!(topology.send_routing_key, "x.ws");
    }

    #[test]
    fn both_exchanges_declared_for_either_role() {
        for role in [Role::Ws, Role::App] {
            let topology = Topology::for_role("chat", role, "0");
            assert_eq!(
                topology.exchanges(),
                [("chat.app", ExchangeType::Fanout), ("chat.ws", ExchangeType::Direct)]
            );
        }
    }

    #[test]
    fn role_parsing() {
        assert_eq!(Role::try_from(1u8).unwrap(), Role::Ws);
        assert_eq!(Role::try_from(2u8).unwrap(), Role::App);
        assert!(matches!(Role::try_from(3u8), Err(GatewayError::InvalidConfiguration(_))));
        assert_eq!("APP".parse::<Role>().unwrap(), Role::App);
        assert_eq!(" ws ".parse::<Role>().unwrap(), Role::Ws);
        assert!("both".parse::<Role>().is_err());
        assert_eq!(Role::App.code(), 2);
    }
}
