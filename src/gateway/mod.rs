// src/gateway/mod.rs
// Two-role relay over a pair of per-channel exchanges.

pub mod errors;
pub mod topology;
pub mod connection;
pub mod exchanger;

mod consumer;
mod publisher;

pub use connection::{ChannelOf, Session};
pub use consumer::{Receiver, ReceiverState, StopHandle, RECEIVE_BUFFER_CAPACITY};
pub use errors::{BrokerError, GatewayError, Result};
pub use exchanger::Exchanger;
pub use publisher::Sender;
pub use topology::{ExchangeType, IntoRole, Role, Topology};
