//! Relay between web-socket-side and application-side participants over an
//! AMQP broker.
//!
//! Each logical channel `name` owns two durable exchanges: `{name}.app`
//! (fanout) and `{name}.ws` (direct). A ws participant receives on
//! `{name}.ws.{client_id}`, bound to the app exchange; the app participant
//! receives on `{name}.app`, bound to the ws exchange. [`Exchanger`] sets this
//! up and hands out a [`Sender`]/[`Receiver`] pair for the duration of a scope.
//!
//! Inbound payloads are decoded as UTF-8. Consumption is no-ack with a
//! bounded buffer of [`RECEIVE_BUFFER_CAPACITY`] messages; overflow is dropped
//! and logged, so delivery is at most once.

pub mod config;
pub mod gateway;
pub mod transport;

pub use config::{ConnectionParams, GatewaySettings};
pub use gateway::{
    Exchanger, GatewayError, Receiver, ReceiverState, Result, Role, Sender, StopHandle,
    RECEIVE_BUFFER_CAPACITY,
};
pub use transport::{AmqpBroker, MemoryBroker};
