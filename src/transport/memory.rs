//! In-process broker with RabbitMQ's fanout/direct routing semantics.
//!
//! Used by the test suite and for running the gateway without a broker. Every
//! call made through it is recorded so tests can assert on exactly what a
//! session declared, bound, published and closed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{Broker, BrokerChannel, BrokerConnection, BrokerResult, DeliveryHandler};
use crate::config::ConnectionParams;
use crate::gateway::errors::BrokerError;
use crate::gateway::topology::ExchangeType;

/// One call made against the broker, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Connect { host: String, vhost: String },
    OpenChannel { channel: u64 },
    DeclareExchange { name: String, kind: ExchangeType, durable: bool },
    DeclareQueue { name: String, durable: bool },
    BindQueue { exchange: String, queue: String, routing_key: String },
    Publish { exchange: String, routing_key: String, payload: Vec<u8> },
    Consume { queue: String, consumer_tag: String },
    Cancel { consumer_tag: String },
    CloseChannel { channel: u64 },
    CloseConnection { connection: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

struct Consumer {
    channel: u64,
    tag: String,
    handler: DeliveryHandler,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<Vec<u8>>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

#[derive(Default)]
struct State {
    next_id: u64,
    calls: Vec<BrokerCall>,
    exchanges: HashMap<String, (ExchangeType, bool)>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashSet<u64>,
    // channel id -> owning connection id
    channels: HashMap<u64, u64>,
    refuse_connections: bool,
    fail_publishes: bool,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_channel(&self, channel: u64) -> BrokerResult<()> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(BrokerError::Closed(format!("channel {}", channel)))
        }
    }

    fn drop_channel(&mut self, channel: u64) {
        self.channels.remove(&channel);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.channel != channel);
        }
    }

    /// Routes `payload` and returns the handler invocations to run once the lock is released.
    fn route(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) -> BrokerResult<Vec<(DeliveryHandler, Vec<u8>)>> {
        let (kind, _) = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange {}", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let matches = binding.exchange == exchange
                && (kind == ExchangeType::Fanout || binding.routing_key == routing_key);
            if matches && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }

        let mut deliveries = Vec::new();
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                if queue.consumers.is_empty() {
                    queue.ready.push_back(payload.to_vec());
                } else {
                    let idx = queue.next_consumer % queue.consumers.len();
                    queue.next_consumer = queue.next_consumer.wrapping_add(1);
                    deliveries.push((queue.consumers[idx].handler.clone(), payload.to_vec()));
                }
            }
        }
        Ok(deliveries)
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave routing state half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every following `connect` fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Makes every following `publish` fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    pub fn exchange(&self, name: &str) -> Option<(ExchangeType, bool)> {
        self.lock().exchanges.get(name).copied()
    }

    pub fn queue_durable(&self, name: &str) -> Option<bool> {
        self.lock().queues.get(name).map(|q| q.durable)
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.lock().bindings.clone()
    }

    /// Messages sitting in `queue` with no consumer to take them.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Forcibly closes every connection and channel, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        state.connections.clear();
        let channels: Vec<u64> = state.channels.keys().copied().collect();
        for channel in channels {
            state.drop_channel(channel);
        }
    }

    /// Publishes as if from another process, without going through a session.
    pub fn inject(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> BrokerResult<()> {
        let deliveries = self.lock().route(exchange, routing_key, payload)?;
        for (handler, body) in deliveries {
            handler(&body);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, params: &ConnectionParams) -> BrokerResult<MemoryConnection> {
        let uri = params
            .amqp_uri()
            .map_err(|e| BrokerError::InvalidAddress(e.to_string()))?;
        let mut state = self.lock();
        state.calls.push(BrokerCall::Connect {
            host: uri.authority.host,
            vhost: uri.vhost,
        });
        if state.refuse_connections {
            return Err(BrokerError::Closed(format!("connection refused by {}", params.host)));
        }
        let id = state.next_id();
        state.connections.insert(id);
        debug!(connection = id, "Memory broker connection opened");
        Ok(MemoryConnection { id, broker: self.clone() })
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> BrokerResult<MemoryChannel> {
        let mut state = self.broker.lock();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::Closed(format!("connection {}", self.id)));
        }
        let id = state.next_id();
        state.channels.insert(id, self.id);
        state.calls.push(BrokerCall::OpenChannel { channel: id });
        Ok(MemoryChannel { id, broker: self.broker.clone() })
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.broker.lock();
        state.calls.push(BrokerCall::CloseConnection { connection: self.id });
        if !state.connections.remove(&self.id) {
            return Err(BrokerError::Closed(format!("connection {}", self.id)));
        }
        let owned: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, conn)| **conn == self.id)
            .map(|(chan, _)| *chan)
            .collect();
        for channel in owned {
            state.drop_channel(channel);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> BrokerResult<()> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        state.calls.push(BrokerCall::DeclareExchange { name: name.to_string(), kind, durable });
        match state.exchanges.get(name) {
            Some(existing) if *existing != (kind, durable) => Err(BrokerError::PreconditionFailed(
                format!("exchange {} redeclared with different type or durability", name),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), (kind, durable));
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<()> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        state.calls.push(BrokerCall::DeclareQueue { name: name.to_string(), durable });
        match state.queues.get(name) {
            Some(existing) if existing.durable != durable => Err(BrokerError::PreconditionFailed(
                format!("queue {} redeclared with different durability", name),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        durable,
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        state.calls.push(BrokerCall::BindQueue {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        });
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange {}", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue {}", queue)));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> BrokerResult<()> {
        let deliveries = {
            let mut state = self.broker.lock();
            state.ensure_channel(self.id)?;
            state.calls.push(BrokerCall::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
            });
            if state.fail_publishes {
                return Err(BrokerError::Closed(format!("channel {} rejected publish", self.id)));
            }
            state.route(exchange, routing_key, payload)?
        };
        for (handler, body) in deliveries {
            handler(&body);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> BrokerResult<String> {
        let (tag, backlog) = {
            let mut state = self.broker.lock();
            state.ensure_channel(self.id)?;
            let tag = format!("consumer-{}", state.next_id());
            state.calls.push(BrokerCall::Consume {
                queue: queue.to_string(),
                consumer_tag: tag.clone(),
            });
            let entry = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound(format!("queue {}", queue)))?;
            entry.consumers.push(Consumer {
                channel: self.id,
                tag: tag.clone(),
                handler: handler.clone(),
            });
            let backlog: Vec<Vec<u8>> = entry.ready.drain(..).collect();
            (tag, backlog)
        };
        for body in backlog {
            handler(&body);
        }
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        let mut state = self.broker.lock();
        state.ensure_channel(self.id)?;
        state.calls.push(BrokerCall::Cancel { consumer_tag: consumer_tag.to_string() });
        let channel = self.id;
        let mut found = false;
        for queue in state.queues.values_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|consumer| !(consumer.channel == channel && consumer.tag == consumer_tag));
            found |= queue.consumers.len() != before;
        }
        if found {
            Ok(())
        } else {
            Err(BrokerError::NotFound(format!("consumer {}", consumer_tag)))
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.broker.lock();
        state.calls.push(BrokerCall::CloseChannel { channel: self.id });
        state.ensure_channel(self.id)?;
        state.drop_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collector() -> (DeliveryHandler, Arc<StdMutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: DeliveryHandler = Arc::new(move |body: &[u8]| {
            sink.lock().unwrap().push(body.to_vec());
        });
        (handler, seen)
    }

    async fn open(broker: &MemoryBroker) -> (MemoryConnection, MemoryChannel) {
        let conn = broker.connect(&ConnectionParams::default()).await.unwrap();
        let chan = conn.open_channel().await.unwrap();
        (conn, chan)
    }

    #[tokio::test]
    async fn fanout_reaches_every_bound_queue() {
        let broker = MemoryBroker::new();
        let (_conn, chan) = open(&broker).await;
        chan.declare_exchange("f", ExchangeType::Fanout, true).await.unwrap();
        for q in ["a", "b"] {
            chan.declare_queue(q, true).await.unwrap();
            chan.bind_queue("f", q, "ignored").await.unwrap();
        }

        chan.publish("f", "anything", b"hi").await.unwrap();

        assert_eq!(broker.ready_count("a"), 1);
        assert_eq!(broker.ready_count("b"), 1);
    }

    #[tokio::test]
    async fn direct_routes_by_key() {
        let broker = MemoryBroker::new();
        let (_conn, chan) = open(&broker).await;
        chan.declare_exchange("d", ExchangeType::Direct, true).await.unwrap();
        chan.declare_queue("q", true).await.unwrap();
        chan.bind_queue("d", "q", "k").await.unwrap();

        chan.publish("d", "other", b"miss").await.unwrap();
        chan.publish("d", "k", b"hit").await.unwrap();

        assert_eq!(broker.ready_count("q"), 1);
    }

    #[tokio::test]
    async fn consume_drains_backlog_then_streams() {
        let broker = MemoryBroker::new();
        let (_conn, chan) = open(&broker).await;
        chan.declare_exchange("d", ExchangeType::Direct, true).await.unwrap();
        chan.declare_queue("q", true).await.unwrap();
        chan.bind_queue("d", "q", "k").await.unwrap();
        chan.publish("d", "k", b"1").await.unwrap();

        let (handler, seen) = collector();
        chan.consume("q", handler).await.unwrap();
        chan.publish("d", "k", b"2").await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(broker.ready_count("q"), 0);
    }

    #[tokio::test]
    async fn redeclare_with_different_kind_fails() {
        let broker = MemoryBroker::new();
        let (_conn, chan) = open(&broker).await;
        chan.declare_exchange("e", ExchangeType::Fanout, true).await.unwrap();
        chan.declare_exchange("e", ExchangeType::Fanout, true).await.unwrap();
        let err = chan.declare_exchange("e", ExchangeType::Direct, true).await.unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn closing_connection_closes_its_channels() {
        let broker = MemoryBroker::new();
        let (conn, chan) = open(&broker).await;
        assert_eq!(broker.open_channels(), 1);

        conn.close().await.unwrap();

        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.open_channels(), 0);
        assert!(matches!(chan.declare_queue("q", true).await, Err(BrokerError::Closed(_))));
        assert!(conn.close().await.is_err());
    }

    #[tokio::test]
    async fn closing_channel_releases_consumer_handler() {
        let broker = MemoryBroker::new();
        let (_conn, chan) = open(&broker).await;
        chan.declare_queue("q", true).await.unwrap();
        let (handler, _seen) = collector();
        let weak = Arc::downgrade(&handler);
        chan.consume("q", handler).await.unwrap();

        chan.close().await.unwrap();

        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn cancelled_consumer_leaves_messages_in_queue() {
        let broker = MemoryBroker::new();
        let (_conn, chan) = open(&broker).await;
        chan.declare_exchange("d", ExchangeType::Direct, true).await.unwrap();
        chan.declare_queue("q", true).await.unwrap();
        chan.bind_queue("d", "q", "k").await.unwrap();
        let (handler, seen) = collector();
        let weak = Arc::downgrade(&handler);
        let tag = chan.consume("q", handler).await.unwrap();

        chan.publish("d", "k", b"before").await.unwrap();
        chan.cancel(&tag).await.unwrap();
        chan.publish("d", "k", b"after").await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![b"before".to_vec()]);
        assert_eq!(broker.ready_count("q"), 1);
        assert!(weak.upgrade().is_none());
        assert!(matches!(chan.cancel(&tag).await, Err(BrokerError::NotFound(_))));
    }
}
