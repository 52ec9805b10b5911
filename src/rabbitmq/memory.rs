//! In-process broker implementing the transport traits.
//!
//! Routes messages through topic exchanges to queues the same way RabbitMQ
//! does (`*` matches one word, `#` zero or more), and adds knobs to inject
//! faults: failed dials, failed consumes and abrupt loss of every open
//! connection. Acks, nacks, publishes, dials and consume attempts are
//! recorded so callers can assert on them. Nacked messages are recorded, not
//! redelivered.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::types::FieldTable;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};
use super::transport::{
    Acknowledger, AmqpChannel, AmqpConnection, Connector, Delivery, DeliveryStream, DialConfig,
    Publishing,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub kind: AckKind,
}

#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub exchange: String,
    pub routing_key: String,
    pub publishing: Publishing,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    routing_key: String,
    headers: FieldTable,
    body: Vec<u8>,
}

struct ConsumerEntry {
    conn_id: u64,
    channel_id: u64,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

struct MemoryQueue {
    auto_delete: bool,
    /// (exchange, routing key pattern)
    bindings: Vec<(String, String)>,
    pending: VecDeque<PendingMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct ConnectionEntry {
    open: bool,
    lost: Option<oneshot::Sender<RabbitMQError>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, bool>,
    queues: HashMap<String, MemoryQueue>,
    connections: HashMap<u64, ConnectionEntry>,
    next_id: u64,
    next_tag: u64,
    fail_connects: u32,
    fail_consumes: u32,
    connect_attempts: u32,
    consume_attempts: Vec<Instant>,
    acks: Vec<AckRecord>,
    published: Vec<PublishedRecord>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_open(&self, conn_id: u64) -> bool {
        self.connections.get(&conn_id).is_some_and(|c| c.open)
    }

    fn remove_consumers(&mut self, keep: impl Fn(&ConsumerEntry) -> bool) {
        self.queues.retain(|_, queue| {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| keep(c));
            !(queue.auto_delete && before > 0 && queue.consumers.is_empty())
        });
    }
}

pub struct MemoryBroker {
    me: Weak<MemoryBroker>,
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| MemoryBroker {
            me: me.clone(),
            state: Mutex::new(BrokerState::default()),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next `n` dials fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state().fail_connects = n;
    }

    /// The next `n` consume calls fail.
    pub fn fail_next_consumes(&self, n: u32) {
        self.state().fail_consumes = n;
    }

    /// Abruptly drops every open connection, firing their lost
    /// notifications and ending their delivery streams.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        let mut dropped = Vec::new();
        for (id, conn) in state.connections.iter_mut() {
            if conn.open {
                conn.open = false;
                if let Some(tx) = conn.lost.take() {
                    let _ = tx.send(RabbitMQError::ConnectionError(
                        "connection reset by peer".to_string(),
                    ));
                }
                dropped.push(*id);
            }
        }
        state.remove_consumers(|c| !dropped.contains(&c.conn_id));
        debug!(count = dropped.len(), "Dropped in-memory connections");
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.values().filter(|c| c.open).count()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn consume_attempts(&self) -> Vec<Instant> {
        self.state().consume_attempts.clone()
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        self.state().acks.clone()
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        self.state().published.clone()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Routes a message the way a topic exchange would.
    pub fn publish(&self, exchange: &str, routing_key: &str, publishing: Publishing) -> Result<()> {
        let mut state = self.state();
        if !state.exchanges.contains_key(exchange) {
            return Err(RabbitMQError::PublishError(format!(
                "no exchange '{}'",
                exchange
            )));
        }
        state.published.push(PublishedRecord {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            publishing: publishing.clone(),
        });

        let targets: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| {
                q.bindings
                    .iter()
                    .any(|(ex, pattern)| ex == exchange && topic_matches(pattern, routing_key))
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in targets {
            let message = PendingMessage {
                routing_key: routing_key.to_string(),
                headers: publishing.headers.clone(),
                body: publishing.body.clone(),
            };
            self.enqueue(&mut state, &name, message);
        }
        Ok(())
    }

    fn enqueue(&self, state: &mut BrokerState, queue: &str, message: PendingMessage) {
        state.next_tag += 1;
        let tag = state.next_tag;
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        while !q.consumers.is_empty() {
            let idx = q.next_consumer % q.consumers.len();
            let delivery = self.delivery(tag, &message);
            if q.consumers[idx].tx.send(Ok(delivery)).is_ok() {
                q.next_consumer = idx + 1;
                return;
            }
            q.consumers.remove(idx);
        }
        q.pending.push_back(message);
    }

    fn delivery(&self, tag: u64, message: &PendingMessage) -> Delivery {
        Delivery {
            delivery_tag: tag,
            routing_key: message.routing_key.clone(),
            headers: message.headers.clone(),
            body: message.body.clone(),
            redelivered: false,
            acker: Arc::new(MemoryAcker {
                broker: self.me.clone(),
                delivery_tag: tag,
                routing_key: message.routing_key.clone(),
            }),
        }
    }

    fn record_ack(&self, record: AckRecord) {
        self.state().acks.push(record);
    }
}

/// `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str, _dial: &DialConfig) -> Result<Arc<dyn AmqpConnection>> {
        let mut state = self.broker.state();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(RabbitMQError::ConnectionError(format!(
                "connection refused: {}",
                url
            )));
        }
        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionEntry {
                open: true,
                lost: None,
            },
        );
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    id: u64,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(
        &self,
        _prefetch_count: u16,
        _prefetch_global: bool,
        _confirm: bool,
    ) -> Result<Arc<dyn AmqpChannel>> {
        let mut state = self.broker.state();
        if !state.is_open(self.id) {
            return Err(RabbitMQError::ConnectionError(
                "connection is closed".to_string(),
            ));
        }
        let channel_id = state.next_id();
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            conn_id: self.id,
            channel_id,
            closed: AtomicBool::new(false),
        }))
    }

    fn notify_lost(&self) -> oneshot::Receiver<RabbitMQError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.broker.state();
        match state.connections.get_mut(&self.id) {
            Some(conn) if conn.open => conn.lost = Some(tx),
            _ => {
                let _ = tx.send(RabbitMQError::ConnectionError(
                    "connection already closed".to_string(),
                ));
            }
        }
        rx
    }

    fn is_connected(&self) -> bool {
        self.broker.state().is_open(self.id)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state();
        if let Some(conn) = state.connections.get_mut(&self.id) {
            conn.open = false;
            conn.lost = None;
        }
        let id = self.id;
        state.remove_consumers(|c| c.conn_id != id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    conn_id: u64,
    channel_id: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn check(&self, state: &BrokerState) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelError("channel is closed".to_string()));
        }
        if !state.is_open(self.conn_id) {
            return Err(RabbitMQError::ConnectionError(
                "connection is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn exchange(&self, name: &str, durable: bool) -> Result<()> {
        let mut state = self.broker.state();
        self.check(&state)?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != durable => Err(RabbitMQError::TopologyError(format!(
                "inequivalent arg 'durable' for exchange '{}'",
                name
            ))),
            _ => {
                state.exchanges.insert(name.to_string(), durable);
                Ok(())
            }
        }
    }

    fn queue(&self, name: &str, durable: bool) -> Result<String> {
        let mut state = self.broker.state();
        self.check(&state)?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };
        state
            .queues
            .entry(name.clone())
            .or_insert_with(|| MemoryQueue {
                auto_delete: !durable,
                bindings: Vec::new(),
                pending: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            });
        Ok(name)
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.exchange(name, false)
    }

    async fn declare_durable_exchange(&self, name: &str) -> Result<()> {
        self.exchange(name, true)
    }

    async fn declare_queue(&self, name: &str, _args: &FieldTable) -> Result<String> {
        self.queue(name, false)
    }

    async fn declare_durable_queue(&self, name: &str, _args: &FieldTable) -> Result<String> {
        self.queue(name, true)
    }

    async fn consume_queue(&self, queue: &str, _auto_ack: bool) -> Result<DeliveryStream> {
        let mut state = self.broker.state();
        state.consume_attempts.push(Instant::now());
        if state.fail_consumes > 0 {
            state.fail_consumes -= 1;
            return Err(RabbitMQError::ConsumeError(format!(
                "consume on '{}' refused",
                queue
            )));
        }
        self.check(&state)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(RabbitMQError::ConsumeError(format!(
                "no queue '{}'",
                queue
            )));
        };
        let pending: Vec<PendingMessage> = q.pending.drain(..).collect();
        q.consumers.push(ConsumerEntry {
            conn_id: self.conn_id,
            channel_id: self.channel_id,
            tx,
        });
        for message in pending {
            self.broker.enqueue(&mut state, queue, message);
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        _headers: &FieldTable,
    ) -> Result<()> {
        let mut state = self.broker.state();
        self.check(&state)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(RabbitMQError::TopologyError(format!(
                "no exchange '{}'",
                exchange
            )));
        }
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(RabbitMQError::TopologyError(format!("no queue '{}'", queue)));
        };
        let binding = (exchange.to_string(), routing_key.to_string());
        if !q.bindings.contains(&binding) {
            q.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, msg: Publishing) -> Result<()> {
        {
            let state = self.broker.state();
            self.check(&state)?;
        }
        self.broker.publish(exchange, routing_key, msg)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channel_id = self.channel_id;
        self.broker
            .state()
            .remove_consumers(|c| c.channel_id != channel_id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: Weak<MemoryBroker>,
    delivery_tag: u64,
    routing_key: String,
}

impl MemoryAcker {
    fn record(&self, kind: AckKind) -> Result<()> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| RabbitMQError::AckError("broker is gone".to_string()))?;
        broker.record_ack(AckRecord {
            delivery_tag: self.delivery_tag,
            routing_key: self.routing_key.clone(),
            kind,
        });
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.record(AckKind::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.record(AckKind::Nack { requeue })
    }
}
