//! In-memory topic-exchange broker for testing and single-process scenarios.
//!
//! `InMemoryBroker` holds the shared broker state (exchanges, queues,
//! bindings, outstanding deliveries). Each [`InMemoryConnection`] is one
//! client connection to it and implements [`Transport`], so several buses in
//! one test can talk to each other exactly as separate processes would
//! through a real broker.
//!
//! Features:
//! - Topic exchanges with `*`/`#` bindings and the default exchange
//! - Idempotent queue declaration and binding
//! - Server-named exclusive queues, deleted when their connection closes
//! - Competing consumers (round robin) with prefetch limits
//! - Acknowledgment accounting per delivery tag
//!
//! ## Example
//!
//! ```
//! use topic_rpc::bus::{InMemoryBroker, QueueSpec, Transport, ConsumeOptions, Envelope};
//! use topic_rpc::topic::RoutingKey;
//! use topic_rpc::BusOptions;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = InMemoryBroker::new();
//! let connection = broker.connection();
//! connection.open(&BusOptions::default()).await.unwrap();
//! connection.declare_exchange("shop").await.unwrap();
//! connection.declare_queue(QueueSpec::named("audit")).await.unwrap();
//! connection.bind_queue("audit", "shop", "order.#").await.unwrap();
//!
//! let mut deliveries = connection.consume("audit", ConsumeOptions::auto_ack()).await.unwrap();
//! let key = RoutingKey::parse("order.placed").unwrap();
//! connection
//!     .publish("shop", Envelope::event(&key, b"{}".to_vec(), "application/json"))
//!     .await
//!     .unwrap();
//!
//! let delivery = deliveries.recv().await.unwrap().unwrap();
//! assert_eq!(delivery.routing_key, "order.placed");
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::envelope::{DeliveryTag, Envelope};
use super::transport::{
    ConsumeOptions, DeliveryStream, QueueSpec, Transport, TransportError, DEFAULT_EXCHANGE,
};
use crate::config::BusOptions;
use crate::topic::TopicPattern;

/// Shared in-process broker. Cheap to clone.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    credentials: Option<(String, String)>,
    reachable: bool,
    next_connection: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    shut_down: bool,
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingEntry>,
    unacked: HashMap<DeliveryTag, Outstanding>,
    acks: HashMap<DeliveryTag, usize>,
    next_tag: u64,
    next_consumer: u64,
}

struct BindingEntry {
    exchange: String,
    pattern: TopicPattern,
    queue: String,
}

struct Outstanding {
    queue: String,
    consumer: u64,
    connection: u64,
    envelope: Envelope,
}

struct QueueState {
    spec: QueueSpec,
    owner: Option<u64>,
    ready: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

struct ConsumerSlot {
    id: u64,
    connection: u64,
    tx: mpsc::UnboundedSender<Result<Envelope, TransportError>>,
    options: ConsumeOptions,
    in_flight: usize,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.options.auto_ack
            || self.options.prefetch == 0
            || self.in_flight < usize::from(self.options.prefetch)
    }
}

impl QueueState {
    fn new(spec: QueueSpec, owner: Option<u64>) -> Self {
        Self {
            spec,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    /// Round-robin pick of the next consumer allowed another delivery.
    fn next_ready_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            if self.consumers[index].has_capacity() {
                self.cursor = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }
}

/// Hand ready messages of `queue_name` to consumers with spare capacity.
fn dispatch(state: &mut BrokerState, queue_name: &str) {
    let BrokerState {
        queues,
        unacked,
        next_tag,
        ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() {
        let Some(index) = queue.next_ready_consumer() else {
            break;
        };
        let Some(envelope) = queue.ready.pop_front() else {
            break;
        };

        *next_tag += 1;
        let tag = DeliveryTag(*next_tag);
        let delivery = envelope.clone().with_delivery_tag(tag);

        if queue.consumers[index].tx.send(Ok(delivery)).is_err() {
            // Receiver dropped without closing the connection.
            queue.consumers.remove(index);
            queue.cursor = 0;
            queue.ready.push_front(envelope);
            continue;
        }

        let consumer = &mut queue.consumers[index];
        if !consumer.options.auto_ack {
            consumer.in_flight += 1;
            unacked.insert(
                tag,
                Outstanding {
                    queue: queue_name.to_string(),
                    consumer: consumer.id,
                    connection: consumer.connection,
                    envelope,
                },
            );
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// A reachable broker that accepts any credentials.
    pub fn new() -> Self {
        Self::build(None, true)
    }

    /// A broker that only accepts `username`/`password`.
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::build(Some((username.into(), password.into())), true)
    }

    /// A broker that refuses every connection, as if the host were down.
    pub fn unreachable() -> Self {
        Self::build(None, false)
    }

    fn build(credentials: Option<(String, String)>, reachable: bool) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                credentials,
                reachable,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Create a new, not yet opened, client connection.
    pub fn connection(&self) -> InMemoryConnection {
        InMemoryConnection {
            broker: self.clone(),
            id: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(false),
        }
    }

    /// Stop the broker. Every open consumer stream receives
    /// `TransportError::ConnectionClosed` and ends; later operations fail.
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.shut_down = true;
        for queue in state.queues.values_mut() {
            for consumer in queue.consumers.drain(..) {
                let _ = consumer.tx.send(Err(TransportError::ConnectionClosed));
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of all declared queues.
    pub fn queue_names(&self) -> Vec<String> {
        self.state().queues.keys().cloned().collect()
    }

    /// Number of messages waiting in `queue` (not yet delivered).
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.ready.len())
    }

    /// `(exchange, pattern)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.pattern.as_str().to_string()))
            .collect()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Deliveries sent to manual-ack consumers and not yet acknowledged.
    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    /// How many times `tag` was acknowledged (including rejected repeats).
    pub fn ack_count(&self, tag: DeliveryTag) -> usize {
        self.state().acks.get(&tag).copied().unwrap_or(0)
    }

    /// Acknowledgment attempts for every tag that was ever acknowledged.
    pub fn ack_counts(&self) -> HashMap<DeliveryTag, usize> {
        self.state().acks.clone()
    }
}

/// One client connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    open: AtomicBool,
}

impl InMemoryConnection {
    /// Lock broker state after checking that this connection is usable.
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        let state = self.broker.state();
        if state.shut_down {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(state)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for InMemoryConnection {
    async fn open(&self, options: &BusOptions) -> Result<(), TransportError> {
        let inner = &self.broker.inner;
        if !inner.reachable {
            return Err(TransportError::ConnectionRefused(format!(
                "{}:{} is unreachable",
                options.host, options.port
            )));
        }
        if let Some((username, password)) = &inner.credentials {
            let accepted = options.username.as_deref() == Some(username.as_str())
                && options.password.as_deref() == Some(password.as_str());
            if !accepted {
                return Err(TransportError::ConnectionRefused(format!(
                    "authentication failed for user '{}'",
                    options.username.as_deref().unwrap_or("")
                )));
            }
        }
        if self.broker.state().shut_down {
            return Err(TransportError::ConnectionRefused(
                "broker is shut down".to_string(),
            ));
        }
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(());
        }
        let mut state = self.open_state()?;
        state.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<String, TransportError> {
        let mut state = self.open_state()?;
        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        match state.queues.get(&name) {
            Some(existing) => {
                if existing.spec.exclusive && existing.owner != Some(self.id) {
                    return Err(TransportError::Other(format!(
                        "queue '{}' is exclusive to another connection",
                        name
                    )));
                }
            }
            None => {
                let owner = spec.exclusive.then_some(self.id);
                let spec = QueueSpec {
                    name: name.clone(),
                    ..spec
                };
                state.queues.insert(name.clone(), QueueState::new(spec, owner));
            }
        }
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        if exchange == DEFAULT_EXCHANGE {
            return Err(TransportError::Other(
                "queues cannot be bound to the default exchange".to_string(),
            ));
        }
        if !state.exchanges.contains(exchange) {
            return Err(TransportError::UnknownExchange(exchange.to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::UnknownQueue(queue.to_string()));
        }
        let pattern =
            TopicPattern::parse(pattern).map_err(|e| TransportError::Other(e.to_string()))?;

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !exists {
            state.bindings.push(BindingEntry {
                exchange: exchange.to_string(),
                pattern,
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), TransportError> {
        let mut state = self.open_state()?;

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(&envelope.routing_key) {
                vec![envelope.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            if !state.exchanges.contains(exchange) {
                return Err(TransportError::UnknownExchange(exchange.to_string()));
            }
            let mut targets: Vec<String> = Vec::new();
            for binding in state.bindings.iter().filter(|b| {
                b.exchange == exchange && b.pattern.matches(&envelope.routing_key)
            }) {
                if !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            tracing::trace!(
                exchange = %exchange,
                routing_key = %envelope.routing_key,
                "message unroutable, discarded by broker"
            );
        }

        for queue_name in targets {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_back(envelope.clone());
            }
            dispatch(&mut state, &queue_name);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        let mut state = self.open_state()?;
        state.next_consumer += 1;
        let id = state.next_consumer;

        let (tx, rx) = mpsc::unbounded_channel();
        let slot = ConsumerSlot {
            id,
            connection: self.id,
            tx,
            options,
            in_flight: 0,
        };
        state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?
            .consumers
            .push(slot);

        dispatch(&mut state, queue);
        Ok(rx)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        *state.acks.entry(tag).or_insert(0) += 1;

        let outstanding = state
            .unacked
            .remove(&tag)
            .ok_or(TransportError::UnknownDeliveryTag(tag))?;

        if let Some(queue) = state.queues.get_mut(&outstanding.queue) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.id == outstanding.consumer)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }
        dispatch(&mut state, &outstanding.queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.broker.state();

        // Unacknowledged deliveries of this connection go back to their queues.
        let tags: Vec<DeliveryTag> = state
            .unacked
            .iter()
            .filter(|(_, o)| o.connection == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        let mut returned: Vec<(DeliveryTag, Outstanding)> = tags
            .into_iter()
            .filter_map(|tag| state.unacked.remove(&tag).map(|o| (tag, o)))
            .collect();
        // Front-insert newest first so the original order is restored.
        returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

        let mut touched: HashSet<String> = HashSet::new();
        for (_, outstanding) in returned {
            if let Some(queue) = state.queues.get_mut(&outstanding.queue) {
                queue.ready.push_front(outstanding.envelope);
            }
            touched.insert(outstanding.queue);
        }

        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.connection != self.id);
            queue.cursor = 0;
        }

        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            state.queues.remove(name);
            touched.remove(name);
        }
        state.bindings.retain(|b| !owned.contains(&b.queue));

        for name in touched {
            dispatch(&mut state, &name);
        }
        Ok(())
    }
}
