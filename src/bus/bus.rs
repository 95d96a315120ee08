//! Bus - one broker connection shared by every component of a service.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::codec::PayloadFormat;
use super::consumer::ConsumerHandle;
use super::envelope::{DeliveryTag, Envelope};
use super::stats::BusStats;
use super::transport::{ConsumeOptions, QueueSpec, Transport, TransportError};
use crate::config::BusOptions;
use crate::error::{ConfigurationError, Result};
use crate::topic::TopicPattern;

/// Owns the transport and serializes every write to it.
///
/// Publishes, declarations and acknowledgments issued concurrently from
/// handlers and callers go through a single write gate so frames never
/// interleave on the channel. Declarations are cached, so repeated
/// `declare_and_bind_queue` calls with the same arguments only touch the
/// broker once.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use topic_rpc::bus::{Bus, ConsumeOptions, Envelope, InMemoryBroker, MessageType};
/// use topic_rpc::BusOptions;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> topic_rpc::Result<()> {
/// let broker = InMemoryBroker::new();
/// let bus = Bus::connect(Arc::new(broker.connection()), BusOptions::default()).await?;
///
/// bus.declare_and_bind_queue("audit", None, &["order.#"]).await?;
/// bus.publish(Envelope::with_string_payload("order.placed", MessageType::Event, "{}"), None)
///     .await?;
///
/// assert_eq!(broker.queue_depth("audit"), Some(1));
/// bus.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Bus {
    transport: Arc<dyn Transport>,
    options: BusOptions,
    write_gate: Mutex<()>,
    declared_exchanges: DashSet<String>,
    declared_queues: DashSet<String>,
    bindings: DashSet<(String, String, String)>,
    stats: Arc<BusStats>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Bus {
    /// Open the transport and declare the bus exchange.
    ///
    /// A refused connection is returned here, at startup, rather than on the
    /// first publish.
    pub async fn connect(transport: Arc<dyn Transport>, options: BusOptions) -> Result<Self> {
        options.validate()?;
        transport.open(&options).await?;

        let bus = Self {
            transport,
            options,
            write_gate: Mutex::new(()),
            declared_exchanges: DashSet::new(),
            declared_queues: DashSet::new(),
            bindings: DashSet::new(),
            stats: Arc::new(BusStats::default()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };
        let exchange = bus.options.exchange_name.clone();
        bus.declare_exchange(&exchange).await?;

        tracing::info!(
            host = %bus.options.host,
            port = bus.options.port,
            exchange = %exchange,
            "bus connected"
        );
        Ok(bus)
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    /// The topic exchange events, commands and replies go through.
    pub fn exchange(&self) -> &str {
        &self.options.exchange_name
    }

    pub fn payload_format(&self) -> PayloadFormat {
        self.options.payload_format
    }

    pub fn stats(&self) -> &Arc<BusStats> {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Declare a topic exchange. Repeat calls are no-ops.
    pub async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        if self.declared_exchanges.contains(exchange) {
            return Ok(());
        }
        let _gate = self.write_gate.lock().await;
        self.transport.declare_exchange(exchange).await?;
        self.declared_exchanges.insert(exchange.to_string());
        Ok(())
    }

    /// Declare `queue` and bind it to `exchange` (the bus exchange when
    /// `None`) under each pattern.
    ///
    /// Patterns are validated before anything is declared. Declaring the same
    /// queue and bindings again produces no duplicate bindings.
    pub async fn declare_and_bind_queue(
        &self,
        queue: &str,
        exchange: Option<&str>,
        patterns: &[&str],
    ) -> Result<String> {
        if queue.trim().is_empty() {
            return Err(ConfigurationError::EmptyQueueName.into());
        }
        for pattern in patterns {
            TopicPattern::parse(*pattern).map_err(ConfigurationError::InvalidPattern)?;
        }

        let exchange = exchange.unwrap_or(&self.options.exchange_name).to_string();
        self.declare_exchange(&exchange).await?;

        if !self.declared_queues.contains(queue) {
            let _gate = self.write_gate.lock().await;
            self.transport.declare_queue(QueueSpec::named(queue)).await?;
            self.declared_queues.insert(queue.to_string());
        }
        for pattern in patterns {
            self.bind(queue, &exchange, pattern).await?;
        }
        Ok(queue.to_string())
    }

    /// Declare a private, server-named queue owned by this connection.
    pub async fn declare_private_queue(&self) -> Result<String> {
        let _gate = self.write_gate.lock().await;
        let name = self.transport.declare_queue(QueueSpec::server_named()).await?;
        self.declared_queues.insert(name.clone());
        tracing::debug!(queue = %name, "declared private queue");
        Ok(name)
    }

    /// Bind `queue` to `exchange` under `pattern`. Repeat calls are no-ops.
    pub async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let binding = (queue.to_string(), exchange.to_string(), pattern.to_string());
        if self.bindings.contains(&binding) {
            return Ok(());
        }
        let _gate = self.write_gate.lock().await;
        self.transport.bind_queue(queue, exchange, pattern).await?;
        tracing::debug!(queue, exchange, pattern, "queue bound");
        self.bindings.insert(binding);
        Ok(())
    }

    /// Bind a queue this bus does not own, such as a caller's reply queue.
    ///
    /// Not cached: such queues come and go with their callers, and the broker
    /// treats a repeated binding as a no-op.
    pub async fn bind_transient(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.transport.bind_queue(queue, exchange, pattern).await?;
        Ok(())
    }

    /// Bindings remembered by [`bind`](Self::bind).
    pub fn cached_bindings(&self) -> usize {
        self.bindings.len()
    }

    /// Publish through `exchange`, or the bus exchange when `None`.
    pub async fn publish(&self, envelope: Envelope, exchange: Option<&str>) -> Result<()> {
        let exchange = exchange.unwrap_or(&self.options.exchange_name);
        let _gate = self.write_gate.lock().await;
        self.transport.publish(exchange, envelope).await?;
        Ok(())
    }

    /// Start a consumer that hands every delivery on `queue` to `on_delivery`.
    ///
    /// The returned handle reports a mid-stream transport failure from
    /// `join()`/`stop()`. Closing the bus stops every consumer it started.
    pub async fn consume<F, Fut>(
        &self,
        queue: &str,
        options: ConsumeOptions,
        on_delivery: F,
    ) -> Result<ConsumerHandle>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stream = {
            let _gate = self.write_gate.lock().await;
            self.transport.consume(queue, options).await?
        };
        Ok(ConsumerHandle::spawn(
            queue.to_string(),
            stream,
            self.shutdown.child_token(),
            on_delivery,
        ))
    }

    /// Acknowledge one delivery.
    pub async fn acknowledge(&self, tag: DeliveryTag) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.transport.ack(tag).await?;
        self.stats.acked();
        Ok(())
    }

    /// Stop consumers without waiting for the transport.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Stop every consumer and close the transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        let _gate = self.write_gate.lock().await;
        match self.transport.close().await {
            Ok(()) | Err(TransportError::ConnectionClosed) => {
                tracing::info!(exchange = %self.options.exchange_name, "bus closed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
