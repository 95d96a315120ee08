//! Broker transport - the wire-level primitives the bus is built on.
//!
//! A `Transport` is one connection to a broker that exposes AMQP-style topic
//! exchanges. Implementations might include:
//! - `InMemoryBroker` connections - for testing and single-process scenarios
//! - an AMQP 0-9-1 client for RabbitMQ
//!
//! Delivery guarantees are the broker's: at-least-once per queue and in order
//! within a single consumer.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::envelope::{DeliveryTag, Envelope};
use crate::config::BusOptions;

/// Name of the broker's default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Stream of deliveries for one consumer.
///
/// An `Err` item reports a mid-stream transport failure; the stream ends
/// after it.
pub type DeliveryStream = mpsc::UnboundedReceiver<Result<Envelope, TransportError>>;

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connecting to the broker failed.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    /// The connection or channel is gone.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),
    #[error("unknown exchange '{0}'")]
    UnknownExchange(String),
    /// Acknowledging a tag that is not outstanding.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),
    #[error("transport error: {0}")]
    Other(String),
}

/// Queue declaration arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    /// Empty asks the broker to generate a name.
    pub name: String,
    pub durable: bool,
    /// Owned by the declaring connection and deleted when it closes.
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A shared, non-exclusive queue.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A private queue whose name the broker generates.
    pub fn server_named() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Consumer arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries; 0 means unlimited.
    pub prefetch: u16,
    /// Deliveries count as acknowledged as soon as they are sent.
    pub auto_ack: bool,
}

impl ConsumeOptions {
    pub fn manual_ack(prefetch: u16) -> Self {
        Self {
            prefetch,
            auto_ack: false,
        }
    }

    pub fn auto_ack() -> Self {
        Self {
            prefetch: 0,
            auto_ack: true,
        }
    }
}

/// One connection to a topic-exchange broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the connection using the profile in `options`.
    async fn open(&self, options: &BusOptions) -> Result<(), TransportError>;

    /// Declare a topic exchange. Idempotent.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError>;

    /// Declare a queue and return its (possibly generated) name. Idempotent.
    async fn declare_queue(&self, spec: QueueSpec) -> Result<String, TransportError>;

    /// Bind `queue` to `exchange` under `pattern`. Idempotent.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError>;

    /// Publish to `exchange`, routed by the envelope's routing key.
    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Start consuming `queue`.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError>;

    /// Acknowledge one delivery.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// Close the connection, ending its consumers and deleting its exclusive
    /// queues.
    async fn close(&self) -> Result<(), TransportError>;
}
