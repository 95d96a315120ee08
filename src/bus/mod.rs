//! Bus - broker plumbing shared by events, commands and replies.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Bus (per service)                         │
//! │  - declare_and_bind_queue() / publish() / consume() / ack() │
//! │  - one write gate, cached declarations, BusStats            │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Transport trait                          │
//! │  open / declare_exchange / declare_queue / bind_queue       │
//! │  publish / consume / ack / close                            │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                    │
//!          ▼                                    ▼
//! ┌─────────────────┐              ┌─────────────────────────┐
//! │ InMemoryBroker  │              │  AMQP 0-9-1 client      │
//! │   (included)    │              │      (external)         │
//! └─────────────────┘              └─────────────────────────┘
//! ```

mod bus;
mod codec;
mod consumer;
mod envelope;
mod in_memory_broker;
mod stats;
mod transport;

pub use bus::Bus;
pub use codec::{
    decode_payload, CodecError, PayloadFormat, BITCODE_CONTENT_TYPE, JSON_CONTENT_TYPE,
};
pub use consumer::{ConsumerHandle, ConsumerStats};
pub use envelope::{DeliveryTag, Envelope, MessageType};
pub use in_memory_broker::{InMemoryBroker, InMemoryConnection};
pub use stats::{BusStats, StatsSnapshot};
pub use transport::{
    ConsumeOptions, DeliveryStream, QueueSpec, Transport, TransportError, DEFAULT_EXCHANGE,
};
