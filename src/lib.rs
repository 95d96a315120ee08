//! Topic routing and request/response RPC over AMQP-style topic exchanges.
//!
//! - **Events** are published fire-and-forget under a routing key and fanned
//!   out to every queue bound with a matching `*`/`#` pattern.
//! - **Commands** go to exactly one handler; [`ServiceBus::call`] waits for
//!   the correlated reply and turns it into a value, a remote error, or a
//!   timeout.
//!
//! The broker itself is behind the [`bus::Transport`] trait;
//! [`bus::InMemoryBroker`] implements it in-process.

pub mod bus;
pub mod config;
pub mod error;
pub mod listener;
pub mod registry;
pub mod rpc;
mod service_bus;
pub mod topic;

pub use config::BusOptions;
pub use error::{ConfigurationError, Error, Result};
pub use listener::HandlerError;
pub use registry::CorrelationId;
pub use service_bus::ServiceBus;
