//! Error taxonomy for the bus.
//!
//! Local mistakes (bad registrations, bad keys) fail immediately at the call
//! site. Cross-process failures (a remote handler error, a missing reply) come
//! back from [`call`](crate::ServiceBus::call) as typed variants instead of raw
//! transport errors.

use std::time::Duration;

use thiserror::Error;

use crate::bus::{CodecError, TransportError};
use crate::registry::CorrelationId;
use crate::topic::TopicError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by bus operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid registration or options. Raised at registration time, never
    /// at delivery time.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A publish key that cannot be routed.
    #[error("invalid routing key: {0}")]
    InvalidRoutingKey(#[from] TopicError),

    /// Connection or channel failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The remote command handler failed or could not decode its input.
    #[error("remote handler failed: {message}")]
    RemoteHandler {
        message: String,
        cause: Option<String>,
        /// Machine-readable failure class, e.g. `decode_failed` or
        /// `rejected`. `None` when the peer sent an unframed error.
        kind: Option<String>,
    },

    /// No reply arrived within the call's timeout.
    #[error("could not get a reply for command '{correlation_id}' sent to '{destination}' within {timeout:?}")]
    Timeout {
        correlation_id: CorrelationId,
        destination: String,
        timeout: Duration,
    },

    /// The call was still pending when the bus shut down.
    #[error("call '{correlation_id}' was cancelled before a reply arrived")]
    Cancelled { correlation_id: CorrelationId },

    /// Payload could not be encoded or decoded locally.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A pending call with this correlation id is already registered.
    #[error("correlation id '{0}' is already pending")]
    DuplicateCorrelation(CorrelationId),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Error::RemoteHandler { .. })
    }

    /// The [`HandlerError::kind`](crate::HandlerError::kind) a remote
    /// handler failed with, if it said.
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            Error::RemoteHandler { kind, .. } => kind.as_deref(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

/// Invalid registration or bus options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("queue name must not be empty")]
    EmptyQueueName,
    #[error("key must not be empty")]
    EmptyKey,
    #[error("command key '{0}' should not contain wildcards")]
    WildcardInCommandKey(String),
    #[error("invalid key or pattern: {0}")]
    InvalidPattern(#[from] TopicError),
    #[error("queue '{queue}' cannot carry both events and commands")]
    MixedQueue { queue: String },
    #[error("command '{key}' already has a handler on queue '{queue}'")]
    DuplicateCommand { queue: String, key: String },
    #[error("rpc timeout must be greater than zero")]
    InvalidTimeout,
    #[error("invalid value '{value}' for {name}")]
    InvalidSetting { name: &'static str, value: String },
}
