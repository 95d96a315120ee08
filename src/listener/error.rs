//! Error type returned by event and command handlers.

use std::any::Any;
use std::error::Error as StdError;

use thiserror::Error;

use crate::bus::CodecError;

/// Error type for handler operations.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No handler registered for this command key.
    #[error("no handler registered for command '{0}'")]
    UnknownCommand(String),
    /// Payload decode / deserialization failed.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// The handler's return value could not be encoded.
    #[error("encode failed: {0}")]
    EncodeFailed(String),
    /// Business logic rejected the message (validation, invariant violation).
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("handler error: {0}")]
    Other(#[source] Box<dyn StdError + Send + Sync>),
}

impl HandlerError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        HandlerError::Rejected(reason.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        HandlerError::NotFound(what.into())
    }

    pub fn other(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        HandlerError::Other(err.into())
    }

    /// Stable machine-readable name, carried in error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::UnknownCommand(_) => "unknown_command",
            HandlerError::DecodeFailed(_) => "decode_failed",
            HandlerError::EncodeFailed(_) => "encode_failed",
            HandlerError::Rejected(_) => "rejected",
            HandlerError::NotFound(_) => "not_found",
            HandlerError::Panicked(_) => "panicked",
            HandlerError::Other(_) => "other",
        }
    }

    /// Innermost description of what went wrong, if there is more than the
    /// top-level message.
    pub fn cause(&self) -> Option<String> {
        let mut source = self.source()?;
        while let Some(next) = source.source() {
            source = next;
        }
        Some(source.to_string())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        HandlerError::Panicked(message)
    }
}

impl From<CodecError> for HandlerError {
    fn from(err: CodecError) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}
