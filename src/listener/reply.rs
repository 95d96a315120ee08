//! Reply framing shared by the command listener and the RPC client.

use serde::{Deserialize, Serialize};

use super::error::HandlerError;
use crate::bus::{decode_payload, Envelope, PayloadFormat};
use crate::error::Error;
use crate::topic::SEPARATOR;

/// Last segment of every reply routing key.
pub const REPLY_SUFFIX: &str = "Reply";

/// Routing key replies to `routing_key` are published under.
pub fn reply_key(routing_key: &str) -> String {
    format!("{}{}{}", routing_key, SEPARATOR, REPLY_SUFFIX)
}

/// Payload of a reply with `is_error` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
    #[serde(default)]
    pub cause: Option<String>,
    /// Machine-readable [`HandlerError::kind`].
    #[serde(default)]
    pub kind: Option<String>,
}

impl ErrorReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            kind: None,
        }
    }

    /// Encode for the wire. Falls back to the bare message if the format
    /// cannot encode the struct.
    pub fn encode(&self, format: PayloadFormat) -> Vec<u8> {
        format
            .encode(self)
            .unwrap_or_else(|_| self.message.clone().into_bytes())
    }

    /// Read an error reply, accepting a plain-text payload from peers that do
    /// not frame their errors.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        decode_payload::<ErrorReply>(envelope).unwrap_or_else(|_| {
            let text = envelope
                .payload_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} byte error payload", envelope.payload.len()));
            ErrorReply::new(text)
        })
    }

    pub fn into_error(self) -> Error {
        Error::RemoteHandler {
            message: self.message,
            cause: self.cause,
            kind: self.kind,
        }
    }
}

impl From<&HandlerError> for ErrorReply {
    fn from(err: &HandlerError) -> Self {
        Self {
            message: err.to_string(),
            cause: err.cause(),
            kind: Some(err.kind().to_string()),
        }
    }
}
