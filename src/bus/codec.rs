//! Payload encoding between typed values and envelope bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::envelope::Envelope;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const BITCODE_CONTENT_TYPE: &str = "application/x-bitcode";

/// Error type for payload encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),
}

/// Wire format for payloads.
///
/// `Json` is UTF-8 text and interoperates with other bus clients. `Bitcode`
/// is a compact binary format for Rust-to-Rust traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Json,
    Bitcode,
}

impl PayloadFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            PayloadFormat::Json => JSON_CONTENT_TYPE,
            PayloadFormat::Bitcode => BITCODE_CONTENT_TYPE,
        }
    }

    /// Resolve a content type. An empty content type is treated as JSON.
    pub fn from_content_type(content_type: &str) -> Result<Self, CodecError> {
        match content_type {
            "" | JSON_CONTENT_TYPE => Ok(PayloadFormat::Json),
            BITCODE_CONTENT_TYPE => Ok(PayloadFormat::Bitcode),
            other => Err(CodecError::UnsupportedContentType(other.to_string())),
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            PayloadFormat::Json => {
                serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
            }
            PayloadFormat::Bitcode => {
                bitcode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            PayloadFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
            PayloadFormat::Bitcode => {
                bitcode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
        }
    }
}

/// Decode an envelope's payload using the format its sender declared.
pub fn decode_payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, CodecError> {
    PayloadFormat::from_content_type(&envelope.content_type)?.decode(&envelope.payload)
}
