//! Message envelope - the unit published to and delivered from the broker.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::CorrelationId;
use crate::topic::RoutingKey;

/// What kind of message an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Fire-and-forget, fanned out by topic.
    Event,
    /// Point-to-point request expecting a reply.
    Command,
    /// Reply to a command.
    Reply,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Event => f.write_str("event"),
            MessageType::Command => f.write_str("command"),
            MessageType::Reply => f.write_str("reply"),
        }
    }
}

/// Opaque acknowledgment token assigned by the transport on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message on the wire.
///
/// `reply_to` and `correlation_id` are either both set (command requests and
/// their replies) or both absent. `is_error` is only meaningful on replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique id of this message.
    pub message_id: String,
    pub routing_key: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Encoded payload (JSON text unless `content_type` says otherwise).
    pub payload: Vec<u8>,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Set by the transport on delivery; never serialized.
    #[serde(skip)]
    pub delivery_tag: Option<DeliveryTag>,
}

impl Envelope {
    fn new(
        routing_key: impl Into<String>,
        message_type: MessageType,
        payload: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            routing_key: routing_key.into(),
            message_type,
            payload,
            content_type: content_type.into(),
            correlation_id: None,
            reply_to: None,
            is_error: false,
            timestamp: chrono::Utc::now().timestamp(),
            delivery_tag: None,
        }
    }

    /// An event for topic fan-out.
    pub fn event(key: &RoutingKey, payload: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self::new(key.as_str(), MessageType::Event, payload, content_type)
    }

    /// A command request whose reply goes to `reply_to`.
    pub fn command(
        key: &RoutingKey,
        payload: Vec<u8>,
        content_type: impl Into<String>,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Self {
        let mut envelope = Self::new(key.as_str(), MessageType::Command, payload, content_type);
        envelope.correlation_id = Some(correlation_id.to_string());
        envelope.reply_to = Some(reply_to.into());
        envelope
    }

    /// A reply to `request`, published under `reply_key`.
    pub fn reply(
        request: &Envelope,
        reply_key: impl Into<String>,
        payload: Vec<u8>,
        content_type: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let mut envelope = Self::new(reply_key, MessageType::Reply, payload, content_type);
        envelope.correlation_id = request.correlation_id.clone();
        envelope.is_error = is_error;
        envelope
    }

    /// Create an envelope with a string payload.
    pub fn with_string_payload(
        routing_key: impl Into<String>,
        message_type: MessageType,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(
            routing_key,
            message_type,
            payload.into().into_bytes(),
            super::codec::JSON_CONTENT_TYPE,
        )
    }

    /// Returns `(reply_to, correlation_id)` when the request can be answered.
    pub fn reply_route(&self) -> Option<(&str, &str)> {
        match (&self.reply_to, &self.correlation_id) {
            (Some(reply_to), Some(correlation_id)) => Some((reply_to.as_str(), correlation_id.as_str())),
            _ => None,
        }
    }

    /// Checks the `reply_to`/`correlation_id` pairing.
    pub fn is_well_formed(&self) -> bool {
        match self.message_type {
            MessageType::Reply => self.correlation_id.is_some() && self.reply_to.is_none(),
            _ => self.reply_to.is_some() == self.correlation_id.is_some(),
        }
    }

    pub fn with_delivery_tag(mut self, tag: DeliveryTag) -> Self {
        self.delivery_tag = Some(tag);
        self
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
