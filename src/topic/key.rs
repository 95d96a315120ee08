use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::TopicError;
use super::{contains_wildcard, SEPARATOR};

/// A concrete, publishable routing key such as `order.eu.placed`.
///
/// Every segment is non-empty and no segment contains `*` or `#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Validate `key` for publishing.
    pub fn parse(key: impl Into<String>) -> Result<Self, TopicError> {
        let key = key.into();
        if key.is_empty() {
            return Err(TopicError::Empty);
        }
        if contains_wildcard(&key) {
            return Err(TopicError::WildcardInKey { key });
        }
        if let Some(position) = key.split(SEPARATOR).position(str::is_empty) {
            return Err(TopicError::EmptySegment { key, position });
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Append `suffix` as one more segment.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}{}{}", self.0, SEPARATOR, suffix))
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for RoutingKey {
    type Error = TopicError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.0
    }
}
