use thiserror::Error;

/// A routing key or topic pattern that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("routing key is empty")]
    Empty,
    #[error("'{key}' has an empty segment at position {position}")]
    EmptySegment { key: String, position: usize },
    #[error("'{key}' contains a wildcard; wildcards are only valid in subscription patterns")]
    WildcardInKey { key: String },
    #[error("'{pattern}' has segment '{segment}' mixing a wildcard with literal text")]
    MalformedWildcard { pattern: String, segment: String },
}
