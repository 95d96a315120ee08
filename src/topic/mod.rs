//! Topic routing - routing keys, wildcard patterns, and in-process matching.
//!
//! Routing keys are dot-separated segments (`order.eu.placed`). Subscription
//! patterns may replace whole segments with wildcards:
//!
//! | wildcard | matches                    |
//! |----------|----------------------------|
//! | `*`      | exactly one segment        |
//! | `#`      | zero or more segments      |
//!
//! The broker only guarantees that a delivery reaches a queue. When several
//! handlers share one queue, [`TopicPattern::matches`] decides which of them
//! the delivery is for, so it has to agree with the broker's topic exchange.
//!
//! ```
//! use topic_rpc::topic::{matches, TopicPattern};
//!
//! assert!(matches("a.*", "a.b").unwrap());
//! assert!(!matches("a.*", "a.b.c").unwrap());
//!
//! let pattern = TopicPattern::parse("a.#").unwrap();
//! assert!(pattern.matches("a"));
//! assert!(pattern.matches("a.b.c"));
//! ```

mod error;
mod key;
mod pattern;

pub use error::TopicError;
pub use key::RoutingKey;
pub use pattern::TopicPattern;

/// Segment separator.
pub const SEPARATOR: char = '.';
/// Wildcard matching exactly one segment.
pub const SINGLE_WILDCARD: &str = "*";
/// Wildcard matching zero or more segments.
pub const MULTI_WILDCARD: &str = "#";

/// Returns true when `key` contains either wildcard character anywhere.
pub fn contains_wildcard(key: &str) -> bool {
    key.contains('*') || key.contains('#')
}

/// Compile `pattern` and test it against `key` in one step.
///
/// Prefer compiling a [`TopicPattern`] once when the same pattern is tested
/// repeatedly.
pub fn matches(pattern: &str, key: &str) -> Result<bool, TopicError> {
    Ok(TopicPattern::parse(pattern)?.matches(key))
}
