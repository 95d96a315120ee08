use std::fmt;

use regex::Regex;

use super::error::TopicError;
use super::{MULTI_WILDCARD, SEPARATOR, SINGLE_WILDCARD};

/// A compiled subscription pattern.
///
/// The pattern is translated once into an anchored regular expression. Both
/// sides are normalized so that every segment carries its leading separator:
/// the key `a.b` is matched as `.a.b`, a literal segment `x` becomes `\.x`,
/// `*` becomes `\.[^.]+` and `#` becomes `(?:\.[^.]+)*`. With the separator
/// owned by the segment, `#` can match zero segments at the start, middle or
/// end of a key without leaving a dangling dot behind.
#[derive(Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    /// Validate and compile a pattern.
    pub fn parse(pattern: impl Into<String>) -> Result<Self, TopicError> {
        let source = pattern.into();
        if source.is_empty() {
            return Err(TopicError::Empty);
        }

        let mut expr = String::with_capacity(source.len() * 2 + 2);
        expr.push('^');
        for (position, segment) in source.split(SEPARATOR).enumerate() {
            match segment {
                "" => {
                    return Err(TopicError::EmptySegment {
                        key: source.clone(),
                        position,
                    })
                }
                SINGLE_WILDCARD => expr.push_str(r"\.[^.]+"),
                MULTI_WILDCARD => expr.push_str(r"(?:\.[^.]+)*"),
                literal if super::contains_wildcard(literal) => {
                    return Err(TopicError::MalformedWildcard {
                        pattern: source.clone(),
                        segment: literal.to_string(),
                    })
                }
                literal => {
                    expr.push_str(r"\.");
                    expr.push_str(&regex::escape(literal));
                }
            }
        }
        expr.push('$');

        // Escaped literals and fixed fragments always form a valid expression.
        let regex = Regex::new(&expr).map_err(|_| TopicError::MalformedWildcard {
            pattern: source.clone(),
            segment: source.clone(),
        })?;

        Ok(Self { source, regex })
    }

    /// Test a routing key against this pattern.
    pub fn matches(&self, key: &str) -> bool {
        if key.is_empty() {
            return self.regex.is_match("");
        }
        let mut normalized = String::with_capacity(key.len() + 1);
        normalized.push(SEPARATOR);
        normalized.push_str(key);
        self.regex.is_match(&normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when the pattern has no wildcard segment.
    pub fn is_literal(&self) -> bool {
        !super::contains_wildcard(&self.source)
    }
}

impl fmt::Debug for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopicPattern").field(&self.source).finish()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for TopicPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for TopicPattern {}
