//! Topic patterns with a single-level `+` wildcard

use std::fmt;

const SEPARATOR: char = '/';
const WILDCARD: &str = "+";

/// A subscription pattern such as `watts/+/measurement`.
///
/// A `+` segment matches exactly one topic segment. Everything else matches
/// literally, so `watts/+/measurement` never matches `watts/A/extra/measurement`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPattern {
    pattern: String,
    is_wildcard: bool,
}

impl TopicPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let is_wildcard = pattern.split(SEPARATOR).any(|segment| segment == WILDCARD);
        Self {
            pattern,
            is_wildcard,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }

    pub fn matches(&self, topic: &str) -> bool {
        if !self.is_wildcard {
            return self.pattern == topic;
        }
        self.bind(topic).is_some()
    }

    /// Matches `topic` and returns the segments bound to the wildcards, in order.
    pub fn bind<'t>(&self, topic: &'t str) -> Option<Vec<&'t str>> {
        let mut pattern_parts = self.pattern.split(SEPARATOR);
        let mut topic_parts = topic.split(SEPARATOR);
        let mut bound = Vec::new();

        loop {
            match (pattern_parts.next(), topic_parts.next()) {
                (None, None) => return Some(bound),
                (Some(WILDCARD), Some(segment)) => {
                    if segment.is_empty() {
                        return None;
                    }
                    bound.push(segment);
                }
                (Some(expected), Some(segment)) if expected == segment => {}
                _ => return None,
            }
        }
    }

    /// The segment bound to the first wildcard, used as the device id.
    pub fn device_id<'t>(&self, topic: &'t str) -> Option<&'t str> {
        self.bind(topic)?.into_iter().next()
    }

    /// The concrete topic for `device_id`, with every wildcard replaced.
    pub fn topic_for(&self, device_id: &str) -> String {
        self.pattern
            .split(SEPARATOR)
            .map(|segment| if segment == WILDCARD { device_id } else { segment })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        TopicPattern::new(pattern)
    }
}
