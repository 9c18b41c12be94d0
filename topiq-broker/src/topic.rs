//! Topic-exchange pattern matching.
//!
//! Routing keys and binding patterns are dot-delimited word sequences. In a
//! pattern, `*` stands for exactly one word and `#` for zero or more words.
//! Every other segment must equal the word at the same position, and the
//! whole routing key must be consumed.
//!
//! ```rust
//! use topiq_broker::topic::matches;
//!
//! assert!(matches("some.event", "some.*"));
//! assert!(!matches("some.other.event", "some.*"));
//! assert!(matches("some", "some.#"));
//! ```

use std::fmt;

/// One dot-separated segment of a binding pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Must equal the word at this position
    Literal(String),
    /// `*`: exactly one word
    Star,
    /// `#`: zero or more words
    Hash,
}

/// A binding pattern split into segments once, so it can be matched many times.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse a pattern. Parsing never fails: any string is a valid pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let segments = raw
            .split('.')
            .map(|segment| match segment {
                "*" => Segment::Star,
                "#" => Segment::Hash,
                word => Segment::Literal(word.to_string()),
            })
            .collect();

        Self { raw, segments }
    }

    /// The pattern as it was written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True when the pattern contains no wildcard segments.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    /// Check a routing key (event name) against this pattern.
    pub fn matches(&self, name: &str) -> bool {
        if name == self.raw {
            return true;
        }

        let words: Vec<&str> = name.split('.').collect();
        let n = words.len();

        // next[i] holds whether words[i..] matches the segments after the
        // current one; filled from the last segment backwards.
        let mut next = vec![false; n + 1];
        next[n] = true;

        for segment in self.segments.iter().rev() {
            let mut current = vec![false; n + 1];
            for i in (0..=n).rev() {
                current[i] = match segment {
                    Segment::Hash => next[i] || (i < n && current[i + 1]),
                    Segment::Star => i < n && next[i + 1],
                    Segment::Literal(literal) => i < n && words[i] == literal && next[i + 1],
                };
            }
            next = current;
        }

        next[0]
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

impl From<String> for TopicPattern {
    fn from(pattern: String) -> Self {
        Self::new(pattern)
    }
}

/// Check whether `name` is matched by the topic `pattern`.
pub fn matches(name: &str, pattern: &str) -> bool {
    name == pattern || TopicPattern::new(pattern).matches(name)
}
