// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Pattern Matching
//!
//! Binding patterns follow topic exchange semantics: a pattern is split on `.` into
//! segments, where `*` matches exactly one routing key segment and `#` matches zero or
//! more segments. Any other segment must be equal to the routing key segment.
//!
//! A `#` followed by more segments (`audit.#.failed`) is supported: the segments after
//! `#` must match some suffix of the remaining routing key. Matching walks the pattern
//! once, tracking every routing key position reachable so far, so its cost is bounded
//! by pattern length times key length whatever the number of `#` segments.
//!
//! Patterns compiled with [`Pattern::exact`] disable wildcard resolution and only match
//! a routing key that is byte-for-byte equal to the pattern.

use crate::errors::AmqpError;
use std::fmt;

const SEPARATOR: char = '.';
const SINGLE_WILDCARD: &str = "*";
const MULTI_WILDCARD: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`
    One,
    /// `#`
    Many,
}

/// A compiled binding pattern. Immutable once compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segments: Option<Vec<Segment>>,
}

impl Pattern {
    /// Compiles a topic pattern with wildcard resolution.
    ///
    /// Fails with [`AmqpError::InvalidPatternError`] when the pattern is empty or a
    /// segment mixes a wildcard with other characters (`us*r`, `a#`).
    pub fn compile(raw: &str) -> Result<Pattern, AmqpError> {
        if raw.is_empty() {
            return Err(AmqpError::InvalidPatternError(raw.to_owned()));
        }

        let mut segments: Vec<Segment> = vec![];
        for part in raw.split(SEPARATOR) {
            let segment = match part {
                SINGLE_WILDCARD => Segment::One,
                MULTI_WILDCARD => Segment::Many,
                p if p.contains(['*', '#']) => {
                    return Err(AmqpError::InvalidPatternError(raw.to_owned()));
                }
                p => Segment::Literal(p.to_owned()),
            };

            // `#.#` matches exactly what `#` matches
            if segment == Segment::Many && segments.last() == Some(&Segment::Many) {
                continue;
            }
            segments.push(segment);
        }

        Ok(Pattern {
            raw: raw.to_owned(),
            segments: Some(segments),
        })
    }

    /// Compiles a pattern that matches only the identical routing key. `*` and `#`
    /// are plain characters.
    pub fn exact(raw: &str) -> Result<Pattern, AmqpError> {
        if raw.is_empty() {
            return Err(AmqpError::InvalidPatternError(raw.to_owned()));
        }

        Ok(Pattern {
            raw: raw.to_owned(),
            segments: None,
        })
    }

    /// Compiles `raw` with or without wildcard resolution.
    pub fn new(raw: &str, resolve_topics: bool) -> Result<Pattern, AmqpError> {
        if resolve_topics {
            Pattern::compile(raw)
        } else {
            Pattern::exact(raw)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when both patterns match exactly the same routing keys, regardless of how
    /// they were spelled (`user.#` and `user.#.#`).
    pub fn same_matches(&self, other: &Pattern) -> bool {
        match (&self.segments, &other.segments) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.raw == other.raw,
            _ => false,
        }
    }

    /// Tests a concrete routing key against this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        match &self.segments {
            None => self.raw == routing_key,
            Some(segments) => {
                let key: Vec<&str> = routing_key.split(SEPARATOR).collect();
                match_segments(segments, &key)
            }
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn match_segments(pattern: &[Segment], key: &[&str]) -> bool {
    // reachable[i]: the segments walked so far match the first `i` key segments
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;

    for segment in pattern {
        let mut next = vec![false; key.len() + 1];
        match segment {
            Segment::Many => {
                let mut seen = false;
                for (slot, &prev) in next.iter_mut().zip(&reachable) {
                    seen |= prev;
                    *slot = seen;
                }
            }
            Segment::One => {
                for (i, &prev) in reachable.iter().enumerate().take(key.len()) {
                    next[i + 1] = prev;
                }
            }
            Segment::Literal(literal) => {
                for (i, &prev) in reachable.iter().enumerate().take(key.len()) {
                    next[i + 1] = prev && key[i] == literal.as_str();
                }
            }
        }

        if !next.contains(&true) {
            return false;
        }
        reachable = next;
    }

    reachable[key.len()]
}
