// Event Model
//
// Typed events as they reach the ordering & dedup engine. Everything
// here has already passed validation; the engine never sees raw records.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod store;

pub use store::{EventSource, InMemoryEventSource, SourceBatch, SourceError};

/// Unique, totally ordered identifier of an event.
///
/// Numeric ids sort numerically and before all textual ids.
/// Textual ids sort lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventId {
    Seq(u64),
    Key(String),
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventId::Seq(n) => write!(f, "{n}"),
            EventId::Key(k) => f.write_str(k),
        }
    }
}

impl From<u64> for EventId {
    fn from(n: u64) -> Self {
        EventId::Seq(n)
    }
}

impl From<&str> for EventId {
    fn from(k: &str) -> Self {
        EventId::Key(k.to_owned())
    }
}

impl From<String> for EventId {
    fn from(k: String) -> Self {
        EventId::Key(k)
    }
}

/// A single immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub category: String,
    pub value: serde_json::Value,
}

impl Event {
    pub fn new(
        id: impl Into<EventId>,
        category: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            value,
        }
    }
}

/// A raw record rejected before it could become an [`Event`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("line {line}: malformed record: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("line {line}: empty event id")]
    EmptyId { line: usize },

    #[error("line {line}: empty category")]
    EmptyCategory { line: usize },
}
