// Event Source Abstraction
//
// Defines where validated events come from. A source may hand back
// events in any order and may redeliver events it already delivered
// (a restart re-scans the whole log). Deciding what is new is the
// engine's job, never the source's.

use std::io;
use std::path::PathBuf;

use super::{Event, ValidationError};

/// Events available at one poll, plus the records that failed validation.
#[derive(Debug, Default)]
pub struct SourceBatch {
    pub events: Vec<Event>,
    pub rejected: Vec<ValidationError>,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read event log {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Producer of validated events.
///
/// Implementations MAY:
/// - Deliver events out of identifier order
/// - Redeliver events from earlier polls or earlier runs
///
/// Implementations MUST NOT:
/// - Hand over records that failed validation as events
pub trait EventSource {
    /// Return every event currently available.
    fn poll(&mut self) -> Result<SourceBatch, SourceError>;
}

/// Source backed by a vector; every poll redelivers the full contents.
#[derive(Debug, Default, Clone)]
pub struct InMemoryEventSource {
    events: Vec<Event>,
}

impl InMemoryEventSource {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    /// Append an event, as if the log had grown.
    pub fn append(&mut self, event: Event) {
        self.events.push(event);
    }
}

impl EventSource for InMemoryEventSource {
    fn poll(&mut self) -> Result<SourceBatch, SourceError> {
        Ok(SourceBatch {
            events: self.events.clone(),
            rejected: Vec::new(),
        })
    }
}
