// Appliers
//
// The business action run once per new event. The engine calls an
// applier at most once per event id across restarts; an applier never
// needs to deduplicate on its own.

use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::log::{Event, EventId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("failed to apply event {id}: {reason}")]
pub struct ApplyError {
    pub id: EventId,
    pub reason: String,
}

pub trait Applier {
    fn apply(&mut self, event: &Event) -> Result<(), ApplyError>;
}

/// Output record written for each applied event.
#[derive(Debug, Serialize)]
struct AppliedRecord<'a> {
    id: &'a EventId,
    category: &'a str,
    value: &'a serde_json::Value,
    processed_at: DateTime<Utc>,
}

/// Writes one JSON object per applied event and flushes after each one.
#[derive(Debug)]
pub struct JsonLinesApplier<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesApplier<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Applier for JsonLinesApplier<W> {
    fn apply(&mut self, event: &Event) -> Result<(), ApplyError> {
        let record = AppliedRecord {
            id: &event.id,
            category: &event.category,
            value: &event.value,
            processed_at: Utc::now(),
        };
        let fail = |reason: String| ApplyError {
            id: event.id.clone(),
            reason,
        };

        let line = serde_json::to_string(&record).map_err(|e| fail(e.to_string()))?;
        writeln!(self.out, "{line}").map_err(|e| fail(e.to_string()))?;
        self.out.flush().map_err(|e| fail(e.to_string()))
    }
}

#[derive(Debug, Default)]
struct Recorded {
    applied: Vec<EventId>,
    fail_on: Option<EventId>,
}

/// Records applied ids in call order.
///
/// Clones share the record, so it survives the engine that owns the
/// applier being dropped.
#[derive(Debug, Clone, Default)]
pub struct RecordingApplier {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail whenever the event with `id` is applied.
    pub fn fail_on(&self, id: impl Into<EventId>) {
        self.inner.lock().fail_on = Some(id.into());
    }

    pub fn clear_failure(&self) {
        self.inner.lock().fail_on = None;
    }

    pub fn applied(&self) -> Vec<EventId> {
        self.inner.lock().applied.clone()
    }
}

impl Applier for RecordingApplier {
    fn apply(&mut self, event: &Event) -> Result<(), ApplyError> {
        let mut recorded = self.inner.lock();
        if recorded.fail_on.as_ref() == Some(&event.id) {
            return Err(ApplyError {
                id: event.id.clone(),
                reason: "injected failure".into(),
            });
        }
        recorded.applied.push(event.id.clone());
        Ok(())
    }
}
