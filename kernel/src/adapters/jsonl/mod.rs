// JSON Lines Event Log Adapter
//
// Reads an event log with one JSON object per line and validates each
// record into a typed event. Rejected records are reported, never
// forwarded.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::log::{Event, EventId, EventSource, SourceBatch, SourceError, ValidationError};

/// Validate a single raw record.
///
/// `line` is 1-based and only used for error reporting.
pub fn validate_record(line: usize, raw: &str) -> Result<Event, ValidationError> {
    let event: Event = serde_json::from_str(raw).map_err(|e| ValidationError::Malformed {
        line,
        reason: e.to_string(),
    })?;

    if matches!(&event.id, EventId::Key(k) if k.trim().is_empty()) {
        return Err(ValidationError::EmptyId { line });
    }
    if event.category.trim().is_empty() {
        return Err(ValidationError::EmptyCategory { line });
    }

    Ok(event)
}

/// Parse the full contents of a log. Blank lines are ignored.
pub fn parse_log(contents: &str) -> SourceBatch {
    let mut batch = SourceBatch::default();

    for (idx, raw) in contents.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        match validate_record(idx + 1, raw) {
            Ok(event) => batch.events.push(event),
            Err(err) => {
                warn!(error = %err, "rejected event record");
                batch.rejected.push(err);
            }
        }
    }

    batch
}

/// Event source over a JSONL file that is re-read on every poll.
///
/// A missing file is an empty log.
#[derive(Debug, Clone)]
pub struct JsonlEventSource {
    path: PathBuf,
}

impl JsonlEventSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EventSource for JsonlEventSource {
    fn poll(&mut self) -> Result<SourceBatch, SourceError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no event log found, nothing to process");
                return Ok(SourceBatch::default());
            }
            Err(source) => {
                return Err(SourceError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let batch = parse_log(&contents);
        debug!(
            path = %self.path.display(),
            events = batch.events.len(),
            rejected = batch.rejected.len(),
            "polled event log"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn valid_record_becomes_event() {
        let event = validate_record(1, r#"{"id": "A1", "category": "sales", "value": 100}"#).unwrap();

        assert_eq!(event, Event::new("A1", "sales", json!(100)));
    }

    #[test]
    fn missing_fields_are_rejected() {
        for raw in [
            r#"{"category": "sales", "value": 1}"#,
            r#"{"id": 1, "value": 1}"#,
            r#"{"id": 1, "category": "sales"}"#,
        ] {
            let err = validate_record(3, raw).unwrap_err();
            assert!(
                matches!(err, ValidationError::Malformed { line: 3, .. }),
                "unexpected result for {raw}: {err:?}"
            );
        }
    }

    #[test]
    fn empty_id_and_category_are_rejected() {
        assert_eq!(
            validate_record(1, r#"{"id": " ", "category": "sales", "value": 1}"#).unwrap_err(),
            ValidationError::EmptyId { line: 1 }
        );
        assert_eq!(
            validate_record(2, r#"{"id": 1, "category": "", "value": 1}"#).unwrap_err(),
            ValidationError::EmptyCategory { line: 2 }
        );
    }

    #[test]
    fn negative_and_fractional_ids_are_rejected() {
        assert!(validate_record(1, r#"{"id": -1, "category": "c", "value": 1}"#).is_err());
        assert!(validate_record(1, r#"{"id": 1.5, "category": "c", "value": 1}"#).is_err());
    }

    #[test]
    fn parse_log_skips_blank_lines_and_collects_rejections() {
        let contents = "\n{\"id\": 1, \"category\": \"a\", \"value\": 1}\n   \nnot json\n{\"id\": 2, \"category\": \"b\", \"value\": null}\n";

        let batch = parse_log(contents);

        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.rejected.len(), 1);
        assert!(matches!(
            batch.rejected[0],
            ValidationError::Malformed { line: 4, .. }
        ));
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut source = JsonlEventSource::new(dir.path().join("events.jsonl"));

        let batch = source.poll().unwrap();
        assert!(batch.events.is_empty());
        assert!(batch.rejected.is_empty());
    }

    #[test]
    fn file_is_reread_on_every_poll() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "{\"id\": 1, \"category\": \"a\", \"value\": 1}\n").unwrap();

        let mut source = JsonlEventSource::new(&path);
        assert_eq!(source.poll().unwrap().events.len(), 1);

        std::fs::write(
            &path,
            "{\"id\": 1, \"category\": \"a\", \"value\": 1}\n{\"id\": 2, \"category\": \"a\", \"value\": 2}\n",
        )
        .unwrap();
        assert_eq!(source.poll().unwrap().events.len(), 2);
    }
}
