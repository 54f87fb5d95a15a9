// Run Configuration
//
// Options recognized by a run, loadable from JSON. Missing fields fall
// back to the defaults below.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::file::DEFAULT_WRITE_TIMEOUT;

pub const DEFAULT_EVENT_LOG: &str = "events.jsonl";
pub const DEFAULT_CHECKPOINT: &str = "checkpoint.json";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Process what is in the log once, then exit.
    #[default]
    Bounded,

    /// Re-poll the log until stopped.
    Continuous,
}

/// What the engine does when the applier fails.
///
/// In both cases the failed event is not marked and not checkpointed,
/// so the next run retries it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the batch and surface the error.
    #[default]
    Halt,

    /// Log the failure and move on to the next event.
    LogAndContinue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub event_log: PathBuf,
    pub checkpoint: PathBuf,
    pub mode: RunMode,
    pub poll_interval_ms: u64,

    /// Stop a continuous run after this many polls. Unset runs forever.
    pub max_polls: Option<u64>,

    pub on_apply_failure: FailurePolicy,
    pub checkpoint_timeout_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            event_log: PathBuf::from(DEFAULT_EVENT_LOG),
            checkpoint: PathBuf::from(DEFAULT_CHECKPOINT),
            mode: RunMode::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_polls: None,
            on_apply_failure: FailurePolicy::default(),
            checkpoint_timeout_ms: DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl RunConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }
}
