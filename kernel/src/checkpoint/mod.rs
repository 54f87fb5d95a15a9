// Checkpoint Store
//
// Durable, crash-safe snapshot of which event ids have been applied.
// A store is a passive durability layer: it persists exactly what the
// engine hands it and loads exactly what was last persisted.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::log::EventId;

pub mod file;

pub use file::FileCheckpointStore;

/// Version of the persisted representation.
pub const CHECKPOINT_FORMAT: u32 = 1;

/// Most ids a checkpoint may hold. The tracker expands every range on
/// restore, so a larger count is treated as corruption rather than loaded.
pub const MAX_CHECKPOINT_IDS: u64 = 10_000_000;

/// Persistable snapshot of the processed set.
///
/// Numeric ids are compacted into sorted, disjoint, non-adjacent inclusive
/// runs. The first run is the contiguous prefix; later runs are the ids
/// applied above a gap. Textual ids are kept as a sorted list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format: u32,
    pub ranges: Vec<(u64, u64)>,
    pub keys: Vec<String>,
    pub applied: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::empty()
    }
}

impl Checkpoint {
    /// Checkpoint of a first run.
    pub fn empty() -> Self {
        Self {
            format: CHECKPOINT_FORMAT,
            ranges: Vec::new(),
            keys: Vec::new(),
            applied: 0,
            updated_at: None,
        }
    }

    /// Build the compact representation of a set of ids.
    pub fn from_ids<'a>(ids: impl IntoIterator<Item = &'a EventId>) -> Self {
        let mut seqs = Vec::new();
        let mut keys = Vec::new();
        for id in ids {
            match id {
                EventId::Seq(n) => seqs.push(*n),
                EventId::Key(k) => keys.push(k.clone()),
            }
        }
        seqs.sort_unstable();
        seqs.dedup();
        keys.sort_unstable();
        keys.dedup();

        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for n in seqs {
            match ranges.last_mut() {
                Some((_, end)) if end.checked_add(1) == Some(n) => *end = n,
                _ => ranges.push((n, n)),
            }
        }

        let mut checkpoint = Self {
            ranges,
            keys,
            ..Self::empty()
        };
        checkpoint.applied = checkpoint.len();
        checkpoint
    }

    /// Every id in the checkpoint: numeric ids ascending, then textual ids.
    pub fn ids(&self) -> impl Iterator<Item = EventId> + '_ {
        self.ranges
            .iter()
            .flat_map(|&(start, end)| (start..=end).map(EventId::Seq))
            .chain(self.keys.iter().cloned().map(EventId::Key))
    }

    pub fn contains(&self, id: &EventId) -> bool {
        match id {
            EventId::Seq(n) => {
                let idx = self.ranges.partition_point(|&(_, end)| end < *n);
                self.ranges
                    .get(idx)
                    .map_or(false, |&(start, _)| start <= *n)
            }
            EventId::Key(k) => self.keys.binary_search(k).is_ok(),
        }
    }

    /// Number of ids in the checkpoint.
    pub fn len(&self) -> u64 {
        let seqs = self
            .ranges
            .iter()
            .fold(0u64, |acc, &(start, end)| {
                acc.saturating_add((end - start).saturating_add(1))
            });
        seqs.saturating_add(self.keys.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.keys.is_empty()
    }

    /// Highest numeric id of the contiguous prefix.
    pub fn high_water_mark(&self) -> Option<u64> {
        self.ranges.first().map(|&(_, end)| end)
    }

    /// Serialize for persistence.
    pub fn encode(&self) -> Result<Vec<u8>, DurabilityError> {
        serde_json::to_vec_pretty(self).map_err(|e| DurabilityError::Encode(e.to_string()))
    }

    /// Parse and check a persisted checkpoint.
    ///
    /// `location` names the source in errors.
    pub fn decode(bytes: &[u8], location: &str) -> Result<Self, CheckpointError> {
        let corrupt = |reason: String| CheckpointError::Corrupt {
            location: location.to_owned(),
            reason,
        };

        let checkpoint: Checkpoint =
            serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
        checkpoint.check().map_err(corrupt)?;
        Ok(checkpoint)
    }

    fn check(&self) -> Result<(), String> {
        if self.format != CHECKPOINT_FORMAT {
            return Err(format!("unsupported format {}", self.format));
        }
        if self.applied > MAX_CHECKPOINT_IDS {
            return Err(format!(
                "applied count {} exceeds the limit of {MAX_CHECKPOINT_IDS}",
                self.applied
            ));
        }

        let mut total: u128 = 0;
        let mut prev_end: Option<u64> = None;
        for &(start, end) in &self.ranges {
            if start > end {
                return Err(format!("inverted range [{start}, {end}]"));
            }
            if let Some(prev) = prev_end {
                // Runs must be sorted and separated by at least one missing id.
                if prev >= start || prev + 1 == start {
                    return Err(format!("range [{start}, {end}] overlaps or touches {prev}"));
                }
            }
            total += u128::from(end - start) + 1;
            prev_end = Some(end);
        }

        for pair in self.keys.windows(2) {
            if pair[0] >= pair[1] {
                return Err(format!("keys not strictly sorted at {:?}", pair[1]));
            }
        }
        if self.keys.iter().any(|k| k.is_empty()) {
            return Err("empty key".into());
        }
        total += self.keys.len() as u128;

        if total != u128::from(self.applied) {
            return Err(format!(
                "applied count {} does not match {total} recorded ids",
                self.applied
            ));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint at {location} is corrupt: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("failed to read checkpoint at {location}: {source}")]
    Read {
        location: String,
        #[source]
        source: io::Error,
    },
}

/// A checkpoint write that did not complete durably.
#[derive(Debug, thiserror::Error)]
pub enum DurabilityError {
    #[error("checkpoint write failed: {0}")]
    Io(#[from] io::Error),

    #[error("checkpoint write did not complete within {0:?}")]
    Timeout(Duration),

    #[error("checkpoint writer exited without reporting an outcome")]
    WriterLost,

    #[error("checkpoint could not be encoded: {0}")]
    Encode(String),
}

/// Durability backend for checkpoints.
///
/// Properties required from implementations:
/// - `load` returns an empty checkpoint when nothing was ever saved
/// - `load` fails on anything it cannot parse, never resets progress
/// - `save` is atomic: after a crash either the previous or the new
///   checkpoint is observable, never a mixture
/// - `save` returns only once the checkpoint is durable
/// - a `save` that returned an error never becomes visible afterwards
pub trait CheckpointStore: Send {
    fn load(&self) -> Result<Checkpoint, CheckpointError>;

    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), DurabilityError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    bytes: Option<Vec<u8>>,
    saves: u64,
    fail_after: Option<u64>,
}

/// In-memory store holding the encoded checkpoint.
///
/// Clones share state, so a test can keep a handle to what was "durably"
/// saved after the engine that wrote it is dropped.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with raw persisted bytes.
    pub fn with_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let store = Self::default();
        store.inner.lock().bytes = Some(bytes.into());
        store
    }

    /// Let `successful` more saves through, then fail every save.
    pub fn fail_after(&self, successful: u64) {
        let mut state = self.inner.lock();
        state.fail_after = Some(state.saves + successful);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().fail_after = None;
    }

    /// Number of successful saves.
    pub fn saves(&self) -> u64 {
        self.inner.lock().saves
    }

    pub fn raw(&self) -> Option<Vec<u8>> {
        self.inner.lock().bytes.clone()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self) -> Result<Checkpoint, CheckpointError> {
        match &self.inner.lock().bytes {
            Some(bytes) => Checkpoint::decode(bytes, "memory"),
            None => Ok(Checkpoint::empty()),
        }
    }

    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), DurabilityError> {
        let bytes = checkpoint.encode()?;
        let mut state = self.inner.lock();

        if state.fail_after.map_or(false, |limit| state.saves >= limit) {
            return Err(DurabilityError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected checkpoint write failure",
            )));
        }

        state.bytes = Some(bytes);
        state.saves += 1;
        Ok(())
    }
}
