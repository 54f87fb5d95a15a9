// Processed-Set Tracker
//
// In-memory record of every event id that has been applied. The set
// only ever grows; ids are never removed once marked.

use std::collections::HashSet;

use chrono::Utc;

use crate::checkpoint::Checkpoint;
use crate::log::EventId;

#[derive(Debug, Default, Clone)]
pub struct ProcessedSet {
    ids: HashSet<EventId>,
}

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a set from a loaded checkpoint.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let mut set = Self::new();
        set.restore(checkpoint);
        set
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    /// Mark an id as applied. Returns `false` if it already was.
    pub fn mark_processed(&mut self, id: EventId) -> bool {
        self.ids.insert(id)
    }

    /// Persistable representation of the current set, stamped with the
    /// current time.
    ///
    /// Rebuilds and sorts the whole set on every call, so checkpointing
    /// after each event costs O(N log N) per event and O(N² log N) over a
    /// log of N events. That is fine for logs up to a few hundred thousand
    /// ids; larger logs want an incremental encoding.
    pub fn snapshot(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint::from_ids(&self.ids);
        checkpoint.updated_at = Some(Utc::now());
        checkpoint
    }

    /// Replace the in-memory state with the contents of `checkpoint`.
    pub fn restore(&mut self, checkpoint: &Checkpoint) {
        self.ids = checkpoint.ids().collect();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
