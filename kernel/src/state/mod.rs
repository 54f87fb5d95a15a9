// Engine Phase Machine
//
// Tracks where the ordering & dedup engine is in its lifecycle and
// rejects any transition outside the allowed graph. In particular there
// is no path from a successful apply that bypasses checkpointing.

pub mod processed;

pub use processed::ProcessedSet;

/// Lifecycle phase of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Initializing,
    LoadingCheckpoint,

    /// Walking a sorted batch; between events.
    ReplayingBatch,

    CheckingDuplicate,
    Applying,

    /// The applier failed; the event was neither marked nor checkpointed.
    ApplyFailed,

    Checkpointing,

    /// Idle between batches.
    AwaitingMore,

    /// Bounded run finished.
    Terminated,

    /// Stopped after a failure. Restart to resume from the last checkpoint.
    Halted,
}

impl EnginePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnginePhase::Terminated | EnginePhase::Halted)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal phase transition: {0}")]
    IllegalTransition(String),
}

#[derive(Debug)]
pub struct PhaseMachine {
    phase: EnginePhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            phase: EnginePhase::Initializing,
        }
    }

    /// Move to `next` if the edge exists.
    pub fn advance(&mut self, next: EnginePhase) -> Result<(), StateError> {
        use EnginePhase::*;

        let allowed = match (self.phase, next) {
            (Initializing, LoadingCheckpoint) => true,
            (LoadingCheckpoint, ReplayingBatch | AwaitingMore) => true,
            (AwaitingMore, ReplayingBatch | Terminated) => true,

            // Per-event cycle
            (ReplayingBatch, CheckingDuplicate) => true,
            (CheckingDuplicate, ReplayingBatch | Applying) => true,
            (Applying, Checkpointing | ApplyFailed) => true,
            (ApplyFailed, ReplayingBatch) => true,
            (Checkpointing, ReplayingBatch) => true,

            // Batch exhausted
            (ReplayingBatch, AwaitingMore | Terminated) => true,

            (current, Halted) => !current.is_terminal(),

            _ => false,
        };

        if !allowed {
            return Err(StateError::IllegalTransition(format!(
                "cannot move from {:?} to {:?}",
                self.phase, next
            )));
        }

        self.phase = next;
        Ok(())
    }

    pub fn current(&self) -> EnginePhase {
        self.phase
    }
}
