// Ordering & Dedup Engine
//
// Replays batches of validated events in identifier order, skips every
// id already in the processed set, and checkpoints after each applied
// event before touching the next one.

use serde::Serialize;
use tracing::{debug, error, info};

use crate::apply::{ApplyError, Applier};
use crate::checkpoint::{CheckpointError, CheckpointStore, DurabilityError};
use crate::config::FailurePolicy;
use crate::log::{Event, EventId};
use crate::state::{EnginePhase, PhaseMachine, ProcessedSet, StateError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to load checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("checkpoint after applying event {id} is not durable: {source}")]
    Durability {
        id: EventId,
        #[source]
        source: DurabilityError,
    },

    #[error("engine phase error: {0}")]
    State(#[from] StateError),

    #[error("engine halted after an earlier failure; restart to resume from the last checkpoint")]
    Halted,
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Sole owner of the processed set and sole writer of the checkpoint.
///
/// Every step that touches either takes `&mut self`, so checking,
/// applying and checkpointing an event can never interleave with
/// another event's.
pub struct Engine<S: CheckpointStore, A: Applier> {
    store: S,
    applier: A,
    processed: ProcessedSet,
    machine: PhaseMachine,
    policy: FailurePolicy,
    restored: usize,
}

impl<S: CheckpointStore, A: Applier> Engine<S, A> {
    /// Load the last checkpoint and restore the processed set from it.
    ///
    /// A corrupt checkpoint is fatal: starting empty would re-apply
    /// everything already applied.
    pub fn open(store: S, applier: A, policy: FailurePolicy) -> Result<Self, EngineError> {
        let mut machine = PhaseMachine::new();
        machine.advance(EnginePhase::LoadingCheckpoint)?;

        let checkpoint = store.load()?;
        if checkpoint.is_empty() {
            info!("checkpoint is empty, every event is new");
        }
        let processed = ProcessedSet::from_checkpoint(&checkpoint);
        info!(
            restored = processed.len(),
            high_water_mark = ?checkpoint.high_water_mark(),
            "checkpoint loaded"
        );

        machine.advance(EnginePhase::AwaitingMore)?;
        let restored = processed.len();

        Ok(Self {
            store,
            applier,
            processed,
            machine,
            policy,
            restored,
        })
    }

    /// Apply every not-yet-processed event of `events` in ascending id order.
    pub fn process_batch(&mut self, mut events: Vec<Event>) -> Result<BatchReport, EngineError> {
        if self.machine.current() == EnginePhase::Halted {
            return Err(EngineError::Halted);
        }
        self.machine.advance(EnginePhase::ReplayingBatch)?;

        // Stable: equal ids keep arrival order.
        events.sort_by(|a, b| a.id.cmp(&b.id));

        let mut report = BatchReport {
            received: events.len(),
            ..BatchReport::default()
        };

        for event in &events {
            self.machine.advance(EnginePhase::CheckingDuplicate)?;
            if self.processed.contains(&event.id) {
                debug!(id = %event.id, "skipping already processed event");
                report.duplicates += 1;
                self.machine.advance(EnginePhase::ReplayingBatch)?;
                continue;
            }

            self.machine.advance(EnginePhase::Applying)?;
            if let Err(err) = self.applier.apply(event) {
                self.machine.advance(EnginePhase::ApplyFailed)?;
                report.failed += 1;

                match self.policy {
                    FailurePolicy::Halt => {
                        error!(id = %event.id, error = %err, "apply failed, halting batch");
                        self.machine.advance(EnginePhase::Halted)?;
                        return Err(err.into());
                    }
                    FailurePolicy::LogAndContinue => {
                        error!(id = %event.id, error = %err, "apply failed, continuing");
                        self.machine.advance(EnginePhase::ReplayingBatch)?;
                        continue;
                    }
                }
            }

            self.machine.advance(EnginePhase::Checkpointing)?;
            self.processed.mark_processed(event.id.clone());
            if let Err(source) = self.store.save(&self.processed.snapshot()) {
                error!(id = %event.id, error = %source, "checkpoint write failed, halting");
                self.machine.advance(EnginePhase::Halted)?;
                return Err(EngineError::Durability {
                    id: event.id.clone(),
                    source,
                });
            }
            debug!(id = %event.id, category = %event.category, "applied event");
            report.applied += 1;

            self.machine.advance(EnginePhase::ReplayingBatch)?;
        }

        self.machine.advance(EnginePhase::AwaitingMore)?;
        info!(
            received = report.received,
            applied = report.applied,
            duplicates = report.duplicates,
            failed = report.failed,
            "batch complete"
        );

        Ok(report)
    }

    /// End a bounded run.
    pub fn terminate(&mut self) -> Result<(), EngineError> {
        self.machine.advance(EnginePhase::Terminated)?;
        Ok(())
    }

    pub fn phase(&self) -> EnginePhase {
        self.machine.current()
    }

    pub fn processed(&self) -> &ProcessedSet {
        &self.processed
    }

    /// Number of ids restored from the checkpoint at startup.
    pub fn restored(&self) -> usize {
        self.restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::RecordingApplier;
    use crate::checkpoint::InMemoryCheckpointStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn events(ids: &[u64]) -> Vec<Event> {
        ids.iter()
            .map(|&id| Event::new(id, "sales", json!(id * 10)))
            .collect()
    }

    fn seqs(ids: &[u64]) -> Vec<EventId> {
        ids.iter().map(|&id| EventId::Seq(id)).collect()
    }

    fn open(
        store: &InMemoryCheckpointStore,
        applier: &RecordingApplier,
        policy: FailurePolicy,
    ) -> Engine<InMemoryCheckpointStore, RecordingApplier> {
        Engine::open(store.clone(), applier.clone(), policy).unwrap()
    }

    #[test]
    fn out_of_order_batch_is_applied_in_id_order() {
        let store = InMemoryCheckpointStore::new();
        let applier = RecordingApplier::new();
        let mut engine = open(&store, &applier, FailurePolicy::Halt);

        let report = engine.process_batch(events(&[3, 1, 2])).unwrap();

        assert_eq!(applier.applied(), seqs(&[1, 2, 3]));
        assert_eq!(report.applied, 3);
        assert_eq!(store.saves(), 3);
        assert_eq!(engine.phase(), EnginePhase::AwaitingMore);
    }

    #[test]
    fn redelivery_after_restart_applies_nothing() {
        let store = InMemoryCheckpointStore::new();
        let applier = RecordingApplier::new();

        let mut engine = open(&store, &applier, FailurePolicy::Halt);
        engine.process_batch(events(&[3, 1, 2])).unwrap();
        drop(engine);

        let mut engine = open(&store, &applier, FailurePolicy::Halt);
        for id in seqs(&[1, 2, 3]) {
            assert!(engine.processed().contains(&id));
        }

        let report = engine.process_batch(events(&[3, 1, 2])).unwrap();

        assert_eq!(report.duplicates, 3);
        assert_eq!(report.applied, 0);
        assert_eq!(applier.applied(), seqs(&[1, 2, 3]));
        for id in seqs(&[1, 2, 3]) {
            assert!(engine.processed().contains(&id));
        }
    }

    #[test]
    fn duplicates_within_one_batch_apply_once() {
        let store = InMemoryCheckpointStore::new();
        let applier = RecordingApplier::new();
        let mut engine = open(&store, &applier, FailurePolicy::Halt);

        let report = engine.process_batch(events(&[2, 1, 2, 1])).unwrap();

        assert_eq!(applier.applied(), seqs(&[1, 2]));
        assert_eq!(report.duplicates, 2);
    }

    #[test]
    fn ids_below_processed_ones_are_still_new() {
        let store = InMemoryCheckpointStore::new();
        let applier = RecordingApplier::new();
        let mut engine = open(&store, &applier, FailurePolicy::Halt);

        engine.process_batch(events(&[10, 11])).unwrap();
        engine.process_batch(events(&[10, 11, 4])).unwrap();

        assert_eq!(applier.applied(), seqs(&[10, 11, 4]));
    }

    #[test]
    fn apply_failure_halts_without_checkpointing() {
        let store = InMemoryCheckpointStore::new();
        let applier = RecordingApplier::new();
        applier.fail_on(2);
        let mut engine = open(&store, &applier, FailurePolicy::Halt);

        let err = engine.process_batch(events(&[1, 2, 3])).unwrap_err();

        assert!(matches!(err, EngineError::Apply(ApplyError { ref id, .. }) if *id == EventId::Seq(2)));
        assert_eq!(applier.applied(), seqs(&[1]));
        assert_eq!(engine.phase(), EnginePhase::Halted);
        assert!(!engine.processed().contains(&EventId::Seq(2)));
        assert_eq!(store.load().unwrap().ids().collect::<Vec<_>>(), seqs(&[1]));

        assert!(matches!(
            engine.process_batch(events(&[3])).unwrap_err(),
            EngineError::Halted
        ));
    }

    #[test]
    fn failed_event_is_retried_on_restart() {
        let store = InMemoryCheckpointStore::new();
        let applier = RecordingApplier::new();
        applier.fail_on(2);

        let mut engine = open(&store, &applier, FailurePolicy::Halt);
        assert!(engine.process_batch(events(&[1, 2, 3])).is_err());
        drop(engine);

        applier.clear_failure();
        let mut engine = open(&store, &applier, FailurePolicy::Halt);
        engine.process_batch(events(&[1, 2, 3])).unwrap();

        assert_eq!(applier.applied(), seqs(&[1, 2, 3]));
    }

    #[test]
    fn log_and_continue_skips_failed_event() {
        let store = InMemoryCheckpointStore::new();
        let applier = RecordingApplier::new();
        applier.fail_on(2);
        let mut engine = open(&store, &applier, FailurePolicy::LogAndContinue);

        let report = engine.process_batch(events(&[3, 2, 1])).unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(applier.applied(), seqs(&[1, 3]));
        assert!(!engine.processed().contains(&EventId::Seq(2)));

        applier.clear_failure();
        engine.process_batch(events(&[3, 2, 1])).unwrap();
        assert_eq!(applier.applied(), seqs(&[1, 3, 2]));
    }

    #[test]
    fn durability_failure_halts_and_event_is_redone_on_restart() {
        let store = InMemoryCheckpointStore::new();
        let applier = RecordingApplier::new();
        store.fail_after(1);

        let mut engine = open(&store, &applier, FailurePolicy::Halt);
        let err = engine.process_batch(events(&[1, 2, 3])).unwrap_err();
        assert!(matches!(err, EngineError::Durability { ref id, .. } if *id == EventId::Seq(2)));
        assert_eq!(engine.phase(), EnginePhase::Halted);
        drop(engine);

        store.clear_failures();
        let mut engine = open(&store, &applier, FailurePolicy::Halt);
        assert!(!engine.processed().contains(&EventId::Seq(2)));
        engine.process_batch(events(&[1, 2, 3])).unwrap();

        // 2 ran before the failed checkpoint and again after restart.
        assert_eq!(applier.applied(), seqs(&[1, 2, 2, 3]));
    }

    #[test]
    fn crash_after_k_checkpoints_resumes_exactly() {
        for k in 0..=5u64 {
            let store = InMemoryCheckpointStore::new();
            let applier = RecordingApplier::new();
            let batch = events(&[5, 3, 1, 4, 2]);

            // Crash: the k+1-th checkpoint write never happens.
            store.fail_after(k);
            let mut engine = open(&store, &applier, FailurePolicy::Halt);
            let _ = engine.process_batch(batch.clone());
            drop(engine);

            let durable: Vec<_> = store.load().unwrap().ids().collect();
            assert_eq!(durable, seqs(&(1..=k).collect::<Vec<_>>()));

            store.clear_failures();
            let before = applier.applied().len();
            let mut engine = open(&store, &applier, FailurePolicy::Halt);
            let report = engine.process_batch(batch).unwrap();

            assert_eq!(report.applied as u64, 5 - k);
            assert_eq!(report.duplicates as u64, k);
            let resumed: Vec<_> = applier.applied()[before..].to_vec();
            assert_eq!(resumed, seqs(&((k + 1)..=5).collect::<Vec<_>>()));
        }
    }

    #[test]
    fn corrupt_checkpoint_refuses_to_open() {
        let store = InMemoryCheckpointStore::with_bytes(b"not a checkpoint".to_vec());
        let result = Engine::open(store, RecordingApplier::new(), FailurePolicy::Halt);

        assert!(matches!(
            result.err(),
            Some(EngineError::Checkpoint(CheckpointError::Corrupt { .. }))
        ));
    }

    #[test]
    fn restored_counts_checkpointed_ids() {
        let store = InMemoryCheckpointStore::new();
        let applier = RecordingApplier::new();

        let mut engine = open(&store, &applier, FailurePolicy::Halt);
        assert_eq!(engine.restored(), 0);
        engine.process_batch(events(&[1, 2])).unwrap();
        engine.process_batch(events(&[1, 2, 3])).unwrap();
        engine.terminate().unwrap();
        assert_eq!(engine.phase(), EnginePhase::Terminated);
        drop(engine);

        let engine = open(&store, &applier, FailurePolicy::Halt);
        assert_eq!(engine.restored(), 3);
    }

    proptest! {
        #[test]
        fn any_permutation_applies_ascending_once(
            ids in proptest::sample::subsequence((0u64..500).collect::<Vec<_>>(), 0..60)
                .prop_shuffle()
        ) {
            let store = InMemoryCheckpointStore::new();
            let applier = RecordingApplier::new();
            let mut engine = open(&store, &applier, FailurePolicy::Halt);

            engine.process_batch(events(&ids)).unwrap();
            engine.process_batch(events(&ids)).unwrap();

            let mut expected = ids.clone();
            expected.sort_unstable();
            prop_assert_eq!(applier.applied(), seqs(&expected));
        }
    }
}
