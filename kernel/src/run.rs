// Runs
//
// Drives the full pipeline: poll the source, hand the validated events
// to the engine, repeat in continuous mode.
//
// source → validate → engine (tracker + checkpoint) → applier

use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::apply::Applier;
use crate::checkpoint::CheckpointStore;
use crate::config::{RunConfig, RunMode};
use crate::log::{EventSource, SourceError};
use crate::replay::{BatchReport, Engine, EngineError};

/// Summary of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub polls: u64,
    pub received: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub rejected: usize,
    /// Ids already in the checkpoint when the engine opened.
    pub restored: usize,
    pub processed_total: usize,
}

impl RunReport {
    fn new(mode: RunMode, restored: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            polls: 0,
            received: 0,
            applied: 0,
            duplicates: 0,
            failed: 0,
            rejected: 0,
            restored,
            processed_total: 0,
        }
    }

    fn absorb(&mut self, batch: &BatchReport, rejected: usize) {
        self.polls += 1;
        self.received += batch.received;
        self.applied += batch.applied;
        self.duplicates += batch.duplicates;
        self.failed += batch.failed;
        self.rejected += rejected;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("event source failed: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Process everything currently in the source once, then terminate.
pub fn run_bounded<E, S, A>(source: &mut E, engine: &mut Engine<S, A>) -> Result<RunReport, RunError>
where
    E: EventSource,
    S: CheckpointStore,
    A: Applier,
{
    let mut report = RunReport::new(RunMode::Bounded, engine.restored());
    let span = info_span!("run", run_id = %report.run_id, mode = "bounded");
    let _enter = span.enter();

    poll_once(source, engine, &mut report)?;
    engine.terminate()?;

    report.processed_total = engine.processed().len();
    info!(applied = report.applied, processed_total = report.processed_total, "run finished");
    Ok(report)
}

/// Re-poll the source every `poll_interval` until `max_polls` polls have
/// run. With no limit this only returns on error.
pub fn run_continuous<E, S, A>(
    source: &mut E,
    engine: &mut Engine<S, A>,
    poll_interval: Duration,
    max_polls: Option<u64>,
) -> Result<RunReport, RunError>
where
    E: EventSource,
    S: CheckpointStore,
    A: Applier,
{
    let mut report = RunReport::new(RunMode::Continuous, engine.restored());
    let span = info_span!("run", run_id = %report.run_id, mode = "continuous");
    let _enter = span.enter();

    loop {
        poll_once(source, engine, &mut report)?;

        if max_polls.map_or(false, |limit| report.polls >= limit) {
            break;
        }
        thread::sleep(poll_interval);
    }

    engine.terminate()?;
    report.processed_total = engine.processed().len();
    info!(polls = report.polls, applied = report.applied, "run finished");
    Ok(report)
}

/// Run in the mode `config` asks for.
pub fn run<E, S, A>(
    source: &mut E,
    engine: &mut Engine<S, A>,
    config: &RunConfig,
) -> Result<RunReport, RunError>
where
    E: EventSource,
    S: CheckpointStore,
    A: Applier,
{
    match config.mode {
        RunMode::Bounded => run_bounded(source, engine),
        RunMode::Continuous => {
            run_continuous(source, engine, config.poll_interval(), config.max_polls)
        }
    }
}

fn poll_once<E, S, A>(
    source: &mut E,
    engine: &mut Engine<S, A>,
    report: &mut RunReport,
) -> Result<(), RunError>
where
    E: EventSource,
    S: CheckpointStore,
    A: Applier,
{
    let batch = source.poll()?;
    if !batch.rejected.is_empty() {
        warn!(rejected = batch.rejected.len(), "dropped invalid event records");
    }

    let rejected = batch.rejected.len();
    let batch_report = engine.process_batch(batch.events)?;
    report.absorb(&batch_report, rejected);
    Ok(())
}
