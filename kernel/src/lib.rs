// Keel Kernel
//
// Exactly-once application of events from a re-scannable log, with
// crash-safe checkpoints and no external database.

pub mod adapters;
pub mod apply;
pub mod checkpoint;
pub mod config;
pub mod log;
pub mod replay;
pub mod run;
pub mod state;
