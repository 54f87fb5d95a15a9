// File-Backed Checkpoint Store
//
// Persists the checkpoint as a single JSON file. Every save writes a
// temp file next to the checkpoint, fsyncs it, renames it over the old
// file and fsyncs the directory. A crash at any point leaves either the
// old or the new checkpoint in place.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Checkpoint, CheckpointError, CheckpointStore, DurabilityError};

/// Upper bound on how long a save may block before it is reported as failed.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const TEMP_PREFIX: &str = ".keel-checkpoint";

/// Who decided the outcome of one save: the writer by committing, or the
/// caller by giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Pending,
    Committed,
    Abandoned,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy)]
enum WriterFault {
    Stall(Duration),
    Panic,
}

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
    write_timeout: Duration,
    #[cfg(test)]
    fault: Option<WriterFault>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            #[cfg(test)]
            fault: None,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    fn with_fault(mut self, fault: WriterFault) -> Self {
        self.fault = Some(fault);
        self
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Checkpoint, CheckpointError> {
        let location = self.path.display().to_string();

        match fs::read(&self.path) {
            Ok(bytes) => {
                let checkpoint = Checkpoint::decode(&bytes, &location)?;
                debug!(path = %location, applied = checkpoint.applied, "read checkpoint");
                Ok(checkpoint)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %location, "no checkpoint found, starting from an empty one");
                Ok(Checkpoint::empty())
            }
            Err(source) => Err(CheckpointError::Read { location, source }),
        }
    }

    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), DurabilityError> {
        let bytes = checkpoint.encode()?;
        let path = self.path.clone();
        let state = Arc::new(Mutex::new(WriteState::Pending));
        let writer_state = Arc::clone(&state);
        #[cfg(test)]
        let fault = self.fault;
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("keel-checkpoint-writer".into())
            .spawn(move || {
                #[cfg(test)]
                match fault {
                    Some(WriterFault::Stall(delay)) => thread::sleep(delay),
                    Some(WriterFault::Panic) => panic!("checkpoint writer crashed"),
                    None => {}
                }
                let _ = tx.send(write_atomic(&path, &bytes, &writer_state));
            })?;

        match rx.recv_timeout(self.write_timeout) {
            Ok(result) => result.map_err(DurabilityError::Io),
            Err(RecvTimeoutError::Timeout) => {
                let mut state = state.lock();
                if *state == WriteState::Pending {
                    // The writer sees this before renaming and discards its temp file.
                    *state = WriteState::Abandoned;
                    warn!(path = %self.path.display(), timeout = ?self.write_timeout, "checkpoint write timed out");
                    return Err(DurabilityError::Timeout(self.write_timeout));
                }
                drop(state);

                // The rename already happened; report what it did.
                match rx.recv() {
                    Ok(result) => result.map_err(DurabilityError::Io),
                    Err(_) => Err(DurabilityError::WriterLost),
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(DurabilityError::WriterLost),
        }
    }
}

/// Write `bytes` to a temp file and rename it over `path`, unless the
/// caller has abandoned the save by then.
///
/// The state lock is held across the rename and directory sync, so once a
/// caller observes `Pending` and abandons, no rename can follow.
fn write_atomic(path: &Path, bytes: &[u8], state: &Mutex<WriteState>) -> io::Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    let mut state = state.lock();
    if *state == WriteState::Abandoned {
        // Dropping the temp file removes it.
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "checkpoint write abandoned by caller",
        ));
    }
    *state = WriteState::Committed;
    temp.persist(path).map_err(|e| e.error)?;

    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
