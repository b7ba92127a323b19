//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Background journal writer with snapshot compaction."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::event_log::{EventLogWriter, JournalRecord};
use crate::metrics::StoreMetrics;
use crate::{PersistenceError, Result};

enum Command {
    Append(JournalRecord),
    /// Replace the journal with the given snapshot of the live tables.
    Compact(Vec<JournalRecord>),
    Flush(SyncSender<Result<()>>),
}

/// Owns the journal file on a dedicated thread.
///
/// Callers only enqueue; file writes, flushes and compaction never run on the
/// caller's thread, so holding the store lock while enqueueing is cheap.
pub(crate) struct JournalWriter {
    path: PathBuf,
    sender: Mutex<Option<Sender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl JournalWriter {
    pub(crate) fn spawn(path: &Path, metrics: Arc<OnceLock<StoreMetrics>>) -> Result<Self> {
        let writer = EventLogWriter::open(path)?;
        let (sender, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("r-tms-journal".into())
            .spawn(move || run(writer, receiver, metrics))?;
        Ok(Self {
            path: path.to_path_buf(),
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn append(&self, record: JournalRecord) {
        self.send(Command::Append(record));
    }

    pub(crate) fn compact(&self, snapshot: Vec<JournalRecord>) {
        self.send(Command::Compact(snapshot));
    }

    /// Block until everything enqueued so far is on disk.
    pub(crate) fn flush(&self) -> Result<()> {
        let (ack, done) = mpsc::sync_channel(1);
        if !self.send(Command::Flush(ack)) {
            return Err(PersistenceError::Unavailable("journal writer stopped".into()));
        }
        done.recv()
            .map_err(|_| PersistenceError::Unavailable("journal writer stopped".into()))?
    }

    fn send(&self, command: Command) -> bool {
        let sender = self.sender.lock();
        match sender.as_ref().map(|tx| tx.send(command)) {
            Some(Ok(())) => true,
            _ => {
                warn!(journal = %self.path.display(), "journal writer is gone; entry dropped");
                false
            }
        }
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!(journal = %self.path.display(), "journal writer thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn run(mut writer: EventLogWriter, commands: Receiver<Command>, metrics: Arc<OnceLock<StoreMetrics>>) {
    for command in commands {
        match command {
            Command::Append(record) => match writer.append(record) {
                Ok((sequence, bytes)) => {
                    debug!(sequence, bytes, "journal entry appended");
                    if let Some(metrics) = metrics.get() {
                        metrics.record_journal_bytes(bytes);
                    }
                }
                Err(err) => {
                    warn!(journal = %writer.path().display(), error = %err, "journal append failed");
                    if let Some(metrics) = metrics.get() {
                        metrics.record_journal_failure();
                    }
                }
            },
            Command::Compact(snapshot) => {
                let entries = snapshot.len();
                match rewrite(writer.path(), snapshot) {
                    Ok(reopened) => {
                        info!(journal = %reopened.path().display(), entries, "journal compacted");
                        writer = reopened;
                    }
                    Err(err) => {
                        warn!(journal = %writer.path().display(), error = %err, "journal compaction failed");
                        if let Some(metrics) = metrics.get() {
                            metrics.record_journal_failure();
                        }
                    }
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(writer.flush());
            }
        }
    }
    if let Err(err) = writer.flush() {
        warn!(journal = %writer.path().display(), error = %err, "final journal flush failed");
    }
}

/// Write `snapshot` to a sibling file, swap it in and reopen for appending.
fn rewrite(path: &Path, snapshot: Vec<JournalRecord>) -> Result<EventLogWriter> {
    let staging = path.with_extension("compacting");
    if staging.exists() {
        fs::remove_file(&staging)?;
    }
    {
        let mut staged = EventLogWriter::open(&staging)?;
        for record in snapshot {
            staged.append(record)?;
        }
        staged.flush()?;
    }
    fs::rename(&staging, path)?;
    EventLogWriter::open(path)
}
