//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry record storage and journaling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::{
    AnomalyRecord, MessageRecord, ScheduleEntry, ServiceLogRecord, StatusRecord,
};
use crate::{PersistenceError, Result};

/// Journal format version written into the header line.
pub const JOURNAL_VERSION: u16 = 1;

/// First line of every journal file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventLogHeader {
    version: u16,
    created_at: DateTime<Utc>,
}

impl EventLogHeader {
    fn new() -> Self {
        Self {
            version: JOURNAL_VERSION,
            created_at: Utc::now(),
        }
    }
}

/// Store mutation captured in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    /// Valid reading appended.
    Message(MessageRecord),
    /// Anomaly appended.
    Anomaly(AnomalyRecord),
    /// Status snapshot appended.
    Status(StatusRecord),
    /// Service log row appended.
    ServiceLog(ServiceLogRecord),
    /// Schedule created.
    Schedule(ScheduleEntry),
    /// Schedule start moved after firing.
    ScheduleStart {
        /// Schedule identifier.
        id: u64,
        /// New window start.
        start_ts: DateTime<Utc>,
    },
    /// Identifier high-water marks, written first by compaction.
    Counters {
        /// Last message identifier handed out.
        next_message_id: u64,
        /// Last schedule identifier handed out.
        next_schedule_id: u64,
    },
    /// Retention purge executed.
    Purge {
        /// Rows older than this were removed.
        cutoff: DateTime<Utc>,
    },
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// Timestamp when the entry was written.
    pub timestamp: DateTime<Utc>,
    /// The mutation.
    pub record: JournalRecord,
}

impl EventLogEntry {
    /// Construct an entry for the provided mutation.
    pub fn new(record: JournalRecord) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            record,
        }
    }
}

/// Append-only JSON-lines journal writer.
pub struct EventLogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl EventLogWriter {
    /// Open a journal for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let next_sequence = if fresh {
            0
        } else {
            determine_next_sequence(path)?
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        if fresh {
            let line = serde_json::to_string(&EventLogHeader::new())?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            next_sequence,
        })
    }

    /// Append a record and return the assigned sequence number and byte count.
    pub fn append(&mut self, record: JournalRecord) -> Result<(u64, usize)> {
        self.next_sequence += 1;
        let mut entry = EventLogEntry::new(record);
        entry.sequence = self.next_sequence;
        let line = serde_json::to_string(&entry)?;
        let bytes = line.len() + 1;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok((entry.sequence, bytes))
    }

    /// Flush buffered writes to the underlying file handle.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Location of the journal on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for EventLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogWriter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn read_header(reader: &mut BufReader<File>) -> Result<()> {
    let mut first_line = String::new();
    reader.read_line(&mut first_line)?;
    if first_line.trim().is_empty() {
        return Ok(());
    }
    let header: EventLogHeader = serde_json::from_str(first_line.trim())?;
    if header.version != JOURNAL_VERSION {
        return Err(PersistenceError::UnsupportedVersion(header.version));
    }
    Ok(())
}

fn determine_next_sequence(path: &Path) -> Result<u64> {
    let mut last_seq = 0u64;
    for entry in EventLogReader::open(path)? {
        match entry {
            Ok(entry) => last_seq = entry.sequence,
            // torn line
            Err(PersistenceError::Json(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(last_seq)
}

/// Replay the journal in order, invoking the callback for each entry.
pub fn replay<F>(path: &Path, mut handler: F) -> Result<usize>
where
    F: FnMut(EventLogEntry) -> Result<()>,
{
    let mut count = 0usize;
    for entry in EventLogReader::open(path)? {
        handler(entry?)?;
        count += 1;
    }
    Ok(count)
}

/// Streaming iterator over journal entries.
pub struct EventLogReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl EventLogReader {
    /// Open the journal for sequential reading, validating its header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        read_header(&mut reader)?;
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for EventLogReader {
    type Item = Result<EventLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    return Some(serde_json::from_str(&line).map_err(PersistenceError::from))
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}
