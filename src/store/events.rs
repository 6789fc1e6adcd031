//! Append-only event log between snapshots.
//!
//! Each committed store transaction appends its events as JSON Lines and
//! fsyncs once. A line is `{"seq":N,"ts":...,"type":"build_put",...}` with
//! the entity flattened in. Every event carries the whole entity after the
//! change, so replaying an event twice is harmless.
//!
//! # Recovery
//!
//! 1. Load the snapshot, which records the last sequence number it contains.
//! 2. Replay events with a higher sequence number.
//! 3. A final line that does not parse (crash mid-write) is truncated away.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::types::{Build, RefState, Repository};

/// A change to one entity, carrying the entity as it is after the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    RepositoryPut(Repository),
    BuildPut(Build),
    RefStatePut(RefState),
}

/// One line of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: StoreEvent,
}

/// The events file. It is reopened for every append, so a file that was
/// moved or replaced underneath the process is noticed on the next write.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        EventLog { path: path.into() }
    }

    /// Appends `records` and fsyncs. On failure the file is cut back to its
    /// previous length, so no record of a failed append survives a restart.
    pub fn append(&self, records: &[EventRecord]) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let before = file.metadata()?.len();

        let written = file.write_all(&buf).and_then(|()| file.sync_all());
        if let Err(e) = written {
            if let Err(cut) = file.set_len(before) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %cut,
                    "Could not cut back event log after failed append"
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Empties the log after its events were folded into a snapshot.
    pub fn truncate(&self) -> io::Result<()> {
        match OpenOptions::new().write(true).open(&self.path) {
            Ok(file) => {
                file.set_len(0)?;
                file.sync_all()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reads the records with `seq > after`, in order.
    ///
    /// A line that does not parse, or whose sequence number does not increase,
    /// ends the valid prefix; the file is truncated there.
    pub fn replay(&self, after: u64) -> Result<Vec<EventRecord>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut records = Vec::new();
        let mut valid_len = 0u64;
        let mut last_seq: Option<u64> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                valid_len += read as u64;
                continue;
            }

            let Ok(record) = serde_json::from_str::<EventRecord>(trimmed) else {
                break;
            };
            if last_seq.is_some_and(|prev| record.seq <= prev) {
                break;
            }
            last_seq = Some(record.seq);
            valid_len += read as u64;
            if record.seq > after {
                records.push(record);
            }
        }

        if valid_len < file_len {
            tracing::warn!(
                path = %self.path.display(),
                kept = valid_len,
                dropped = file_len - valid_len,
                "Truncating torn tail of event log"
            );
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(records)
    }
}
