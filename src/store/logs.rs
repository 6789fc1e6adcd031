//! Build log text, kept outside the snapshot.
//!
//! Logs are append-heavy and only read when a single build is fetched, so each
//! build gets its own `<id>.log` file. Lines are not fsynced.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::types::BuildId;

#[derive(Debug)]
pub enum BuildLogs {
    Memory(Mutex<HashMap<BuildId, String>>),
    Files(PathBuf),
}

impl BuildLogs {
    pub fn in_memory() -> Self {
        BuildLogs::Memory(Mutex::new(HashMap::new()))
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(BuildLogs::Files(dir))
    }

    pub fn append(&self, id: BuildId, line: &str) -> io::Result<()> {
        match self {
            BuildLogs::Memory(logs) => {
                let mut logs = logs.lock().unwrap_or_else(PoisonError::into_inner);
                let log = logs.entry(id).or_default();
                log.push_str(line);
                log.push('\n');
                Ok(())
            }
            BuildLogs::Files(dir) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("{}.log", id.0)))?;
                file.write_all(format!("{}\n", line).as_bytes())
            }
        }
    }

    /// The whole log, lines joined by `\n`. A build with no log reads empty.
    pub fn read(&self, id: BuildId) -> io::Result<String> {
        let mut text = match self {
            BuildLogs::Memory(logs) => logs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&id)
                .cloned()
                .unwrap_or_default(),
            BuildLogs::Files(dir) => match std::fs::read_to_string(dir.join(format!("{}.log", id.0))) {
                Ok(text) => text,
                Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e),
            },
        };
        if text.ends_with('\n') {
            text.pop();
        }
        Ok(text)
    }
}
