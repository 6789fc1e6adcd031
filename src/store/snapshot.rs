//! Durable snapshot file for the store.
//!
//! The whole store is written as one JSON document when the event log is
//! compacted, using the write-to-temp-then-rename pattern:
//! 1. Write to `<path>.tmp`
//! 2. fsync the temp file
//! 3. Rename to `<path>`
//! 4. fsync the parent directory
//!
//! Readers therefore see either the previous or the new snapshot, never a
//! partial write. Without the directory fsync the rename itself may not
//! survive a power loss.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use super::StoreError;
use super::state::{SCHEMA_VERSION, StoreState};

/// Writes `state` to `path` atomically.
pub fn save_atomic(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    let bytes = serde_json::to_vec(state)?;
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(tmp_path, path)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fsync_dir(parent)?;
    }

    Ok(())
}

/// Loads a snapshot, returning `None` if the file does not exist.
///
/// Malformed JSON and schema mismatches are errors.
pub fn try_load(path: &Path) -> Result<Option<StoreState>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let state: StoreState = serde_json::from_slice(&bytes)?;
    if state.schema_version != SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: state.schema_version,
        });
    }

    Ok(Some(state))
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
