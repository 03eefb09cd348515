//! Append-only commit journal beside the store snapshot.
//!
//! Each committed transaction appends one JSON line holding only the
//! collections it changed. The snapshot is rewritten at checkpoints, after
//! which the journal starts empty again.
//!
//! ## Recovery Policy
//!
//! - A final line that does not parse is a write torn by a crash and is
//!   discarded.
//! - Any earlier line that does not parse is corruption and fails the open.

use crate::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Journal entries written before the snapshot is rewritten.
pub(crate) const CHECKPOINT_INTERVAL: usize = 256;

pub(crate) struct Journal {
    path: PathBuf,
    entries: usize,
    needs_checkpoint: bool,
}

impl Journal {
    /// Opens the journal belonging to `snapshot`, without touching disk.
    pub(crate) fn for_snapshot(snapshot: &Path) -> Self {
        Self {
            path: snapshot.with_extension("journal"),
            entries: 0,
            needs_checkpoint: false,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every complete entry in order.
    pub(crate) fn read<T: DeserializeOwned>(&self) -> StoreResult<Vec<T>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
        let mut entries = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(err) if index + 1 == lines.len() => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "discarding torn journal tail"
                    );
                }
                Err(err) => {
                    return Err(StoreError::CorruptJournal {
                        line: index + 1,
                        message: err.to_string(),
                    })
                }
            }
        }
        Ok(entries)
    }

    /// True when the next commit should rewrite the snapshot instead.
    pub(crate) fn wants_checkpoint(&self) -> bool {
        self.needs_checkpoint || self.entries >= CHECKPOINT_INTERVAL
    }

    /// Appends one entry and flushes it to disk.
    pub(crate) fn append<T: Serialize>(&mut self, entry: &T) -> StoreResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                file.write_all(&line)?;
                file.sync_data()
            });
        if let Err(err) = written {
            // A partial line may be on disk; never append after it.
            self.needs_checkpoint = true;
            return Err(err.into());
        }
        self.entries += 1;
        Ok(())
    }

    /// Drops the journal after the snapshot has absorbed it.
    pub(crate) fn reset(&mut self) -> StoreResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.entries = 0;
        self.needs_checkpoint = false;
        Ok(())
    }
}
