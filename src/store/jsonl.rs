//! Append-only JSON-lines record store.
//!
//! Each record is one line of JSON. The file is read once on open and kept
//! indexed in memory; appends go to the end of the file, deletes rewrite it.
//!
//! A rewrite that drops the newest record leaves a `{"last_id": N}` line at
//! the top of the file so ids are never handed out twice.

use crate::store::{ClassifiedRecord, NewRecord, RecordQuery, RecordStore, StoreError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Highest id ever issued, kept when that record is gone.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct HighWater {
    last_id: u64,
}

#[derive(Debug)]
struct Inner {
    records: Vec<ClassifiedRecord>,
    next_id: u64,
}

/// Record store backed by a `.jsonl` file.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JsonlStore {
    /// Open (or create) the store at `path`.
    ///
    /// Lines that fail to parse are skipped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut records = Vec::new();
        let mut last_id = 0;
        if path.exists() {
            let file = File::open(&path)?;
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ClassifiedRecord>(&line) {
                    Ok(record) => records.push(record),
                    Err(e) => match serde_json::from_str::<HighWater>(&line) {
                        Ok(mark) => last_id = last_id.max(mark.last_id),
                        Err(_) => tracing::warn!(
                            "Skipping unreadable record at {}:{}: {}",
                            path.display(),
                            lineno + 1,
                            e
                        ),
                    },
                }
            }
            terminate_last_line(&path)?;
        }

        let next_id = records.iter().map(|r| r.id).fold(last_id, u64::max);
        tracing::info!(
            "Opened record store {} ({} records)",
            path.display(),
            records.len()
        );

        Ok(Self {
            path,
            inner: Mutex::new(Inner { records, next_id }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("jsonl store lock poisoned".to_string()))
    }

    fn rewrite(&self, records: &[ClassifiedRecord], last_id: u64) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            if records.iter().all(|r| r.id < last_id) && last_id > 0 {
                let mark = serde_json::to_string(&HighWater { last_id })
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                writeln!(file, "{mark}")?;
            }
            for record in records {
                let line = serde_json::to_string(record)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                writeln!(file, "{line}")?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RecordStore for JsonlStore {
    fn append(&self, record: NewRecord) -> Result<ClassifiedRecord, StoreError> {
        let mut inner = self.lock()?;
        let stored = record.into_record(inner.next_id + 1, Utc::now());
        let mut line =
            serde_json::to_string(&stored).map_err(|e| StoreError::Serialization(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let start = file.metadata()?.len();
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            // Never leave a fragment for the next append to land on.
            if let Err(trunc) = file.set_len(start) {
                tracing::error!(
                    "Could not remove partial record from {}: {}",
                    self.path.display(),
                    trunc
                );
            }
            return Err(e.into());
        }

        inner.next_id = stored.id;
        inner.records.push(stored.clone());
        Ok(stored)
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<ClassifiedRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(query.apply(inner.records.iter()))
    }

    fn get(&self, id: u64) -> Result<ClassifiedRecord, StoreError> {
        let inner = self.lock()?;
        inner
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let position = inner
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;

        let mut remaining = inner.records.clone();
        remaining.remove(position);
        self.rewrite(&remaining, inner.next_id)?;
        inner.records = remaining;
        Ok(())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.records.len())
    }
}

/// Append a newline if the file ends mid-line, so the next record starts on
/// a line of its own.
fn terminate_last_line(path: &Path) -> Result<(), StoreError> {
    let mut file = OpenOptions::new().read(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        tracing::warn!("Terminating partial last line in {}", path.display());
        file.write_all(b"\n")?;
        file.flush()?;
    }
    Ok(())
}
