//! Persistence of classified records.
//!
//! The record store itself is an external collaborator; this module defines
//! the seam ([`RecordStore`]) and ships two implementations:
//! - [`MemoryStore`] for tests and ephemeral runs
//! - [`JsonlStore`], an append-only JSON-lines file
//!
//! Store calls are synchronous and may block, so the ingest path never calls
//! them directly. [`PersistenceSink`] moves each call onto the blocking pool
//! and bounds it with a timeout.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A sample enriched with its stress classification, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedRecord {
    /// Identifier assigned by the store
    pub id: u64,
    /// When the sample was taken (UTC)
    pub timestamp: DateTime<Utc>,
    /// Heart rate (bpm)
    pub hr: f64,
    /// Skin temperature (°C)
    pub temp: f64,
    /// Electrodermal activity
    pub eda: f64,
    /// Stress label from the model
    pub label: String,
    /// Model confidence in [0, 1]
    pub confidence: f64,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// When the record was stored
    pub created_at: DateTime<Utc>,
}

/// A record that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub timestamp: DateTime<Utc>,
    pub hr: f64,
    pub temp: f64,
    pub eda: f64,
    pub label: String,
    pub confidence: f64,
    pub device_id: String,
    pub notes: Option<String>,
}

impl NewRecord {
    /// Attach the store-assigned id and creation time.
    pub fn into_record(self, id: u64, created_at: DateTime<Utc>) -> ClassifiedRecord {
        ClassifiedRecord {
            id,
            timestamp: self.timestamp,
            hr: self.hr,
            temp: self.temp,
            eda: self.eda,
            label: self.label,
            confidence: self.confidence,
            device_id: self.device_id,
            notes: self.notes,
            created_at,
        }
    }
}

/// Bounded, time-filtered selection of records.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub limit: usize,
    /// Inclusive lower bound on `timestamp`
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `timestamp`
    pub end: Option<DateTime<Utc>>,
}

impl RecordQuery {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            start: None,
            end: None,
        }
    }

    pub fn matches(&self, record: &ClassifiedRecord) -> bool {
        self.start.map_or(true, |start| record.timestamp >= start)
            && self.end.map_or(true, |end| record.timestamp <= end)
    }

    /// Filter, order newest first and truncate.
    pub fn apply<'a>(
        &self,
        records: impl Iterator<Item = &'a ClassifiedRecord>,
    ) -> Vec<ClassifiedRecord> {
        let mut selected: Vec<ClassifiedRecord> =
            records.filter(|r| self.matches(r)).cloned().collect();
        selected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        selected.truncate(self.limit);
        selected
    }
}

/// Record store errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Underlying I/O failed
    Io(String),
    /// Stored data could not be encoded or decoded
    Serialization(String),
    /// No record with this id
    NotFound(u64),
    /// The call did not finish in time
    Timeout(Duration),
    /// The store cannot serve requests
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Store I/O error: {e}"),
            StoreError::Serialization(e) => write!(f, "Store serialization error: {e}"),
            StoreError::NotFound(id) => write!(f, "Record {id} not found"),
            StoreError::Timeout(d) => write!(f, "Store call timed out after {}ms", d.as_millis()),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Durable store for classified records.
pub trait RecordStore: Send + Sync {
    /// Persist a record and return it with its assigned id.
    fn append(&self, record: NewRecord) -> Result<ClassifiedRecord, StoreError>;

    /// Records matching `query`, newest first.
    fn query(&self, query: &RecordQuery) -> Result<Vec<ClassifiedRecord>, StoreError>;

    fn get(&self, id: u64) -> Result<ClassifiedRecord, StoreError>;

    fn delete(&self, id: u64) -> Result<(), StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Jsonl,
}

impl std::str::FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "jsonl" => Ok(StoreKind::Jsonl),
            other => Err(format!("unknown store '{other}' (expected memory or jsonl)")),
        }
    }
}

/// Open the store selected by the configuration.
pub fn open_store(config: &crate::config::Config) -> Result<Arc<dyn RecordStore>, StoreError> {
    match config.store {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::Jsonl => Ok(Arc::new(JsonlStore::open(config.records_path())?)),
    }
}

/// Async front of a [`RecordStore`] used by the ingest and history paths.
#[derive(Clone)]
pub struct PersistenceSink {
    store: Arc<dyn RecordStore>,
    timeout: Duration,
}

impl PersistenceSink {
    pub fn new(store: Arc<dyn RecordStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Append a record, bounded by the sink timeout.
    ///
    /// A timed-out append keeps running on the blocking pool. If it later
    /// succeeds the record is deleted again, so a record the caller saw fail
    /// never stays in the store.
    pub async fn append(&self, record: NewRecord) -> Result<ClassifiedRecord, StoreError> {
        let store = Arc::clone(&self.store);
        let mut handle = tokio::task::spawn_blocking(move || store.append(record));

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Unavailable(format!(
                "store call aborted: {join_err}"
            ))),
            Err(_) => {
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    if let Ok(Ok(late)) = handle.await {
                        let id = late.id;
                        let removed =
                            tokio::task::spawn_blocking(move || store.delete(id)).await;
                        match removed {
                            Ok(Ok(())) => tracing::error!(
                                "Store append for record {} finished after timeout; record removed",
                                id
                            ),
                            Ok(Err(e)) => tracing::error!(
                                "Store append for record {} finished after timeout and could not be removed: {}",
                                id,
                                e
                            ),
                            Err(e) => tracing::error!(
                                "Removing late record {} aborted: {}",
                                id,
                                e
                            ),
                        }
                    }
                });
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    pub async fn query(&self, query: RecordQuery) -> Result<Vec<ClassifiedRecord>, StoreError> {
        let store = Arc::clone(&self.store);
        self.run(move || store.query(&query)).await
    }

    async fn run<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(call)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Unavailable(format!(
                "store call aborted: {join_err}"
            ))),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}
