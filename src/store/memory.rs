//! In-memory record store.

use crate::store::{ClassifiedRecord, NewRecord, RecordQuery, RecordStore, StoreError};
use chrono::Utc;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    records: Vec<ClassifiedRecord>,
    next_id: u64,
}

/// Record store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

impl RecordStore for MemoryStore {
    fn append(&self, record: NewRecord) -> Result<ClassifiedRecord, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.next_id += 1;
        let stored = record.into_record(inner.next_id, Utc::now());
        inner.records.push(stored.clone());
        Ok(stored)
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<ClassifiedRecord>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(query.apply(inner.records.iter()))
    }

    fn get(&self, id: u64) -> Result<ClassifiedRecord, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        inner
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let before = inner.records.len();
        inner.records.retain(|r| r.id != id);
        if inner.records.len() == before {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().map_err(poisoned)?.records.len())
    }
}
