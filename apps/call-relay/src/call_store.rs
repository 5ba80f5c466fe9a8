use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::types::CallRecord;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("call {0} already exists")]
    DuplicateCall(String),
}

/// In-memory call records keyed by provider call id.
///
/// Only the reconciliation engine holds a handle to this store. Every mutation
/// runs inside the map lock, so a closure passed to [`CallRecordStore::mutate`]
/// observes and updates a record atomically with respect to other channels.
#[derive(Default)]
pub struct CallRecordStore {
    records: Mutex<HashMap<String, CallRecord>>,
}

impl CallRecordStore {
    pub async fn create(&self, record: CallRecord) -> Result<CallRecord, StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::DuplicateCall(record.id));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Option<CallRecord> {
        self.records.lock().await.get(id).cloned()
    }

    pub async fn mutate<T, F>(&self, id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut CallRecord) -> T,
    {
        let mut records = self.records.lock().await;
        records.get_mut(id).map(f)
    }

    pub async fn evict(&self, id: &str) -> Option<CallRecord> {
        self.records.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}
