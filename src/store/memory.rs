use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::TaskId;
use crate::error::StateStoreError;
use crate::store::{TaskExecutionRecord, TaskStateStore};

/// Keeps records for the lifetime of the process only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<TaskId, Arc<TaskExecutionRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_records(records: HashMap<TaskId, Arc<TaskExecutionRecord>>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub(crate) fn snapshot(&self) -> Result<HashMap<TaskId, Arc<TaskExecutionRecord>>, StateStoreError> {
        let records = self.records.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(records.clone())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskStateStore for MemoryStore {
    fn load(&self, id: &TaskId) -> Result<Option<Arc<TaskExecutionRecord>>, StateStoreError> {
        let records = self.records.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(records.get(id).cloned())
    }

    fn save(&self, id: &TaskId, record: TaskExecutionRecord) -> Result<(), StateStoreError> {
        // Build the record before taking the lock; the critical section is
        // only the pointer swap.
        let record = Arc::new(record);
        let mut records = self.records.write().map_err(|_| StateStoreError::Poisoned)?;
        records.insert(id.clone(), record);
        Ok(())
    }

    fn flush(&self) -> Result<(), StateStoreError> {
        Ok(())
    }
}
