//! Task history persisted across invocations.
//!
//! A store is loaded when it is opened, read and written while the engine
//! runs, and flushed once at the end of every run. Records are replaced
//! whole: a reader holds an `Arc` to a complete record and never sees a
//! half-written one.

mod file;
mod memory;

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::core::{BuildId, TaskId};
use crate::error::StateStoreError;
use crate::fingerprint::Fingerprint;

pub use file::FileStore;
pub use memory::MemoryStore;

/// The last outcome recorded for a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordedOutcome {
    Executed,
    UpToDate,
    Failed,
    Skipped,
}

/// What the store remembers about one task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    /// Input fingerprint captured before the last execution.
    pub input: Fingerprint,
    /// Output fingerprint captured after the last execution.
    pub output: Fingerprint,
    pub outcome: RecordedOutcome,
    pub build_id: BuildId,
    pub timestamp: SystemTime,
}

impl TaskExecutionRecord {
    pub fn new(
        input: Fingerprint,
        output: Fingerprint,
        outcome: RecordedOutcome,
        build_id: BuildId,
    ) -> Self {
        Self {
            input,
            output,
            outcome,
            build_id,
            timestamp: SystemTime::now(),
        }
    }
}

/// Storage for [`TaskExecutionRecord`]s keyed by task identity.
///
/// Implementations must accept concurrent `save` calls for different
/// identities from several worker threads.
pub trait TaskStateStore: Send + Sync {
    fn load(&self, id: &TaskId) -> Result<Option<Arc<TaskExecutionRecord>>, StateStoreError>;

    /// Atomically replaces the record for `id`.
    fn save(&self, id: &TaskId, record: TaskExecutionRecord) -> Result<(), StateStoreError>;

    /// Makes every saved record durable. Called once at the end of a run.
    fn flush(&self) -> Result<(), StateStoreError>;
}

impl<T> TaskStateStore for Arc<T>
where
    T: TaskStateStore + ?Sized,
{
    fn load(&self, id: &TaskId) -> Result<Option<Arc<TaskExecutionRecord>>, StateStoreError> {
        (**self).load(id)
    }

    fn save(&self, id: &TaskId, record: TaskExecutionRecord) -> Result<(), StateStoreError> {
        (**self).save(id, record)
    }

    fn flush(&self) -> Result<(), StateStoreError> {
        (**self).flush()
    }
}
