use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::TaskId;
use crate::error::StateStoreError;
use crate::store::{MemoryStore, TaskExecutionRecord, TaskStateStore};

const VERSION: u32 = 1;

#[derive(Serialize)]
struct StoreFileRef<'a> {
    version: u32,
    records: HashMap<&'a TaskId, &'a TaskExecutionRecord>,
}

#[derive(Deserialize)]
struct StoreFile {
    version: u32,
    records: HashMap<TaskId, TaskExecutionRecord>,
}

/// A store backed by a single CBOR file.
///
/// The file is read once in [`FileStore::open`]; records then live in
/// memory and are written back by [`TaskStateStore::flush`] through a
/// temporary sibling file renamed over the original.
#[derive(Debug)]
pub struct FileStore {
    path: Utf8PathBuf,
    inner: MemoryStore,
    dirty: AtomicBool,
}

impl FileStore {
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, StateStoreError> {
        let path = path.into();

        let records = match File::open(&path) {
            Ok(file) => {
                let file: StoreFile = ciborium::from_reader(BufReader::new(file))?;
                if file.version != VERSION {
                    return Err(StateStoreError::UnsupportedVersion(file.version));
                }
                file.records
                    .into_iter()
                    .map(|(id, record)| (id, Arc::new(record)))
                    .collect()
            }
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path, records = records.len(), "loaded task history");

        Ok(Self {
            path,
            inner: MemoryStore::from_records(records),
            dirty: AtomicBool::new(false),
        })
    }

    /// Like [`FileStore::open`], but an unreadable history is logged and
    /// replaced by an empty one. Every task then runs as if it had no history.
    pub fn open_or_reset(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        match Self::open(path.clone()) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(path = %path, "discarding task history: {e}");
                Self {
                    path,
                    inner: MemoryStore::new(),
                    dirty: AtomicBool::new(true),
                }
            }
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl TaskStateStore for FileStore {
    fn load(&self, id: &TaskId) -> Result<Option<Arc<TaskExecutionRecord>>, StateStoreError> {
        self.inner.load(id)
    }

    fn save(&self, id: &TaskId, record: TaskExecutionRecord) -> Result<(), StateStoreError> {
        self.inner.save(id, record)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn flush(&self) -> Result<(), StateStoreError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let snapshot = self.inner.snapshot()?;
        let contents = StoreFileRef {
            version: VERSION,
            records: snapshot.iter().map(|(id, record)| (id, &**record)).collect(),
        };

        let result = (|| -> Result<(), StateStoreError> {
            if let Some(dir) = self.path.parent()
                && !dir.as_str().is_empty()
            {
                fs::create_dir_all(dir)?;
            }

            let temp = self.path.with_extension("tmp");
            let mut writer = BufWriter::new(File::create(&temp)?);
            ciborium::into_writer(&contents, &mut writer)?;
            writer.flush()?;
            drop(writer);

            fs::rename(&temp, &self.path)?;
            Ok(())
        })();

        if result.is_err() {
            // Try again on the next flush.
            self.dirty.store(true, Ordering::Release);
        } else {
            tracing::debug!(path = %self.path, records = snapshot.len(), "flushed task history");
        }

        result
    }
}
