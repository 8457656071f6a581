use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::document::{Document, WriteBatch, WriteOp};
use crate::error::{StoreError, StoreResult};
use crate::lock::{LockOwner, LockTable};
use crate::traits::DocumentStore;

/// Extension of every record file.
const RECORD_EXTENSION: &str = "json";

/// Directory-backed document store.
///
/// Each record is one pretty-printed JSON file named after the hex encoding
/// of its key. A batch is applied in two phases: every new record is first
/// written and synced to a temporary file in the same directory, and only
/// once all of them are on disk are they renamed over the old files and the
/// removed records deleted. A failure while staging leaves every record as
/// it was, and a reader never sees a half-written record. Locks are held in an in-process [`LockTable`]; the
/// directory must not be shared between processes that write concurrently.
pub struct FileDocumentStore {
    root: PathBuf,
    /// Readers take it shared, batches exclusive.
    gate: RwLock<()>,
    locks: LockTable,
}

impl FileDocumentStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: &Path) -> StoreResult<Self> {
        fs::create_dir_all(root)?;
        debug!(root = %root.display(), "opened file document store");
        Ok(Self {
            root: root.to_path_buf(),
            gate: RwLock::new(()),
            locks: LockTable::new(),
        })
    }

    /// The directory holding the record files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{RECORD_EXTENSION}", hex::encode(key.as_bytes())))
    }

    fn key_from_path(path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    fn read_record(&self, key: &str) -> StoreResult<Option<Document>> {
        let bytes = match fs::read(self.path_for(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(document)) => Ok(Some(document)),
            Ok(other) => Err(StoreError::CorruptRecord {
                key: key.to_string(),
                reason: format!("expected a JSON object, found {}", kind_of(&other)),
            }),
            Err(e) => Err(StoreError::CorruptRecord {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Prepare one write without touching the record's file.
    fn stage(&self, key: &str, op: &WriteOp) -> StoreResult<Staged> {
        let path = self.path_for(key);
        match fs::symlink_metadata(&path) {
            Ok(meta) if !meta.is_file() => {
                return Err(StoreError::CorruptRecord {
                    key: key.to_string(),
                    reason: format!("{} is not a regular file", path.display()),
                })
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match op {
            WriteOp::Put(document) => {
                let payload = serde_json::to_vec_pretty(document)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                let mut tmp = NamedTempFile::new_in(&self.root)?;
                tmp.write_all(&payload)?;
                tmp.as_file().sync_data()?;
                Ok(Staged::Put(tmp, path))
            }
            WriteOp::Remove => Ok(Staged::Remove(path)),
        }
    }
}

/// A write whose data is on disk but not yet visible.
enum Staged {
    Put(NamedTempFile, PathBuf),
    Remove(PathBuf),
}

impl Staged {
    fn publish(self) -> StoreResult<()> {
        match self {
            Staged::Put(tmp, path) => {
                tmp.persist(path).map_err(|e| e.error)?;
                Ok(())
            }
            Staged::Remove(path) => match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl DocumentStore for FileDocumentStore {
    fn get(&self, key: &str) -> StoreResult<Option<Document>> {
        let _shared = self.gate.read().expect("lock poisoned");
        self.read_record(key)
    }

    fn apply(&self, batch: &WriteBatch) -> StoreResult<()> {
        let _exclusive = self.gate.write().expect("lock poisoned");
        if let Some((key, holder)) = self.locks.conflicting(batch.owner(), batch.keys()) {
            return Err(StoreError::Locked { key, holder });
        }
        // Temporary files of a failed stage are deleted on drop.
        let staged = batch
            .iter()
            .map(|(key, op)| self.stage(key, op))
            .collect::<StoreResult<Vec<_>>>()?;
        for write in staged {
            write.publish()?;
        }
        debug!(ops = batch.len(), "applied batch");
        Ok(())
    }

    fn lock_documents(&self, owner: &LockOwner, keys: &[String]) -> StoreResult<bool> {
        Ok(self.locks.try_lock_all(owner, keys))
    }

    fn unlock_documents(&self, owner: &LockOwner, keys: &[String]) -> StoreResult<()> {
        self.locks.unlock_all(owner, keys);
        Ok(())
    }

    fn keys(&self) -> StoreResult<BTreeSet<String>> {
        let _shared = self.gate.read().expect("lock poisoned");
        let mut keys = BTreeSet::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if let Some(key) = Self::key_from_path(&path) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    fn contains(&self, key: &str) -> StoreResult<bool> {
        let _shared = self.gate.read().expect("lock poisoned");
        Ok(self.path_for(key).is_file())
    }
}

impl std::fmt::Debug for FileDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDocumentStore")
            .field("root", &self.root)
            .field("locked", &self.locks.len())
            .finish()
    }
}
