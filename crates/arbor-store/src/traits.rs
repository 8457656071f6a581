use std::collections::BTreeSet;

use crate::document::{Document, WriteBatch};
use crate::error::StoreResult;
use crate::lock::LockOwner;

/// Keyed JSON document database with exclusive per-key locks.
///
/// All implementations must satisfy these invariants:
/// - Reads of an absent key return `Ok(None)`.
/// - `apply` is atomic with respect to other readers of the same store: a
///   reader observes either none or all of a batch.
/// - `apply` refuses the whole batch if any key is locked by an owner other
///   than the batch's owner.
/// - `lock_documents` acquires every key or none of them.
/// - The store never interprets document contents.
/// - All I/O errors are propagated, never silently ignored.
pub trait DocumentStore: Send + Sync {
    /// Read the document stored under `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    fn get(&self, key: &str) -> StoreResult<Option<Document>>;

    /// Apply every put and remove in `batch`.
    fn apply(&self, batch: &WriteBatch) -> StoreResult<()>;

    /// Try to lock all `keys` for `owner`.
    ///
    /// Returns `Ok(true)` iff every key is now held by `owner`. On `Ok(false)`
    /// no additional key is held. Keys need not exist.
    fn lock_documents(&self, owner: &LockOwner, keys: &[String]) -> StoreResult<bool>;

    /// Release locks held by `owner` on `keys`.
    fn unlock_documents(&self, owner: &LockOwner, keys: &[String]) -> StoreResult<()>;

    /// Every key currently stored, sorted.
    fn keys(&self) -> StoreResult<BTreeSet<String>>;

    /// Whether a document exists under `key`.
    fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Store one document outside of any lock.
    fn put(&self, key: &str, document: Document) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, document)?;
        self.apply(&batch)
    }

    /// Remove one document outside of any lock.
    fn remove(&self, key: &str) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.remove(key)?;
        self.apply(&batch)
    }
}
