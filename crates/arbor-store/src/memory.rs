use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use crate::document::{Document, WriteBatch, WriteOp};
use crate::error::{StoreError, StoreResult};
use crate::lock::{LockOwner, LockTable};
use crate::traits::DocumentStore;

/// In-memory, HashMap-based document store.
///
/// Intended for tests and embedding. Documents live behind a `RwLock` and are
/// cloned on read and write.
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
    locks: LockTable,
}

impl InMemoryDocumentStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            locks: LockTable::new(),
        }
    }

    /// Number of documents currently stored.
    pub fn len(&self) -> usize {
        self.documents.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.read().expect("lock poisoned").is_empty()
    }

    /// Number of keys currently locked.
    pub fn locked_count(&self) -> usize {
        self.locks.len()
    }

    /// Remove all documents from the store.
    pub fn clear(&self) {
        self.documents.write().expect("lock poisoned").clear();
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn get(&self, key: &str) -> StoreResult<Option<Document>> {
        let map = self.documents.read().expect("lock poisoned");
        Ok(map.get(key).cloned())
    }

    fn apply(&self, batch: &WriteBatch) -> StoreResult<()> {
        let mut map = self.documents.write().expect("lock poisoned");
        if let Some((key, holder)) = self.locks.conflicting(batch.owner(), batch.keys()) {
            return Err(StoreError::Locked { key, holder });
        }
        for (key, op) in batch.iter() {
            match op {
                WriteOp::Put(document) => {
                    map.insert(key.clone(), document.clone());
                }
                WriteOp::Remove => {
                    map.remove(key);
                }
            }
        }
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
        let map = self.documents.read().expect("lock poisoned");
        Ok(map.keys().cloned().collect())
    }

    fn contains(&self, key: &str) -> StoreResult<bool> {
        let map = self.documents.read().expect("lock poisoned");
        Ok(map.contains_key(key))
    }
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore")
            .field("document_count", &self.len())
            .field("locked", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    // -----------------------------------------------------------------------
    // Reads and writes
    // -----------------------------------------------------------------------

    #[test]
    fn missing_key_is_none() {
        let store = InMemoryDocumentStore::new();
        assert!(store.get("nope").unwrap().is_none());
        assert!(!store.contains("nope").unwrap());
    }

    #[test]
    fn put_get_remove() {
        let store = InMemoryDocumentStore::new();
        store.put("a", doc(json!({"x": 1}))).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(doc(json!({"x": 1}))));
        assert_eq!(store.len(), 1);

        store.remove("a").unwrap();
        assert!(store.is_empty());
        // Removing again is a no-op.
        store.remove("a").unwrap();
    }

    #[test]
    fn batch_applies_every_op() {
        let store = InMemoryDocumentStore::new();
        store.put("old", Document::new()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put("a", doc(json!({"n": 1}))).unwrap();
        batch.put("b", doc(json!({"n": 2}))).unwrap();
        batch.remove("old").unwrap();
        store.apply(&batch).unwrap();

        let keys: Vec<String> = store.keys().unwrap().into_iter().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    #[test]
    fn locked_key_rejects_foreign_batch() {
        let store = InMemoryDocumentStore::new();
        let owner = LockOwner::new();
        assert!(store.lock_documents(&owner, &["a".to_string()]).unwrap());

        let mut foreign = WriteBatch::new();
        foreign.put("b", Document::new()).unwrap();
        foreign.put("a", Document::new()).unwrap();
        let err = store.apply(&foreign).unwrap_err();
        assert!(matches!(err, StoreError::Locked { ref key, .. } if key == "a"));
        // Nothing from the refused batch landed.
        assert!(store.is_empty());

        let mut owned = WriteBatch::owned_by(owner.clone());
        owned.put("a", Document::new()).unwrap();
        store.apply(&owned).unwrap();
        assert!(store.contains("a").unwrap());

        store.unlock_documents(&owner, &["a".to_string()]).unwrap();
        assert_eq!(store.locked_count(), 0);
        store.apply(&foreign).unwrap();
    }

    #[test]
    fn lock_contention_is_reported_not_raised() {
        let store = InMemoryDocumentStore::new();
        let first = LockOwner::new();
        let second = LockOwner::new();
        let keys = vec!["x".to_string(), "y".to_string()];
        assert!(store.lock_documents(&first, &keys).unwrap());
        assert!(!store.lock_documents(&second, &keys[1..]).unwrap());
    }
}
