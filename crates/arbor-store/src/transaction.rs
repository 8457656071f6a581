use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::document::{Document, WriteBatch};
use crate::error::StoreResult;
use crate::lock::LockOwner;
use crate::traits::DocumentStore;

/// One buffered record state inside a transaction.
#[derive(Clone, Debug)]
enum Buffered {
    Put(Document),
    Removed,
}

/// Begin/commit/rollback scope over a [`DocumentStore`].
///
/// Reads go through the transaction's buffer first (read-your-writes); all
/// writes stay in memory until [`commit`](Self::commit), which applies them
/// as one [`WriteBatch`] owned by this transaction's [`LockOwner`] and then
/// releases every lock taken through [`lock`](Self::lock). Rolling back, or
/// dropping the transaction without committing, discards the buffer and
/// releases the locks, leaving the store untouched.
pub struct StoreTransaction<'a> {
    store: &'a dyn DocumentStore,
    owner: LockOwner,
    locked: BTreeSet<String>,
    buffer: BTreeMap<String, Buffered>,
    finished: bool,
}

impl<'a> StoreTransaction<'a> {
    pub fn begin(store: &'a dyn DocumentStore) -> Self {
        let owner = LockOwner::new();
        debug!(owner = %owner.short_id(), "transaction begun");
        Self {
            store,
            owner,
            locked: BTreeSet::new(),
            buffer: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// The store this transaction reads from and writes to.
    pub fn store(&self) -> &'a dyn DocumentStore {
        self.store
    }

    /// Try to lock `keys` in one all-or-nothing call.
    pub fn lock(&mut self, keys: &[String]) -> StoreResult<bool> {
        let acquired = self.store.lock_documents(&self.owner, keys)?;
        if acquired {
            self.locked.extend(keys.iter().cloned());
        }
        Ok(acquired)
    }

    /// Keys locked so far.
    pub fn locked_keys(&self) -> impl Iterator<Item = &String> {
        self.locked.iter()
    }

    /// Read a record, preferring this transaction's buffered state.
    pub fn get(&self, key: &str) -> StoreResult<Option<Document>> {
        match self.buffer.get(key) {
            Some(Buffered::Put(document)) => Ok(Some(document.clone())),
            Some(Buffered::Removed) => Ok(None),
            None => self.store.get(key),
        }
    }

    /// Mutable handle on a record's buffered copy.
    ///
    /// The record is pulled into the buffer on first edit. When it does not
    /// exist, an empty document is created if `create_if_missing` is set;
    /// otherwise `Ok(None)` is returned.
    pub fn edit(&mut self, key: &str, create_if_missing: bool) -> StoreResult<Option<&mut Document>> {
        let present = match self.buffer.get(key) {
            Some(Buffered::Put(_)) => true,
            Some(Buffered::Removed) => false,
            None => match self.store.get(key)? {
                Some(document) => {
                    self.buffer.insert(key.to_string(), Buffered::Put(document));
                    true
                }
                None => false,
            },
        };
        if !present {
            if !create_if_missing {
                return Ok(None);
            }
            self.buffer
                .insert(key.to_string(), Buffered::Put(Document::new()));
        }
        match self.buffer.get_mut(key) {
            Some(Buffered::Put(document)) => Ok(Some(document)),
            _ => Ok(None),
        }
    }

    /// Replace a record.
    pub fn put(&mut self, key: impl Into<String>, document: Document) {
        self.buffer.insert(key.into(), Buffered::Put(document));
    }

    /// Delete a record on commit.
    pub fn remove(&mut self, key: impl Into<String>) {
        self.buffer.insert(key.into(), Buffered::Removed);
    }

    /// Number of buffered writes.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Apply every buffered write in one batch, then release all locks.
    ///
    /// Returns the number of records written or removed. On error nothing is
    /// applied and the locks are still released.
    pub fn commit(mut self) -> StoreResult<usize> {
        let mut batch = WriteBatch::owned_by(self.owner.clone());
        for (key, state) in std::mem::take(&mut self.buffer) {
            match state {
                Buffered::Put(document) => batch.put(key, document)?,
                Buffered::Removed => batch.remove(key)?,
            }
        }
        let written = batch.len();
        let applied = if batch.is_empty() {
            Ok(())
        } else {
            self.store.apply(&batch)
        };
        let released = self.release();
        applied?;
        released?;
        debug!(owner = %self.owner.short_id(), written, "transaction committed");
        Ok(written)
    }

    /// Discard the buffer and release all locks.
    pub fn rollback(mut self) -> StoreResult<()> {
        self.buffer.clear();
        debug!(owner = %self.owner.short_id(), "transaction rolled back");
        self.release()
    }

    fn release(&mut self) -> StoreResult<()> {
        self.finished = true;
        if self.locked.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = std::mem::take(&mut self.locked).into_iter().collect();
        self.store.unlock_documents(&self.owner, &keys)
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.release() {
            warn!(owner = %self.owner.short_id(), error = %e, "failed to release locks on drop");
        }
    }
}

impl std::fmt::Debug for StoreTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTransaction")
            .field("owner", &self.owner)
            .field("locked", &self.locked.len())
            .field("pending", &self.buffer.len())
            .finish()
    }
}
