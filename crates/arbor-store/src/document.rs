use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};
use crate::lock::LockOwner;

/// A stored record: a JSON object.
pub type Document = Map<String, Value>;

/// A single buffered change to one record.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Create or replace the record.
    Put(Document),
    /// Delete the record (a no-op if it does not exist).
    Remove,
}

/// A set of record changes applied all at once.
///
/// Keys are kept sorted so backends apply them in a deterministic order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    owner: Option<LockOwner>,
    ops: BTreeMap<String, WriteOp>,
}

impl WriteBatch {
    /// An empty batch that holds no locks.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty batch written on behalf of `owner`; keys that owner has
    /// locked are writable.
    pub fn owned_by(owner: LockOwner) -> Self {
        Self {
            owner: Some(owner),
            ops: BTreeMap::new(),
        }
    }

    pub fn put(&mut self, key: impl Into<String>, document: Document) -> StoreResult<()> {
        let key = checked_key(key.into())?;
        self.ops.insert(key, WriteOp::Put(document));
        Ok(())
    }

    pub fn remove(&mut self, key: impl Into<String>) -> StoreResult<()> {
        let key = checked_key(key.into())?;
        self.ops.insert(key, WriteOp::Remove);
        Ok(())
    }

    pub fn owner(&self) -> Option<&LockOwner> {
        self.owner.as_ref()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &WriteOp)> {
        self.ops.iter()
    }

    /// Keys touched by this batch, in order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.ops.keys()
    }
}

fn checked_key(key: String) -> StoreResult<String> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey(key));
    }
    Ok(key)
}
