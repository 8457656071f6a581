//! Exclusive per-key locks acquired in batches.
//!
//! A [`LockTable`] maps record keys to the [`LockOwner`] holding them. A
//! batch request either acquires every key or none of them, so two owners
//! locking overlapping key sets can never each hold part of the other's set
//! and wait forever.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity of one lock holder (UUID v7, so owners sort by creation time).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockOwner(uuid::Uuid);

impl LockOwner {
    /// Generate a new owner identity.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// Short representation (first 8 characters of the UUID).
    pub fn short_id(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for LockOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockOwner({})", self.short_id())
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-process table of held record locks.
///
/// Locks are re-entrant for the same owner. The whole table sits behind one
/// mutex, which is what makes a batch acquisition atomic.
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashMap<String, LockOwner>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to lock every key for `owner`.
    ///
    /// Keys are de-duplicated and visited in sorted order. Returns `false`,
    /// holding nothing new, if any key is held by another owner.
    pub fn try_lock_all(&self, owner: &LockOwner, keys: &[String]) -> bool {
        let sorted: BTreeSet<&String> = keys.iter().collect();
        let mut held = self.held.lock().expect("lock table poisoned");

        if let Some(contended) = sorted
            .iter()
            .find(|key| held.get(key.as_str()).is_some_and(|holder| holder != owner))
        {
            debug!(key = %contended, owner = %owner.short_id(), "lock contended");
            return false;
        }

        for key in sorted {
            held.insert(key.clone(), owner.clone());
        }
        true
    }

    /// Release the given keys if `owner` holds them. Keys held by other
    /// owners are left alone.
    pub fn unlock_all(&self, owner: &LockOwner, keys: &[String]) {
        let mut held = self.held.lock().expect("lock table poisoned");
        for key in keys {
            if held.get(key).is_some_and(|holder| holder == owner) {
                held.remove(key);
            }
        }
    }

    /// The owner currently holding `key`, if any.
    pub fn holder(&self, key: &str) -> Option<LockOwner> {
        self.held
            .lock()
            .expect("lock table poisoned")
            .get(key)
            .cloned()
    }

    /// The first key among `keys` held by someone other than `owner`.
    pub fn conflicting<'k>(
        &self,
        owner: Option<&LockOwner>,
        keys: impl IntoIterator<Item = &'k String>,
    ) -> Option<(String, LockOwner)> {
        let held = self.held.lock().expect("lock table poisoned");
        keys.into_iter().find_map(|key| match held.get(key) {
            Some(holder) if Some(holder) != owner => Some((key.clone(), holder.clone())),
            _ => None,
        })
    }

    /// Number of keys currently locked.
    pub fn len(&self) -> usize {
        self.held.lock().expect("lock table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn acquire_and_release() {
        let table = LockTable::new();
        let owner = LockOwner::new();
        assert!(table.try_lock_all(&owner, &keys(&["a", "b"])));
        assert_eq!(table.len(), 2);
        assert_eq!(table.holder("a"), Some(owner.clone()));

        table.unlock_all(&owner, &keys(&["a", "b"]));
        assert!(table.is_empty());
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let table = LockTable::new();
        let first = LockOwner::new();
        let second = LockOwner::new();
        assert!(table.try_lock_all(&first, &keys(&["b"])));

        assert!(!table.try_lock_all(&second, &keys(&["a", "b", "c"])));
        assert_eq!(table.holder("a"), None);
        assert_eq!(table.holder("c"), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reentrant_for_same_owner() {
        let table = LockTable::new();
        let owner = LockOwner::new();
        assert!(table.try_lock_all(&owner, &keys(&["a"])));
        assert!(table.try_lock_all(&owner, &keys(&["a", "b"])));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn unlock_ignores_other_owners_keys() {
        let table = LockTable::new();
        let first = LockOwner::new();
        let second = LockOwner::new();
        assert!(table.try_lock_all(&first, &keys(&["a"])));
        table.unlock_all(&second, &keys(&["a"]));
        assert_eq!(table.holder("a"), Some(first));
    }

    #[test]
    fn conflicting_reports_foreign_holder() {
        let table = LockTable::new();
        let first = LockOwner::new();
        let second = LockOwner::new();
        assert!(table.try_lock_all(&first, &keys(&["a"])));
        let requested = keys(&["x", "a"]);

        assert_eq!(table.conflicting(Some(&first), &requested), None);
        assert_eq!(
            table.conflicting(Some(&second), &requested),
            Some(("a".to_string(), first.clone()))
        );
        assert!(table.conflicting(None, &requested).is_some());
    }

    #[test]
    fn concurrent_owners_never_share_a_key() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(LockTable::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let owner = LockOwner::new();
                    // Alternate orderings of the same overlapping set.
                    let set = if i % 2 == 0 {
                        keys(&["a", "b", "c"])
                    } else {
                        keys(&["c", "b", "a"])
                    };
                    let mut acquired = 0;
                    for _ in 0..200 {
                        if table.try_lock_all(&owner, &set) {
                            acquired += 1;
                            assert!(set.iter().all(|k| table.holder(k) == Some(owner.clone())));
                            table.unlock_all(&owner, &set);
                        }
                    }
                    acquired
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total > 0);
        assert!(table.is_empty());
    }
}
