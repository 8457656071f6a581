//! Error types for the node caches.

use arbor_document::DocumentError;
use arbor_store::StoreError;
use arbor_types::{NodeKey, TypeError};

/// Errors from workspace and session cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An operation required a node that does not exist (or was removed in
    /// this session).
    #[error("node not found: {0}")]
    NodeNotFound(NodeKey),

    /// A node created in a session already exists in the store.
    #[error("node already exists: {0}")]
    NodeAlreadyExists(NodeKey),

    /// The batch lock for a save could not be acquired within the retry
    /// budget.
    #[error("could not lock {} records after {attempts} attempts", keys.len())]
    LockTimeout {
        /// Record keys requested, sorted.
        keys: Vec<String>,
        attempts: u32,
    },

    /// The operation would break the tree: a cycle, removing the root, or
    /// saving part of a session that depends on its other changes.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A traversal was advanced past its last element.
    #[error("no such element: traversal is exhausted")]
    NoSuchElement,

    /// Configuration that cannot be loaded or used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Record format or block chain fault.
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Error from the record store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Malformed key or name.
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Convenience alias for cache results.
pub type CacheResult<T> = Result<T, CacheError>;
