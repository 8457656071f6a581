//! Error types for record translation and block optimization.

use arbor_store::StoreError;

/// Errors raised while reading or rewriting node records.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// A `nextBlock` pointer names a record that does not exist.
    #[error("node {node}: children block {block} is missing")]
    MissingBlock {
        /// Head record key of the node.
        node: String,
        /// The dangling block key.
        block: String,
    },

    /// The blocks of a chain do not add up to the head's `count`.
    #[error("node {node}: count is {expected} but blocks {blocks:?} hold {observed} children")]
    CountMismatch {
        node: String,
        expected: usize,
        observed: usize,
        /// Block keys visited, head first.
        blocks: Vec<String>,
    },

    /// A record field has the wrong shape.
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// A head record required by the operation does not exist.
    #[error("record not found: {0}")]
    MissingRecord(String),

    /// Block size limits that cannot be satisfied.
    #[error("invalid block sizes: need 0 < min ({min}) < max ({max})")]
    InvalidBlockSizes { max: usize, min: usize },

    /// Error from the underlying record store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DocumentError {
    pub(crate) fn corrupt(key: &str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias for document results.
pub type DocumentResult<T> = Result<T, DocumentError>;
