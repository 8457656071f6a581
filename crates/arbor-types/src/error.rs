use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid node key {key:?}: {reason}")]
    InvalidNodeKey { key: String, reason: String },

    #[error("invalid key component {component:?}: expected {expected} ASCII characters")]
    InvalidComponent { component: String, expected: usize },

    #[error("child name must not be empty")]
    EmptyName,
}
