//! Record store for Arbor.
//!
//! This crate is the persistence contract consumed by the cache layers: a
//! key/document database that stores one JSON object per string key and
//! offers exclusive, batch-acquired per-key locks. It never interprets the
//! documents it stores.
//!
//! # Storage Backends
//!
//! All backends implement the [`DocumentStore`] trait:
//!
//! - [`InMemoryDocumentStore`] -- `HashMap`-based store for tests and embedding
//! - [`FileDocumentStore`] -- one JSON file per key in a directory
//!
//! # Design Rules
//!
//! 1. Absence is a normal outcome: reads return `Ok(None)`, never an error.
//! 2. `lock_documents` acquires every requested key or none of them.
//! 3. Writes are applied as a [`WriteBatch`], all at once, and are refused if
//!    any key in the batch is locked by a different owner.
//! 4. [`StoreTransaction`] buffers edits in memory; nothing reaches the store
//!    until `commit`, so an abandoned transaction leaves no trace.
//! 5. All I/O errors are propagated, never silently ignored.

pub mod document;
pub mod error;
pub mod file;
pub mod lock;
pub mod memory;
pub mod traits;
pub mod transaction;

pub use document::{Document, WriteBatch, WriteOp};
pub use error::{StoreError, StoreResult};
pub use file::FileDocumentStore;
pub use lock::{LockOwner, LockTable};
pub use memory::InMemoryDocumentStore;
pub use traits::DocumentStore;
pub use transaction::StoreTransaction;
