//! Workspace and session node caches for Arbor.
//!
//! A [`WorkspaceCache`] is the shared, persisted view of one workspace: a
//! concurrent map of parsed head records, filled lazily from the record
//! store and evicted when a save changes them. Each [`SessionCache`] layers
//! a private copy-on-write overlay on top of it. Edits stay in the session
//! until [`SessionCache::save`] locks every touched record in one batch,
//! re-applies the edits to the current records, commits, and publishes a
//! [`ChangeSet`] to the workspace's subscribers.
//!
//! # Key Types
//!
//! - [`Repository`] -- opens workspaces and sessions; maintenance passes
//! - [`WorkspaceCache`] / [`SessionCache`] -- the two [`NodeCache`] layers
//! - [`CachedNode`] -- a node as handed out by either cache
//! - [`NodeCacheIterator`] -- pre-order traversal in O(depth) memory
//! - [`RepositoryConfig`] -- block sizes, lock retry budget, channel sizes

pub mod changes;
pub mod config;
pub mod error;
pub mod iterator;
pub mod node;
pub mod repository;
pub mod retry;
pub mod session;
pub mod workspace;

pub use changes::{Change, ChangeSet};
pub use config::{ChildrenBlockConfig, LockConfig, RepositoryConfig};
pub use error::{CacheError, CacheResult};
pub use iterator::{NodeCache, NodeCacheIterator};
pub use node::{CachedNode, ChildReferences, NodeRead, PersistedNode, SessionNode};
pub use repository::{IntegrityReport, Repository};
pub use retry::LockRetry;
pub use session::{MutableNode, SessionCache};
pub use workspace::{ChangeStream, WorkspaceCache};
