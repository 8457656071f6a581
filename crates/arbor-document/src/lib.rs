//! Node record translator and children block optimizer for Arbor.
//!
//! A node is persisted as a head record holding its properties and the first
//! block of its ordered child list. Longer child lists continue in satellite
//! block records linked through `childrenInfo.nextBlock`, so no record grows
//! without bound and edits touch only the blocks they need.
//!
//! # Key Types
//!
//! - [`DocumentTranslator`] -- reads records, rewrites child lists inside a
//!   [`arbor_store::StoreTransaction`], removes whole chains
//! - [`DocumentOptimizer`] -- splits oversized blocks and merges or
//!   rebalances undersized ones
//! - [`ChildrenChanges`] -- a pending delta against a persisted child list
//! - [`BlockChildReferences`] -- lazy, one-block-at-a-time child iteration
//! - [`check_children`] -- full integrity check of one chain

pub mod children;
pub mod constants;
pub mod error;
pub mod optimizer;
pub mod record;
pub mod translator;

pub use children::{
    check_children, BlockChildReferences, ChainReport, ChangedChildReferences, ChildrenChanges,
    SnsIndexed,
};
pub use error::{DocumentError, DocumentResult};
pub use optimizer::{DocumentOptimizer, OptimizationResults};
pub use record::ChildrenInfo;
pub use translator::{
    BlockSizes, ChildrenWrite, DocumentTranslator, DEFAULT_MAX_BLOCK_SIZE, DEFAULT_MIN_BLOCK_SIZE,
};
