//! Field names of the persisted record format.
//!
//! These strings are the on-disk wire format and must never change.

/// Textual node key of a head record.
pub const KEY: &str = "key";
/// Textual key of the parent node; absent on the root.
pub const PARENT: &str = "parent";
/// Object of property name to value.
pub const PROPERTIES: &str = "properties";
/// Array of child entries held by a block.
pub const CHILDREN: &str = "children";
/// Block-chain metadata object.
pub const CHILDREN_INFO: &str = "childrenInfo";
/// Total number of children across every block (head only).
pub const COUNT: &str = "count";
/// Key of the following block.
pub const NEXT_BLOCK: &str = "nextBlock";
/// Key of the final block (head only).
pub const LAST_BLOCK: &str = "lastBlock";
/// Number of entries in this block.
pub const BLOCK_SIZE: &str = "blockSize";
/// Name of a child entry.
pub const NAME: &str = "name";
