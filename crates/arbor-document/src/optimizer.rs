//! Split and merge of children blocks.
//!
//! A block above the maximum size is split at its midpoint into two blocks,
//! repeatedly, until no piece exceeds the maximum. A block followed by a
//! block below the minimum (or whose combined size with the next block is at
//! most the minimum) absorbs that block when the result fits within the
//! maximum; otherwise entries move from the end of the block to the front of
//! the next one until the next block reaches the minimum, provided the block
//! itself stays at or above the minimum. The head block is never required to
//! reach the minimum. Order is preserved by every operation.

use std::ops::AddAssign;

use arbor_store::{Document, StoreTransaction};
use arbor_types::NodeKey;
use tracing::debug;

use crate::error::DocumentResult;
use crate::record::{children_entries, set_children, take_children, ChildrenInfo};
use crate::translator::{edit_block, read_block, BlockSizes};

/// Counters from one or more optimization passes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptimizationResults {
    pub nodes_visited: usize,
    pub blocks_split: usize,
    pub blocks_merged: usize,
    /// Partial transfers into an undersized next block.
    pub blocks_rebalanced: usize,
}

impl OptimizationResults {
    /// Whether any block changed shape.
    pub fn changed(&self) -> bool {
        self.blocks_split + self.blocks_merged + self.blocks_rebalanced > 0
    }
}

impl AddAssign for OptimizationResults {
    fn add_assign(&mut self, other: Self) {
        self.nodes_visited += other.nodes_visited;
        self.blocks_split += other.blocks_split;
        self.blocks_merged += other.blocks_merged;
        self.blocks_rebalanced += other.blocks_rebalanced;
    }
}

/// Applies the block size policy to one node's chain inside a transaction.
#[derive(Clone, Copy, Debug, Default)]
pub struct DocumentOptimizer {
    sizes: BlockSizes,
}

impl DocumentOptimizer {
    pub fn new(sizes: BlockSizes) -> Self {
        Self { sizes }
    }

    pub fn sizes(&self) -> BlockSizes {
        self.sizes
    }

    /// Split `block` of `node`'s chain while it holds more than the maximum.
    ///
    /// Returns `false` when the block is already within the limit, so
    /// repeated calls without growth are no-ops.
    pub fn split_children(&self, txn: &mut StoreTransaction<'_>, node: &NodeKey, block: &str) -> DocumentResult<bool> {
        Ok(self.split_block(txn, node, block)? > 0)
    }

    /// Merge or rebalance `block` with the blocks that follow it.
    ///
    /// Returns `false` when nothing moved, which is always the case when the
    /// following blocks are each at or above the minimum.
    pub fn merge_children(&self, txn: &mut StoreTransaction<'_>, node: &NodeKey, block: &str) -> DocumentResult<bool> {
        let (merged, rebalanced) = self.merge_block(txn, node, block)?;
        Ok(merged + rebalanced > 0)
    }

    /// One pass over `node`'s chain from the head: merge, then split, each
    /// block in turn. Callers re-invoke after further growth rather than
    /// looping here.
    pub fn optimize_children_blocks(
        &self,
        txn: &mut StoreTransaction<'_>,
        node: &NodeKey,
    ) -> DocumentResult<OptimizationResults> {
        let head_key = node.to_string();
        let mut results = OptimizationResults {
            nodes_visited: 1,
            ..OptimizationResults::default()
        };
        let mut block = Some(head_key.clone());
        while let Some(current) = block {
            let (merged, rebalanced) = self.merge_block(txn, node, &current)?;
            results.blocks_merged += merged;
            results.blocks_rebalanced += rebalanced;
            results.blocks_split += self.split_block(txn, node, &current)?;

            let doc = read_block(txn, &head_key, &current)?;
            block = ChildrenInfo::read(&current, &doc)?.next_block;
        }
        if results.changed() {
            debug!(
                node = %node,
                split = results.blocks_split,
                merged = results.blocks_merged,
                rebalanced = results.blocks_rebalanced,
                "children blocks optimized"
            );
        }
        Ok(results)
    }

    fn split_block(&self, txn: &mut StoreTransaction<'_>, node: &NodeKey, block: &str) -> DocumentResult<usize> {
        let head_key = node.to_string();
        let mut splits = 0;
        let mut pending = vec![block.to_string()];
        while let Some(current) = pending.pop() {
            let size = children_entries(&current, &read_block(txn, &head_key, &current)?)?.len();
            if size <= self.sizes.max() {
                continue;
            }

            let new_key = node.with_random_id().to_string();
            let doc = edit_block(txn, &head_key, &current)?;
            let mut entries = take_children(&current, doc)?;
            let moved = entries.split_off(entries.len() / 2);
            let mut info = ChildrenInfo::read(&current, doc)?;
            let old_next = info.next_block.replace(new_key.clone());
            info.block_size = Some(entries.len());
            set_children(doc, entries);
            info.write_to(doc);

            let mut satellite = Document::new();
            let moved_len = moved.len();
            set_children(&mut satellite, moved);
            ChildrenInfo {
                next_block: old_next.clone(),
                block_size: Some(moved_len),
                ..ChildrenInfo::default()
            }
            .write_to(&mut satellite);
            txn.put(new_key.clone(), satellite);

            if old_next.is_none() {
                set_last_block(txn, &head_key, Some(new_key.clone()))?;
            }
            debug!(node = %node, block = %current, new_block = %new_key, "block split");
            splits += 1;
            pending.push(new_key);
            pending.push(current);
        }
        Ok(splits)
    }

    fn merge_block(&self, txn: &mut StoreTransaction<'_>, node: &NodeKey, block: &str) -> DocumentResult<(usize, usize)> {
        let head_key = node.to_string();
        let (min, max) = (self.sizes.min(), self.sizes.max());
        let mut merged = 0;
        loop {
            let doc = read_block(txn, &head_key, block)?;
            let Some(next_key) = ChildrenInfo::read(block, &doc)?.next_block else {
                break;
            };
            let size = children_entries(block, &doc)?.len();
            let mut next_doc = read_block(txn, &head_key, &next_key)?;
            let next_info = ChildrenInfo::read(&next_key, &next_doc)?;
            let next_size = children_entries(&next_key, &next_doc)?.len();
            if !(size + next_size <= min || next_size < min) {
                break;
            }

            if size + next_size > max {
                let wanted = min - next_size;
                if size < wanted + min {
                    break;
                }
                self.rebalance(txn, &head_key, block, &next_key, wanted)?;
                debug!(node = %node, block = %block, next = %next_key, moved = wanted, "blocks rebalanced");
                return Ok((merged, 1));
            }

            let absorbed = take_children(&next_key, &mut next_doc)?;
            let doc = edit_block(txn, &head_key, block)?;
            let mut entries = take_children(block, doc)?;
            entries.extend(absorbed);
            let merged_size = entries.len();
            set_children(doc, entries);
            let mut info = ChildrenInfo::read(block, doc)?;
            info.next_block = next_info.next_block.clone();
            if block == head_key && info.next_block.is_none() {
                info.last_block = None;
                info.block_size = None;
            } else {
                info.block_size = Some(merged_size);
            }
            info.write_to(doc);
            txn.remove(next_key.clone());

            if next_info.next_block.is_none() && block != head_key {
                set_last_block(txn, &head_key, Some(block.to_string()))?;
            }
            debug!(node = %node, block = %block, absorbed = %next_key, "blocks merged");
            merged += 1;
        }
        Ok((merged, 0))
    }

    /// Move the last `count` entries of `block` to the front of `next`.
    fn rebalance(
        &self,
        txn: &mut StoreTransaction<'_>,
        head_key: &str,
        block: &str,
        next: &str,
        count: usize,
    ) -> DocumentResult<()> {
        let doc = edit_block(txn, head_key, block)?;
        let mut entries = take_children(block, doc)?;
        let moved = entries.split_off(entries.len() - count);
        let mut info = ChildrenInfo::read(block, doc)?;
        info.block_size = Some(entries.len());
        set_children(doc, entries);
        info.write_to(doc);

        let doc = edit_block(txn, head_key, next)?;
        let mut entries = moved;
        entries.extend(take_children(next, doc)?);
        let mut info = ChildrenInfo::read(next, doc)?;
        info.block_size = Some(entries.len());
        set_children(doc, entries);
        info.write_to(doc);
        Ok(())
    }
}

fn set_last_block(txn: &mut StoreTransaction<'_>, head_key: &str, last: Option<String>) -> DocumentResult<()> {
    let head = edit_block(txn, head_key, head_key)?;
    let mut info = ChildrenInfo::read(head_key, head)?;
    info.last_block = last;
    info.write_to(head);
    Ok(())
}
