use std::collections::HashSet;
use std::sync::Arc;

use arbor_store::{Document, DocumentStore, StoreTransaction};
use arbor_types::NodeKey;
use serde_json::Value;
use tracing::{debug, warn};

use crate::children::{BlockChildReferences, ChildrenChanges};
use crate::error::{DocumentError, DocumentResult};
use crate::optimizer::{DocumentOptimizer, OptimizationResults};
use crate::record::{
    child_reference_from, set_children, take_children, to_child_entry, ChildrenInfo,
};

/// Default largest number of entries a block may hold.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 1000;
/// Default smallest number of entries a non-head block should hold.
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 250;

/// Block size limits for child lists. Always `0 < min < max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSizes {
    max: usize,
    min: usize,
}

impl BlockSizes {
    pub fn new(max: usize, min: usize) -> DocumentResult<Self> {
        if min == 0 || min >= max {
            return Err(DocumentError::InvalidBlockSizes { max, min });
        }
        Ok(Self { max, min })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn min(&self) -> usize {
        self.min
    }

    /// Whether a write left some block above `max`, or a non-head block
    /// below `min`.
    pub fn needs_optimization(&self, node: &NodeKey, write: &ChildrenWrite) -> bool {
        write.blocks.iter().any(|(block, size)| {
            *size > self.max || (block.as_str() != node.as_str() && *size < self.min)
        })
    }
}

impl Default for BlockSizes {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX_BLOCK_SIZE,
            min: DEFAULT_MIN_BLOCK_SIZE,
        }
    }
}

/// Outcome of [`DocumentTranslator::change_children`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChildrenWrite {
    /// `(block key, entries)` for every block rewritten.
    pub blocks: Vec<(String, usize)>,
    /// Total children after the write.
    pub count: usize,
}

/// Reads and rewrites node records in the persisted format.
///
/// Writes always go through a [`StoreTransaction`], so nothing reaches the
/// store before the caller commits. Reads for lazy child iteration go
/// straight to the shared store.
pub struct DocumentTranslator {
    store: Arc<dyn DocumentStore>,
    sizes: BlockSizes,
}

impl DocumentTranslator {
    pub fn new(store: Arc<dyn DocumentStore>, sizes: BlockSizes) -> Self {
        Self { store, sizes }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn sizes(&self) -> BlockSizes {
        self.sizes
    }

    pub fn optimizer(&self) -> DocumentOptimizer {
        DocumentOptimizer::new(self.sizes)
    }

    /// The head record of a node, if it exists.
    pub fn get(&self, key: &NodeKey) -> DocumentResult<Option<Document>> {
        Ok(self.store.get(key.as_str())?)
    }

    /// Lazy iterator over the persisted children of `head`.
    pub fn children(&self, key: &NodeKey, head: &Document) -> DocumentResult<BlockChildReferences> {
        BlockChildReferences::new(Arc::clone(&self.store), key, head)
    }

    /// Rewrite a node's child list inside `txn`.
    ///
    /// Blocks are walked from the head only as far as needed to apply
    /// removals, renames and insertions; appended children go to the end of
    /// the last block. `count`, `blockSize` and `lastBlock` are kept current.
    /// The resulting blocks may violate the size limits; see
    /// [`BlockSizes::needs_optimization`].
    pub fn change_children(
        &self,
        txn: &mut StoreTransaction<'_>,
        key: &NodeKey,
        changes: &ChildrenChanges,
    ) -> DocumentResult<ChildrenWrite> {
        let head_key = key.to_string();
        let head = txn
            .get(&head_key)?
            .ok_or_else(|| DocumentError::MissingRecord(head_key.clone()))?;
        let head_info = ChildrenInfo::read(&head_key, &head)?;
        drop(head);
        if changes.is_empty() {
            return Ok(ChildrenWrite {
                blocks: Vec::new(),
                count: head_info.total(),
            });
        }

        let multi_block = head_info.next_block.is_some();
        let mut write = ChildrenWrite::default();
        let mut removed = 0usize;
        let mut added = 0usize;
        let mut tail: Vec<Value> = Vec::new();

        let mut removals = changes.removals().clone();
        let mut renames = changes.renames().clone();
        let mut insertions = changes.insertions_before().clone();
        if !(removals.is_empty() && renames.is_empty() && insertions.is_empty()) {
            let mut block_key = head_key.clone();
            let mut seen = HashSet::new();
            loop {
                if !seen.insert(block_key.clone()) {
                    return Err(DocumentError::corrupt(
                        &head_key,
                        format!("children chain loops back to block {block_key}"),
                    ));
                }
                let doc = edit_block(txn, &head_key, &block_key)?;
                let entries = take_children(&block_key, doc)?;
                let mut rewritten = Vec::with_capacity(entries.len());
                for entry in entries {
                    let child = child_reference_from(&block_key, &entry)?;
                    if let Some(before) = insertions.remove(child.key()) {
                        added += before.len();
                        rewritten.extend(before.iter().map(to_child_entry));
                    }
                    if removals.remove(child.key()) {
                        removed += 1;
                        continue;
                    }
                    match renames.remove(child.key()) {
                        Some(name) => rewritten.push(to_child_entry(&child.with_name(name, 1))),
                        None => rewritten.push(entry),
                    }
                }
                let size = rewritten.len();
                set_children(doc, rewritten);
                let mut info = ChildrenInfo::read(&block_key, doc)?;
                info.block_size = multi_block.then_some(size);
                info.write_to(doc);
                write.blocks.push((block_key.clone(), size));

                let done = removals.is_empty() && renames.is_empty() && insertions.is_empty();
                match info.next_block {
                    Some(next) if !done => block_key = next,
                    _ => break,
                }
            }
            if !removals.is_empty() || !renames.is_empty() {
                warn!(
                    node = %key,
                    removals = removals.len(),
                    renames = renames.len(),
                    "children changes name keys not in the child list"
                );
            }
            for before in insertions.into_values() {
                added += before.len();
                tail.extend(before.iter().map(to_child_entry));
            }
        }

        added += changes.appended().len();
        tail.extend(changes.appended().iter().map(to_child_entry));
        if !tail.is_empty() {
            let last_key = head_info.last_block.clone().unwrap_or_else(|| head_key.clone());
            let doc = edit_block(txn, &head_key, &last_key)?;
            let mut entries = take_children(&last_key, doc)?;
            entries.extend(tail);
            let size = entries.len();
            set_children(doc, entries);
            let mut info = ChildrenInfo::read(&last_key, doc)?;
            info.block_size = multi_block.then_some(size);
            info.write_to(doc);
            match write.blocks.iter_mut().find(|(block, _)| *block == last_key) {
                Some(entry) => entry.1 = size,
                None => write.blocks.push((last_key, size)),
            }
        }

        write.count = (head_info.total() + added).saturating_sub(removed);
        let head = edit_block(txn, &head_key, &head_key)?;
        let mut info = ChildrenInfo::read(&head_key, head)?;
        info.count = Some(write.count);
        info.write_to(head);

        debug!(node = %key, added, removed, count = write.count, "children rewritten");
        Ok(write)
    }

    /// Apply `changes` and, when a block crosses the size limits and
    /// `optimize` is set, run one optimization pass over the chain.
    pub fn update_children(
        &self,
        txn: &mut StoreTransaction<'_>,
        key: &NodeKey,
        changes: &ChildrenChanges,
        optimize: bool,
    ) -> DocumentResult<OptimizationResults> {
        let write = self.change_children(txn, key, changes)?;
        if optimize && self.sizes.needs_optimization(key, &write) {
            return self.optimizer().optimize_children_blocks(txn, key);
        }
        Ok(OptimizationResults::default())
    }

    /// Delete a node's head record and every block in its chain.
    ///
    /// Returns the number of records removed; 0 when the node is absent.
    pub fn remove_node_records(&self, txn: &mut StoreTransaction<'_>, key: &NodeKey) -> DocumentResult<usize> {
        let head_key = key.to_string();
        let Some(head) = txn.get(&head_key)? else {
            return Ok(0);
        };
        let mut next = ChildrenInfo::read(&head_key, &head)?.next_block;
        txn.remove(head_key.clone());
        let mut removed = 1;
        let mut seen = HashSet::new();
        while let Some(block) = next {
            if !seen.insert(block.clone()) {
                return Err(DocumentError::corrupt(
                    &head_key,
                    format!("children chain loops back to block {block}"),
                ));
            }
            let doc = txn.get(&block)?.ok_or_else(|| DocumentError::MissingBlock {
                node: head_key.clone(),
                block: block.clone(),
            })?;
            next = ChildrenInfo::read(&block, &doc)?.next_block;
            txn.remove(block);
            removed += 1;
        }
        debug!(node = %key, removed, "node records removed");
        Ok(removed)
    }
}

impl std::fmt::Debug for DocumentTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentTranslator")
            .field("sizes", &self.sizes)
            .finish()
    }
}

/// Mutable handle on one block of `node`'s chain inside `txn`.
pub(crate) fn edit_block<'t>(
    txn: &'t mut StoreTransaction<'_>,
    node: &str,
    block: &str,
) -> DocumentResult<&'t mut Document> {
    txn.edit(block, false)?.ok_or_else(|| missing(node, block))
}

/// A copy of one block of `node`'s chain as seen by `txn`.
pub(crate) fn read_block(txn: &StoreTransaction<'_>, node: &str, block: &str) -> DocumentResult<Document> {
    txn.get(block)?.ok_or_else(|| missing(node, block))
}

fn missing(node: &str, block: &str) -> DocumentError {
    if node == block {
        DocumentError::MissingRecord(node.to_string())
    } else {
        DocumentError::MissingBlock {
            node: node.to_string(),
            block: block.to_string(),
        }
    }
}
