//! Child lists: pending deltas and lazy iteration over block chains.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use arbor_store::{Document, DocumentStore};
use arbor_types::{ChildReference, NodeKey};
use serde_json::Value;

use crate::error::{DocumentError, DocumentResult};
use crate::record::{child_reference_from, children_entries, take_children, ChildrenInfo};

/// Pending edits to one node's ordered child list.
///
/// Removals, renames and insertions refer to children already persisted;
/// children added in the same session live in `appended` and are edited in
/// place instead.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChildrenChanges {
    appended: Vec<ChildReference>,
    removals: BTreeSet<NodeKey>,
    renames: BTreeMap<NodeKey, String>,
    insertions_before: BTreeMap<NodeKey, Vec<ChildReference>>,
}

impl ChildrenChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.appended.is_empty()
            && self.removals.is_empty()
            && self.renames.is_empty()
            && self.insertions_before.is_empty()
    }

    /// Add a child at the end of the list.
    pub fn append(&mut self, child: ChildReference) {
        self.appended.push(child);
    }

    /// Remove a child. Returns `true` if the child was pending addition in
    /// these changes (appended or inserted).
    pub fn remove(&mut self, key: &NodeKey) -> bool {
        self.renames.remove(key);
        if let Some(pos) = self.appended.iter().position(|c| c.key() == key) {
            self.appended.remove(pos);
            return true;
        }
        let mut found = false;
        for inserted in self.insertions_before.values_mut() {
            if let Some(pos) = inserted.iter().position(|c| c.key() == key) {
                inserted.remove(pos);
                found = true;
                break;
            }
        }
        if found {
            // A moved persisted child is already in `removals`.
            self.insertions_before.retain(|_, list| !list.is_empty());
            return true;
        }
        self.removals.insert(key.clone());
        false
    }

    /// Give a child a new name, keeping its position.
    pub fn rename(&mut self, key: &NodeKey, name: &str) {
        if let Some(child) = self.appended.iter_mut().find(|c| c.key() == key) {
            *child = child.with_name(name, 1);
            return;
        }
        for inserted in self.insertions_before.values_mut() {
            if let Some(child) = inserted.iter_mut().find(|c| c.key() == key) {
                *child = child.with_name(name, 1);
                return;
            }
        }
        self.renames.insert(key.clone(), name.to_string());
    }

    /// Place `child` immediately before the child keyed `before`.
    pub fn insert_before(&mut self, child: ChildReference, before: &NodeKey) {
        if let Some(pos) = self.appended.iter().position(|c| c.key() == before) {
            self.appended.insert(pos, child);
            return;
        }
        for inserted in self.insertions_before.values_mut() {
            if let Some(pos) = inserted.iter().position(|c| c.key() == before) {
                inserted.insert(pos, child);
                return;
            }
        }
        self.insertions_before
            .entry(before.clone())
            .or_default()
            .push(child);
    }

    /// Move an existing child before `before`, or to the end when `None`.
    pub fn reorder(&mut self, child: ChildReference, before: Option<&NodeKey>) {
        self.remove(child.key());
        match before {
            Some(before) => self.insert_before(child, before),
            None => self.append(child),
        }
    }

    pub fn appended(&self) -> &[ChildReference] {
        &self.appended
    }

    pub fn removals(&self) -> &BTreeSet<NodeKey> {
        &self.removals
    }

    pub fn renames(&self) -> &BTreeMap<NodeKey, String> {
        &self.renames
    }

    pub fn insertions_before(&self) -> &BTreeMap<NodeKey, Vec<ChildReference>> {
        &self.insertions_before
    }

    /// Whether the child was removed by these changes and not re-added.
    pub fn is_removed(&self, key: &NodeKey) -> bool {
        self.removals.contains(key) && !self.is_added(key)
    }

    /// Whether these changes add the child (appended or inserted).
    pub fn is_added(&self, key: &NodeKey) -> bool {
        self.appended.iter().any(|c| c.key() == key)
            || self
                .insertions_before
                .values()
                .any(|list| list.iter().any(|c| c.key() == key))
    }

    /// Apply these changes lazily over a persisted child sequence.
    pub fn apply_to<I>(&self, base: I) -> ChangedChildReferences<I>
    where
        I: Iterator<Item = DocumentResult<ChildReference>>,
    {
        ChangedChildReferences {
            base,
            changes: self.clone(),
            matched_anchors: HashSet::new(),
            pending: VecDeque::new(),
            base_done: false,
        }
    }
}

/// Persisted children with a [`ChildrenChanges`] applied on the fly.
///
/// Children inserted before an anchor that never shows up, and appended
/// children, come out after the persisted ones, in that order.
pub struct ChangedChildReferences<I> {
    base: I,
    changes: ChildrenChanges,
    matched_anchors: HashSet<NodeKey>,
    pending: VecDeque<ChildReference>,
    base_done: bool,
}

impl<I> Iterator for ChangedChildReferences<I>
where
    I: Iterator<Item = DocumentResult<ChildReference>>,
{
    type Item = DocumentResult<ChildReference>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(child) = self.pending.pop_front() {
                return Some(Ok(child));
            }
            if self.base_done {
                return None;
            }
            match self.base.next() {
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(child)) => {
                    if let Some(before) = self.changes.insertions_before.get(child.key()) {
                        self.matched_anchors.insert(child.key().clone());
                        self.pending.extend(before.iter().cloned());
                    }
                    if self.changes.removals.contains(child.key()) {
                        continue;
                    }
                    match self.changes.renames.get(child.key()) {
                        Some(name) => self.pending.push_back(child.with_name(name.as_str(), 1)),
                        None => self.pending.push_back(child),
                    }
                }
                None => {
                    self.base_done = true;
                    for (anchor, before) in &self.changes.insertions_before {
                        if !self.matched_anchors.contains(anchor) {
                            self.pending.extend(before.iter().cloned());
                        }
                    }
                    self.pending.extend(self.changes.appended.iter().cloned());
                }
            }
        }
    }
}

/// Assigns same-name-sibling indexes to a child sequence in order.
pub struct SnsIndexed<I> {
    inner: I,
    seen: HashMap<String, usize>,
}

impl<I> SnsIndexed<I>
where
    I: Iterator<Item = DocumentResult<ChildReference>>,
{
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            seen: HashMap::new(),
        }
    }
}

impl<I> Iterator for SnsIndexed<I>
where
    I: Iterator<Item = DocumentResult<ChildReference>>,
{
    type Item = DocumentResult<ChildReference>;

    fn next(&mut self) -> Option<Self::Item> {
        let child = match self.inner.next()? {
            Ok(child) => child,
            Err(e) => return Some(Err(e)),
        };
        let index = self.seen.entry(child.name().to_string()).or_insert(0);
        *index += 1;
        Some(Ok(child.with_sns_index(*index)))
    }
}

// ---------------------------------------------------------------------------
// Block chain iteration
// ---------------------------------------------------------------------------

/// Lazy iterator over the children of a persisted node.
///
/// Starts with the entries inline in the head record and reads each
/// satellite block only when the previous one is exhausted, so at most one
/// block is held in memory. When the chain ends, the number of children
/// yielded is checked against the head's `count`. Yields raw references
/// (SNS index 1); wrap in [`SnsIndexed`] to number same-name siblings.
pub struct BlockChildReferences {
    store: Arc<dyn DocumentStore>,
    node: String,
    expected: usize,
    current_block: String,
    current: std::vec::IntoIter<Value>,
    next_block: Option<String>,
    visited: Vec<String>,
    observed: usize,
    done: bool,
}

impl BlockChildReferences {
    /// Iterate the chain starting at `head`, the record stored under `node`.
    pub fn new(store: Arc<dyn DocumentStore>, node: &NodeKey, head: &Document) -> DocumentResult<Self> {
        let node = node.to_string();
        let info = ChildrenInfo::read(&node, head)?;
        let entries = children_entries(&node, head)?.to_vec();
        Ok(Self {
            store,
            expected: info.total(),
            current_block: node.clone(),
            current: entries.into_iter(),
            next_block: info.next_block,
            visited: vec![node.clone()],
            node,
            observed: 0,
            done: false,
        })
    }

    /// Children count recorded on the head.
    pub fn expected_count(&self) -> usize {
        self.expected
    }

    /// Read one satellite block: its `nextBlock` and its entries.
    fn load_block(&self, block: &str) -> DocumentResult<(Option<String>, Vec<Value>)> {
        let mut doc = self
            .store
            .get(block)?
            .ok_or_else(|| DocumentError::MissingBlock {
                node: self.node.clone(),
                block: block.to_string(),
            })?;
        let info = ChildrenInfo::read(block, &doc)?;
        Ok((info.next_block, take_children(block, &mut doc)?))
    }

    fn fail(&mut self, error: DocumentError) -> Option<DocumentResult<ChildReference>> {
        self.done = true;
        Some(Err(error))
    }
}

impl Iterator for BlockChildReferences {
    type Item = DocumentResult<ChildReference>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(entry) = self.current.next() {
                self.observed += 1;
                return match child_reference_from(&self.current_block, &entry) {
                    Ok(child) => Some(Ok(child)),
                    Err(e) => self.fail(e),
                };
            }
            let Some(block) = self.next_block.take() else {
                self.done = true;
                if self.observed != self.expected {
                    return Some(Err(DocumentError::CountMismatch {
                        node: self.node.clone(),
                        expected: self.expected,
                        observed: self.observed,
                        blocks: std::mem::take(&mut self.visited),
                    }));
                }
                return None;
            };
            if self.visited.contains(&block) {
                let error = DocumentError::corrupt(
                    &self.node,
                    format!("children chain loops back to block {block}"),
                );
                return self.fail(error);
            }
            match self.load_block(&block) {
                Ok((next_block, entries)) => {
                    self.current = entries.into_iter();
                    self.next_block = next_block;
                    self.visited.push(block.clone());
                    self.current_block = block;
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Integrity check
// ---------------------------------------------------------------------------

/// Shape of one node's block chain, as found by [`check_children`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainReport {
    /// `(block key, entries)` for every block, head first.
    pub blocks: Vec<(String, usize)>,
    /// Children counted across all blocks.
    pub count: usize,
}

impl ChainReport {
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Walk a node's whole block chain and verify it.
///
/// Every block must exist, each entry must decode, the chain must not loop,
/// the head's `lastBlock` must name the real last block, and the entries
/// must add up to the head's `count`.
pub fn check_children(store: &dyn DocumentStore, key: &str) -> DocumentResult<ChainReport> {
    let head = store
        .get(key)?
        .ok_or_else(|| DocumentError::MissingRecord(key.to_string()))?;
    let head_info = ChildrenInfo::read(key, &head)?;

    let mut report = ChainReport::default();
    let mut seen = HashSet::new();
    let mut block_key = key.to_string();
    let mut doc = head;
    loop {
        let entries = children_entries(&block_key, &doc)?;
        for entry in entries {
            child_reference_from(&block_key, entry)?;
        }
        report.blocks.push((block_key.clone(), entries.len()));
        report.count += entries.len();
        seen.insert(block_key.clone());

        let Some(next) = ChildrenInfo::read(&block_key, &doc)?.next_block else {
            break;
        };
        if seen.contains(&next) {
            return Err(DocumentError::corrupt(
                key,
                format!("children chain loops back to block {next}"),
            ));
        }
        doc = store.get(&next)?.ok_or_else(|| DocumentError::MissingBlock {
            node: key.to_string(),
            block: next.clone(),
        })?;
        block_key = next;
    }

    if report.blocks.len() > 1 && head_info.last_block.as_deref() != Some(block_key.as_str()) {
        return Err(DocumentError::corrupt(
            key,
            format!(
                "lastBlock is {:?} but the chain ends at {block_key}",
                head_info.last_block
            ),
        ));
    }
    if report.count != head_info.total() {
        return Err(DocumentError::CountMismatch {
            node: key.to_string(),
            expected: head_info.total(),
            observed: report.count,
            blocks: report.blocks.into_iter().map(|(k, _)| k).collect(),
        });
    }
    Ok(report)
}
