//! Parsed node views handed out by the caches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arbor_document::{record, BlockChildReferences, ChildrenChanges, ChildrenInfo, DocumentResult, SnsIndexed};
use arbor_store::{Document, DocumentStore};
use arbor_types::{ChildReference, NodeKey};
use serde_json::{Map, Value};

use crate::error::CacheResult;

/// Lazy sequence of child references.
pub type ChildReferences = Box<dyn Iterator<Item = DocumentResult<ChildReference>> + Send>;

/// Read access shared by persisted and session-local nodes.
pub trait NodeRead {
    fn key(&self) -> &NodeKey;

    /// `None` for the workspace root.
    fn parent_key(&self) -> Option<&NodeKey>;

    fn property(&self, name: &str) -> Option<&Value>;

    /// All properties, with any pending edits applied.
    fn properties(&self) -> Map<String, Value>;

    /// Children in order, each with SNS index 1.
    fn raw_children(&self) -> CacheResult<ChildReferences>;

    /// Children in order with same-name-sibling indexes assigned.
    fn children(&self) -> CacheResult<SnsIndexed<ChildReferences>> {
        Ok(SnsIndexed::new(self.raw_children()?))
    }

    /// The child with `name` and SNS index `sns_index`, if any.
    fn child(&self, name: &str, sns_index: usize) -> CacheResult<Option<ChildReference>> {
        for child in self.children()? {
            let child = child?;
            if child.name() == name && child.sns_index() == sns_index {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// PersistedNode
// ---------------------------------------------------------------------------

/// A head record as read from the store.
///
/// Only the head is held; satellite blocks are read from the store while
/// iterating children.
pub struct PersistedNode {
    key: NodeKey,
    parent: Option<NodeKey>,
    document: Document,
    store: Arc<dyn DocumentStore>,
}

impl PersistedNode {
    /// Parse a head record, checking its identity and children fields.
    pub fn new(store: Arc<dyn DocumentStore>, key: NodeKey, document: Document) -> CacheResult<Self> {
        let parent = record::parent_key(key.as_str(), &document)?;
        ChildrenInfo::read(key.as_str(), &document)?;
        Ok(Self {
            key,
            parent,
            document,
            store,
        })
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Total children recorded on the head.
    pub fn child_count(&self) -> CacheResult<usize> {
        Ok(ChildrenInfo::read(self.key.as_str(), &self.document)?.total())
    }

    /// Lazy iterator over the persisted chain.
    pub fn block_children(&self) -> CacheResult<BlockChildReferences> {
        Ok(BlockChildReferences::new(
            Arc::clone(&self.store),
            &self.key,
            &self.document,
        )?)
    }
}

impl NodeRead for PersistedNode {
    fn key(&self) -> &NodeKey {
        &self.key
    }

    fn parent_key(&self) -> Option<&NodeKey> {
        self.parent.as_ref()
    }

    fn property(&self, name: &str) -> Option<&Value> {
        record::property(&self.document, name)
    }

    fn properties(&self) -> Map<String, Value> {
        record::properties(&self.document).cloned().unwrap_or_default()
    }

    fn raw_children(&self) -> CacheResult<ChildReferences> {
        Ok(Box::new(self.block_children()?))
    }
}

impl std::fmt::Debug for PersistedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedNode")
            .field("key", &self.key)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SessionNode
// ---------------------------------------------------------------------------

/// Copy-on-write overlay of one node inside a session.
///
/// Holds the persisted base (absent for nodes created in the session) and
/// only the edits made since. The edits are deltas, so the overlay can be
/// [rebased](Self::rebase) when another session saves the same node.
#[derive(Clone, Debug)]
pub struct SessionNode {
    key: NodeKey,
    base: Option<Arc<PersistedNode>>,
    /// Parent set in this session; `None` follows the base.
    new_parent: Option<NodeKey>,
    changed_properties: BTreeMap<String, Value>,
    removed_properties: BTreeSet<String>,
    children: ChildrenChanges,
}

impl SessionNode {
    /// Overlay on a persisted node, with no edits yet.
    pub fn from_base(base: Arc<PersistedNode>) -> Self {
        Self {
            key: base.key.clone(),
            base: Some(base),
            new_parent: None,
            changed_properties: BTreeMap::new(),
            removed_properties: BTreeSet::new(),
            children: ChildrenChanges::new(),
        }
    }

    /// A node that exists only in this session.
    pub fn created(key: NodeKey, parent: NodeKey, properties: Map<String, Value>) -> Self {
        Self {
            key,
            base: None,
            new_parent: Some(parent),
            changed_properties: properties.into_iter().collect(),
            removed_properties: BTreeSet::new(),
            children: ChildrenChanges::new(),
        }
    }

    pub fn is_new(&self) -> bool {
        self.base.is_none()
    }

    pub fn base(&self) -> Option<&Arc<PersistedNode>> {
        self.base.as_ref()
    }

    /// Swap in a newer persisted head for this node, keeping every edit.
    pub fn rebase(&mut self, base: Arc<PersistedNode>) {
        debug_assert_eq!(base.key, self.key);
        self.base = Some(base);
    }

    /// Whether the parent changed in this session.
    pub fn is_moved(&self) -> bool {
        match (&self.base, &self.new_parent) {
            (Some(base), Some(parent)) => base.parent.as_ref() != Some(parent),
            _ => false,
        }
    }

    /// The parent the base was read with; `None` for created nodes and
    /// the root.
    pub fn base_parent_key(&self) -> Option<&NodeKey> {
        self.base.as_ref().and_then(|base| base.parent.as_ref())
    }

    pub fn changed_properties(&self) -> &BTreeMap<String, Value> {
        &self.changed_properties
    }

    pub fn removed_properties(&self) -> &BTreeSet<String> {
        &self.removed_properties
    }

    pub fn children_changes(&self) -> &ChildrenChanges {
        &self.children
    }

    pub fn children_changes_mut(&mut self) -> &mut ChildrenChanges {
        &mut self.children
    }

    /// Set a property, returning the value it replaces.
    pub fn set_property(&mut self, name: &str, value: Value) -> Option<Value> {
        let previous = self.property(name).cloned();
        self.removed_properties.remove(name);
        self.changed_properties.insert(name.to_string(), value);
        previous
    }

    /// Remove a property, returning the value it had.
    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        let previous = self.property(name).cloned();
        self.changed_properties.remove(name);
        if self
            .base
            .as_ref()
            .is_some_and(|base| base.property(name).is_some())
        {
            self.removed_properties.insert(name.to_string());
        }
        previous
    }

    pub fn set_parent(&mut self, parent: NodeKey) {
        self.new_parent = Some(parent);
    }

    /// Whether saving this node would write anything.
    pub fn has_changes(&self) -> bool {
        self.is_new()
            || self.is_moved()
            || !self.changed_properties.is_empty()
            || !self.removed_properties.is_empty()
            || !self.children.is_empty()
    }
}

impl NodeRead for SessionNode {
    fn key(&self) -> &NodeKey {
        &self.key
    }

    fn parent_key(&self) -> Option<&NodeKey> {
        self.new_parent.as_ref().or_else(|| self.base_parent_key())
    }

    fn property(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.changed_properties.get(name) {
            return Some(value);
        }
        if self.removed_properties.contains(name) {
            return None;
        }
        self.base.as_ref().and_then(|base| base.property(name))
    }

    fn properties(&self) -> Map<String, Value> {
        let mut props = self
            .base
            .as_ref()
            .map(|base| base.properties())
            .unwrap_or_default();
        for name in &self.removed_properties {
            props.remove(name);
        }
        for (name, value) in &self.changed_properties {
            props.insert(name.clone(), value.clone());
        }
        props
    }

    fn raw_children(&self) -> CacheResult<ChildReferences> {
        let base: ChildReferences = match &self.base {
            Some(base) => base.raw_children()?,
            None => Box::new(std::iter::empty()),
        };
        Ok(Box::new(self.children.apply_to(base)))
    }
}

// ---------------------------------------------------------------------------
// CachedNode
// ---------------------------------------------------------------------------

/// A node as handed out by a cache: the shared persisted view, or a
/// snapshot of a session's overlay.
#[derive(Clone, Debug)]
pub enum CachedNode {
    Immutable(Arc<PersistedNode>),
    Mutable(Arc<SessionNode>),
}

impl CachedNode {
    pub fn is_mutable(&self) -> bool {
        matches!(self, CachedNode::Mutable(_))
    }

    fn inner(&self) -> &dyn NodeRead {
        match self {
            CachedNode::Immutable(node) => node.as_ref(),
            CachedNode::Mutable(node) => node.as_ref(),
        }
    }
}

impl NodeRead for CachedNode {
    fn key(&self) -> &NodeKey {
        self.inner().key()
    }

    fn parent_key(&self) -> Option<&NodeKey> {
        self.inner().parent_key()
    }

    fn property(&self, name: &str) -> Option<&Value> {
        self.inner().property(name)
    }

    fn properties(&self) -> Map<String, Value> {
        self.inner().properties()
    }

    fn raw_children(&self) -> CacheResult<ChildReferences> {
        self.inner().raw_children()
    }
}
