use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use arbor_document::record::{self, new_node_document};
use arbor_document::OptimizationResults;
use arbor_store::StoreTransaction;
use arbor_types::{ChildReference, NodeKey};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::changes::{Change, ChangeSet};
use crate::error::{CacheError, CacheResult};
use crate::iterator::NodeCache;
use crate::node::{CachedNode, NodeRead, SessionNode};
use crate::retry::LockRetry;
use crate::workspace::WorkspaceCache;

/// Edits made in one session and not yet saved.
#[derive(Default)]
struct SessionState {
    changed: BTreeMap<NodeKey, Arc<SessionNode>>,
    created: HashSet<NodeKey>,
    /// Removed persisted nodes and the parent each had.
    removed: BTreeMap<NodeKey, Option<NodeKey>>,
    log: Vec<Change>,
}

impl SessionState {
    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// A private, copy-on-write view of one workspace.
///
/// Reads see this session's pending edits first and fall through to the
/// shared [`WorkspaceCache`]. Nothing is visible to other sessions until
/// [`save`](Self::save) commits.
pub struct SessionCache {
    id: Uuid,
    workspace: Arc<WorkspaceCache>,
    retry: LockRetry,
    state: RwLock<SessionState>,
}

impl SessionCache {
    pub fn new(workspace: Arc<WorkspaceCache>) -> Self {
        let retry = LockRetry::new(&workspace.config().locking);
        let id = Uuid::now_v7();
        debug!(session = %id, workspace = %workspace.name(), "session opened");
        Self {
            id,
            workspace,
            retry,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn workspace(&self) -> &Arc<WorkspaceCache> {
        &self.workspace
    }

    /// A handle for editing the node under `key`.
    pub fn mutable(&self, key: &NodeKey) -> CacheResult<MutableNode<'_>> {
        self.require(key)?;
        Ok(MutableNode {
            session: self,
            key: key.clone(),
        })
    }

    fn require(&self, key: &NodeKey) -> CacheResult<CachedNode> {
        self.get_node(key)?
            .ok_or_else(|| CacheError::NodeNotFound(key.clone()))
    }

    /// Run `edit` on the session's overlay of `key`, creating the overlay
    /// from the workspace view on first use.
    fn edit<R>(
        &self,
        state: &mut SessionState,
        key: &NodeKey,
        edit: impl FnOnce(&mut SessionNode) -> R,
    ) -> CacheResult<R> {
        if state.removed.contains_key(key) {
            return Err(CacheError::NodeNotFound(key.clone()));
        }
        if let Some(node) = state.changed.get_mut(key) {
            self.refresh_base(node)?;
            return Ok(edit(Arc::make_mut(node)));
        }
        let base = self
            .workspace
            .persisted_node(key)?
            .ok_or_else(|| CacheError::NodeNotFound(key.clone()))?;
        let mut node = SessionNode::from_base(base);
        let result = edit(&mut node);
        state.changed.insert(key.clone(), Arc::new(node));
        Ok(result)
    }

    /// Rebase an overlay onto the workspace's current head when a save
    /// has replaced the head it was made from. Overlays of created nodes,
    /// and of nodes no longer in the store, are left alone.
    fn refresh_base(&self, node: &mut Arc<SessionNode>) -> CacheResult<()> {
        if node.is_new() {
            return Ok(());
        }
        let Some(current) = self.workspace.persisted_node(node.key())? else {
            return Ok(());
        };
        if node.base().is_some_and(|base| !Arc::ptr_eq(base, &current)) {
            debug!(session = %self.id, key = %node.key(), "overlay rebased");
            Arc::make_mut(node).rebase(current);
        }
        Ok(())
    }

    fn refresh_overlays(&self, state: &mut SessionState) -> CacheResult<()> {
        for node in state.changed.values_mut() {
            self.refresh_base(node)?;
        }
        Ok(())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().expect("lock poisoned")
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    pub fn set_property(&self, key: &NodeKey, name: &str, value: Value) -> CacheResult<()> {
        let mut state = self.write_state();
        let previous = self.edit(&mut state, key, |node| node.set_property(name, value.clone()))?;
        let change = match previous {
            Some(_) => Change::PropertyChanged {
                key: key.clone(),
                name: name.to_string(),
                value,
            },
            None => Change::PropertyAdded {
                key: key.clone(),
                name: name.to_string(),
                value,
            },
        };
        state.log.push(change);
        Ok(())
    }

    /// Remove a property. Returns `false` if the node did not have it.
    pub fn remove_property(&self, key: &NodeKey, name: &str) -> CacheResult<bool> {
        let mut state = self.write_state();
        let previous = self.edit(&mut state, key, |node| node.remove_property(name))?;
        if previous.is_some() {
            state.log.push(Change::PropertyRemoved {
                key: key.clone(),
                name: name.to_string(),
            });
        }
        Ok(previous.is_some())
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    /// Create a node under `parent` with a generated key.
    pub fn create_child(&self, parent: &NodeKey, name: &str, properties: Map<String, Value>) -> CacheResult<NodeKey> {
        let key = parent.with_random_id();
        self.create_child_with_key(parent, key.clone(), name, properties)?;
        Ok(key)
    }

    /// Create a node under `parent` with a caller-chosen key.
    pub fn create_child_with_key(
        &self,
        parent: &NodeKey,
        key: NodeKey,
        name: &str,
        properties: Map<String, Value>,
    ) -> CacheResult<()> {
        let reference = ChildReference::named(key.clone(), name)?;
        if !key.same_workspace(parent) {
            return Err(CacheError::InvalidOperation(format!(
                "{key} is not in the workspace of {parent}"
            )));
        }
        if self.get_node(&key)?.is_some() {
            return Err(CacheError::NodeAlreadyExists(key));
        }
        let mut state = self.write_state();
        self.edit(&mut state, parent, |node| node.children_changes_mut().append(reference))?;
        state.changed.insert(
            key.clone(),
            Arc::new(SessionNode::created(key.clone(), parent.clone(), properties)),
        );
        state.created.insert(key.clone());
        state.log.push(Change::NodeCreated {
            key: key.clone(),
            parent: parent.clone(),
        });
        debug!(session = %self.id, key = %key, parent = %parent, "node created");
        Ok(())
    }

    /// The parent of `child`, checked against `parent`.
    fn check_parent(&self, parent: &NodeKey, child: &NodeKey) -> CacheResult<CachedNode> {
        let node = self.require(child)?;
        if node.parent_key() != Some(parent) {
            return Err(CacheError::InvalidOperation(format!(
                "{child} is not a child of {parent}"
            )));
        }
        Ok(node)
    }

    /// Give the child a new name in its parent's list. The child's own
    /// record is not touched.
    pub fn rename_child(&self, parent: &NodeKey, child: &NodeKey, name: &str) -> CacheResult<()> {
        ChildReference::named(child.clone(), name)?;
        self.check_parent(parent, child)?;
        let mut state = self.write_state();
        self.edit(&mut state, parent, |node| node.children_changes_mut().rename(child, name))?;
        state.log.push(Change::NodeRenamed {
            parent: parent.clone(),
            key: child.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    /// Move `child` before `before` among its siblings, or to the end.
    pub fn reorder_child(&self, parent: &NodeKey, child: &NodeKey, before: Option<&NodeKey>) -> CacheResult<()> {
        self.check_parent(parent, child)?;
        if let Some(before) = before {
            if before == child {
                return Ok(());
            }
            self.check_parent(parent, before)?;
        }
        let reference = self
            .find_child(parent, child)?
            .ok_or_else(|| CacheError::NodeNotFound(child.clone()))?;
        let mut state = self.write_state();
        self.edit(&mut state, parent, |node| node.children_changes_mut().reorder(reference, before))?;
        state.log.push(Change::ChildrenReordered {
            parent: parent.clone(),
        });
        Ok(())
    }

    /// The reference to `child` in `parent`'s current child list.
    fn find_child(&self, parent: &NodeKey, child: &NodeKey) -> CacheResult<Option<ChildReference>> {
        for reference in self.require(parent)?.raw_children()? {
            let reference = reference?;
            if reference.key() == child {
                return Ok(Some(reference));
            }
        }
        Ok(None)
    }

    /// Move `key` under `new_parent` with `name`, appended last.
    pub fn move_node(&self, key: &NodeKey, new_parent: &NodeKey, name: &str) -> CacheResult<()> {
        let reference = ChildReference::named(key.clone(), name)?;
        if key == self.root_key() {
            return Err(CacheError::InvalidOperation("the root cannot be moved".into()));
        }
        let node = self.require(key)?;
        self.require(new_parent)?;
        let mut ancestor = Some(new_parent.clone());
        while let Some(current) = ancestor {
            if current == *key {
                return Err(CacheError::InvalidOperation(format!(
                    "cannot move {key} below itself"
                )));
            }
            ancestor = self.require(&current)?.parent_key().cloned();
        }

        let old_parent = node.parent_key().cloned();
        let mut state = self.write_state();
        if let Some(old_parent) = &old_parent {
            self.edit(&mut state, old_parent, |node| {
                node.children_changes_mut().remove(key);
            })?;
        }
        self.edit(&mut state, new_parent, |node| node.children_changes_mut().append(reference))?;
        self.edit(&mut state, key, |node| node.set_parent(new_parent.clone()))?;
        state.log.push(Change::NodeMoved {
            key: key.clone(),
            from: old_parent,
            to: new_parent.clone(),
        });
        Ok(())
    }

    /// Remove `key` and its whole subtree when the session is saved.
    pub fn destroy(&self, key: &NodeKey) -> CacheResult<()> {
        if key == self.root_key() {
            return Err(CacheError::InvalidOperation("the root cannot be removed".into()));
        }
        let node = self.require(key)?;
        let parent = node.parent_key().cloned();

        let mut subtree = Vec::new();
        for descendant in self.get_all_node_keys_at_and_below(key) {
            let descendant = descendant?;
            let descendant_parent = if descendant == *key {
                parent.clone()
            } else {
                self.require(&descendant)?.parent_key().cloned()
            };
            subtree.push((descendant, descendant_parent));
        }

        let mut state = self.write_state();
        if let Some(parent) = &parent {
            self.edit(&mut state, parent, |node| {
                node.children_changes_mut().remove(key);
            })?;
        }
        let mut removed = 0;
        for (descendant, descendant_parent) in subtree {
            state.changed.remove(&descendant);
            if state.created.remove(&descendant) {
                state.log.retain(|change| change.node_key() != &descendant);
                continue;
            }
            state.log.push(Change::NodeRemoved {
                key: descendant.clone(),
                parent: descendant_parent.clone(),
            });
            state.removed.insert(descendant, descendant_parent);
            removed += 1;
        }
        debug!(session = %self.id, key = %key, removed, "subtree destroyed");
        Ok(())
    }

    pub fn is_destroyed(&self, key: &NodeKey) -> bool {
        self.state
            .read()
            .expect("lock poisoned")
            .removed
            .contains_key(key)
    }

    // -----------------------------------------------------------------------
    // Pending state
    // -----------------------------------------------------------------------

    pub fn has_changes(&self) -> bool {
        !self.state.read().expect("lock poisoned").is_empty()
    }

    /// Keys of every node changed, created or removed in this session.
    pub fn changed_node_keys(&self) -> BTreeSet<NodeKey> {
        let state = self.state.read().expect("lock poisoned");
        state
            .changed
            .keys()
            .chain(state.removed.keys())
            .cloned()
            .collect()
    }

    /// Changed keys that are `key` or lie below it.
    ///
    /// Ancestry comes from the session's own nodes first. Ancestors the
    /// session never touched are looked up through the workspace cache.
    pub fn changed_node_keys_at_or_below(&self, key: &NodeKey) -> CacheResult<BTreeSet<NodeKey>> {
        let (candidates, mut parents) = {
            let state = self.state.read().expect("lock poisoned");
            let mut parents: HashMap<NodeKey, Option<NodeKey>> = state
                .changed
                .iter()
                .map(|(k, node)| (k.clone(), node.parent_key().cloned()))
                .collect();
            parents.extend(state.removed.iter().map(|(k, p)| (k.clone(), p.clone())));
            let candidates: Vec<NodeKey> = parents.keys().cloned().collect();
            (candidates, parents)
        };

        let mut found = BTreeSet::new();
        for candidate in candidates {
            let mut current = Some(candidate.clone());
            let mut visited = HashSet::new();
            while let Some(node) = current {
                if node == *key {
                    found.insert(candidate.clone());
                    break;
                }
                if !visited.insert(node.clone()) {
                    break;
                }
                current = match parents.get(&node) {
                    Some(parent) => parent.clone(),
                    None => {
                        let parent = self
                            .workspace
                            .persisted_node(&node)?
                            .and_then(|n| n.parent_key().cloned());
                        parents.insert(node, parent.clone());
                        parent
                    }
                };
            }
        }
        Ok(found)
    }

    /// Discard every pending edit.
    pub fn clear(&self) {
        *self.write_state() = SessionState::default();
        debug!(session = %self.id, "session cleared");
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    /// Persist every pending edit and publish the change set.
    ///
    /// All touched head records are locked in one batch (retried with
    /// backoff), each record is re-read under the lock and the session's
    /// edits are applied to it, and everything is committed in one write.
    /// On error nothing is written, the locks are released and the pending
    /// edits are kept. Returns `None` when there was nothing to save.
    pub fn save(&self) -> CacheResult<Option<Arc<ChangeSet>>> {
        let mut state = self.write_state();
        self.refresh_overlays(&mut state)?;
        state.changed.retain(|_, node| node.has_changes());
        if state.is_empty() {
            *state = SessionState::default();
            return Ok(None);
        }
        let scope: BTreeSet<NodeKey> = state
            .changed
            .keys()
            .chain(state.removed.keys())
            .cloned()
            .collect();
        self.persist(&mut state, scope).map(Some)
    }

    /// Persist only the edits to `key` and the nodes below it, plus the
    /// child lists of parents outside the subtree that record nodes
    /// created, moved or removed inside it.
    ///
    /// Fails with [`CacheError::InvalidOperation`] when such a parent has
    /// edits of its own, or when a saved child list refers to a node whose
    /// creation, move or removal would be left unsaved. Edits outside the
    /// scope stay pending.
    pub fn save_at_or_below(&self, key: &NodeKey) -> CacheResult<Option<Arc<ChangeSet>>> {
        let below = self.changed_node_keys_at_or_below(key)?;
        let mut state = self.write_state();
        self.refresh_overlays(&mut state)?;
        state.changed.retain(|_, node| node.has_changes());
        let mut scope: BTreeSet<NodeKey> = below
            .into_iter()
            .filter(|k| state.changed.contains_key(k) || state.removed.contains_key(k))
            .collect();
        if scope.is_empty() {
            if state.is_empty() {
                *state = SessionState::default();
            }
            return Ok(None);
        }
        close_scope(&state, &mut scope)?;
        self.persist(&mut state, scope).map(Some)
    }

    /// Write the edits of every node in `scope` in one locked transaction,
    /// then drop them from the session and publish them.
    fn persist(&self, state: &mut SessionState, scope: BTreeSet<NodeKey>) -> CacheResult<Arc<ChangeSet>> {
        let config = self.workspace.config();
        let translator = self.workspace.translator();
        let store = self.workspace.document_store();

        let keys: Vec<String> = scope.iter().map(NodeKey::to_string).collect();
        let mut txn = StoreTransaction::begin(&**store);
        let attempts = self.retry.acquire(&mut txn, &keys)?;

        let saved: Vec<(&NodeKey, &Arc<SessionNode>)> = scope
            .iter()
            .filter_map(|key| state.changed.get(key).map(|node| (key, node)))
            .collect();

        for &(key, node) in &saved {
            if node.is_new() && txn.get(key.as_str())?.is_some() {
                return Err(CacheError::NodeAlreadyExists(key.clone()));
            }
        }

        for &(key, node) in &saved {
            if node.is_new() {
                let parent = node.parent_key();
                txn.put(key.as_str(), new_node_document(key, parent, node.properties()));
                continue;
            }
            let doc = txn
                .edit(key.as_str(), false)?
                .ok_or_else(|| CacheError::NodeNotFound(key.clone()))?;
            for (name, value) in node.changed_properties() {
                record::set_property(doc, name, value.clone());
            }
            for name in node.removed_properties() {
                record::remove_property(doc, name);
            }
            if node.is_moved() {
                record::set_parent(doc, node.parent_key());
            }
        }

        let mut optimized = OptimizationResults::default();
        for &(key, node) in &saved {
            let changes = node.children_changes();
            if !changes.is_empty() {
                optimized += translator.update_children(
                    &mut txn,
                    key,
                    changes,
                    config.children.optimize_on_save,
                )?;
            }
        }

        let mut records_removed = 0;
        for key in scope.iter().filter(|key| state.removed.contains_key(*key)) {
            records_removed += translator.remove_node_records(&mut txn, key)?;
        }

        let written = txn.commit()?;

        for key in &scope {
            state.changed.remove(key);
            state.removed.remove(key);
            state.created.remove(key);
        }
        let (published, kept): (Vec<Change>, Vec<Change>) = std::mem::take(&mut state.log)
            .into_iter()
            .partition(|change| scope.contains(record_owner(change)));
        state.log = kept;
        if state.is_empty() {
            *state = SessionState::default();
        }
        let pending = state.changed.len() + state.removed.len();

        let change_set = Arc::new(ChangeSet::new(self.workspace.name(), published, scope));
        self.workspace.apply_changes(Arc::clone(&change_set));
        info!(
            session = %self.id,
            workspace = %self.workspace.name(),
            nodes = change_set.changed_keys.len(),
            records = written,
            records_removed,
            blocks_split = optimized.blocks_split,
            blocks_merged = optimized.blocks_merged,
            attempts,
            pending,
            "session saved"
        );
        Ok(change_set)
    }
}

/// The node whose record a logged change is written to.
fn record_owner(change: &Change) -> &NodeKey {
    match change {
        Change::NodeRenamed { parent, .. } => parent,
        other => other.node_key(),
    }
}

/// Whether the node is created, moved or removed in the session.
fn is_structural(state: &SessionState, key: &NodeKey) -> bool {
    state.removed.contains_key(key)
        || state
            .changed
            .get(key)
            .is_some_and(|node| node.is_new() || node.is_moved())
}

/// Grow a partial save to the parents whose child lists record the
/// structural edits inside it, and refuse it when anything saved would
/// refer to a structural edit left behind.
fn close_scope(state: &SessionState, scope: &mut BTreeSet<NodeKey>) -> CacheResult<()> {
    let mut parents = BTreeSet::new();
    for key in scope.iter() {
        if let Some(parent) = state.removed.get(key) {
            parents.extend(parent.clone());
        }
        if let Some(node) = state.changed.get(key) {
            if node.is_new() || node.is_moved() {
                parents.extend(node.parent_key().cloned());
            }
            if node.is_moved() {
                parents.extend(node.base_parent_key().cloned());
            }
        }
    }
    for parent in parents {
        if scope.contains(&parent) {
            continue;
        }
        let Some(node) = state.changed.get(&parent) else {
            continue;
        };
        if node.is_new()
            || node.is_moved()
            || !node.changed_properties().is_empty()
            || !node.removed_properties().is_empty()
        {
            return Err(CacheError::InvalidOperation(format!(
                "cannot save without the other pending changes to {parent}"
            )));
        }
        scope.insert(parent);
    }

    for key in scope.iter() {
        let Some(node) = state.changed.get(key) else {
            continue;
        };
        let changes = node.children_changes();
        let mentioned = changes
            .appended()
            .iter()
            .chain(changes.insertions_before().values().flatten())
            .map(ChildReference::key)
            .chain(changes.removals().iter());
        for child in mentioned {
            if !scope.contains(child) && is_structural(state, child) {
                return Err(CacheError::InvalidOperation(format!(
                    "the child list of {key} refers to unsaved changes to {child}"
                )));
            }
        }
    }
    Ok(())
}

impl NodeCache for SessionCache {
    fn root_key(&self) -> &NodeKey {
        self.workspace.root_key()
    }

    fn get_node(&self, key: &NodeKey) -> CacheResult<Option<CachedNode>> {
        let overlay = {
            let state = self.state.read().expect("lock poisoned");
            if state.removed.contains_key(key) {
                return Ok(None);
            }
            state.changed.get(key).cloned()
        };
        let Some(overlay) = overlay else {
            return self.workspace.get_node(key);
        };
        let mut current = Arc::clone(&overlay);
        self.refresh_base(&mut current)?;
        if !Arc::ptr_eq(&overlay, &current) {
            let mut state = self.write_state();
            if let Some(slot) = state.changed.get_mut(key) {
                // Keep edits made since the read.
                if Arc::ptr_eq(slot, &overlay) {
                    *slot = Arc::clone(&current);
                }
            }
        }
        Ok(Some(CachedNode::Mutable(current)))
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("lock poisoned");
        f.debug_struct("SessionCache")
            .field("id", &self.id)
            .field("workspace", &self.workspace.name())
            .field("changed", &state.changed.len())
            .field("removed", &state.removed.len())
            .finish()
    }
}

/// Editing handle on one node of a session.
pub struct MutableNode<'s> {
    session: &'s SessionCache,
    key: NodeKey,
}

impl MutableNode<'_> {
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn set_property(&self, name: &str, value: Value) -> CacheResult<()> {
        self.session.set_property(&self.key, name, value)
    }

    pub fn remove_property(&self, name: &str) -> CacheResult<bool> {
        self.session.remove_property(&self.key, name)
    }

    pub fn create_child(&self, name: &str, properties: Map<String, Value>) -> CacheResult<NodeKey> {
        self.session.create_child(&self.key, name, properties)
    }

    pub fn rename_child(&self, child: &NodeKey, name: &str) -> CacheResult<()> {
        self.session.rename_child(&self.key, child, name)
    }

    pub fn remove_child(&self, child: &NodeKey) -> CacheResult<()> {
        self.session.check_parent(&self.key, child)?;
        self.session.destroy(child)
    }

    pub fn reorder_child(&self, child: &NodeKey, before: Option<&NodeKey>) -> CacheResult<()> {
        self.session.reorder_child(&self.key, child, before)
    }

    /// The node as this session currently sees it.
    pub fn snapshot(&self) -> CacheResult<CachedNode> {
        self.session.require(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LockConfig, RepositoryConfig};
    use arbor_document::check_children;
    use arbor_store::{DocumentStore, InMemoryDocumentStore, LockOwner};
    use serde_json::json;
    use std::thread;

    fn config(max: usize, min: usize) -> RepositoryConfig {
        let mut config = RepositoryConfig::default();
        config.children.max_block_size = max;
        config.children.min_block_size = min;
        config.locking = LockConfig {
            max_attempts: 200,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        config
    }

    fn workspace_with(config: RepositoryConfig) -> (Arc<InMemoryDocumentStore>, Arc<WorkspaceCache>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let workspace = WorkspaceCache::open(store.clone(), Arc::new(config), "default").unwrap();
        (store, Arc::new(workspace))
    }

    fn workspace() -> (Arc<InMemoryDocumentStore>, Arc<WorkspaceCache>) {
        workspace_with(config(5, 2))
    }

    fn props(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn child_names(cache: &dyn NodeCache, key: &NodeKey) -> Vec<String> {
        cache
            .get_node(key)
            .unwrap()
            .unwrap()
            .children()
            .unwrap()
            .map(|c| c.unwrap().to_string())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Isolation
    // -----------------------------------------------------------------------

    #[test]
    fn edits_are_private_until_saved() {
        let (_store, ws) = workspace();
        let a = SessionCache::new(Arc::clone(&ws));
        let b = SessionCache::new(Arc::clone(&ws));
        let root = ws.root_key().clone();

        let child = a.create_child(&root, "docs", props(&[("title", json!("Docs"))])).unwrap();
        assert_eq!(child_names(&a, &root), vec!["docs"]);
        assert!(a.get_node(&child).unwrap().unwrap().is_mutable());
        assert!(b.get_node(&child).unwrap().is_none());
        assert!(child_names(&b, &root).is_empty());

        a.save().unwrap().unwrap();
        assert!(!a.has_changes());
        assert_eq!(child_names(&b, &root), vec!["docs"]);
        let seen = b.get_node(&child).unwrap().unwrap();
        assert!(!seen.is_mutable());
        assert_eq!(seen.property("title"), Some(&json!("Docs")));
        assert_eq!(seen.parent_key(), Some(&root));
    }

    #[test]
    fn clear_discards_pending_edits() {
        let (store, ws) = workspace();
        let session = SessionCache::new(Arc::clone(&ws));
        let root = ws.root_key().clone();
        session.create_child(&root, "tmp", Map::new()).unwrap();
        session.set_property(&root, "x", json!(1)).unwrap();
        assert!(session.has_changes());

        session.clear();
        assert!(!session.has_changes());
        assert!(child_names(&session, &root).is_empty());
        assert!(session.save().unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn snapshots_do_not_change_under_later_edits() {
        let (_store, ws) = workspace();
        let session = SessionCache::new(Arc::clone(&ws));
        let root = ws.root_key().clone();
        let handle = session.mutable(&root).unwrap();
        handle.set_property("v", json!(1)).unwrap();
        let before = handle.snapshot().unwrap();
        handle.set_property("v", json!(2)).unwrap();
        assert_eq!(before.property("v"), Some(&json!(1)));
        assert_eq!(handle.snapshot().unwrap().property("v"), Some(&json!(2)));
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    #[test]
    fn property_changes_are_logged() {
        let (_store, ws) = workspace();
        let session = SessionCache::new(Arc::clone(&ws));
        let root = ws.root_key().clone();
        let node = session.mutable(&root).unwrap();
        node.set_property("a", json!(1)).unwrap();
        node.set_property("a", json!(2)).unwrap();
        node.set_property("b", json!(1)).unwrap();
        assert!(node.remove_property("b").unwrap());
        assert!(!node.remove_property("b").unwrap());

        let set = session.save().unwrap().unwrap();
        let kinds: Vec<&str> = set
            .changes
            .iter()
            .map(|c| match c {
                Change::PropertyAdded { .. } => "added",
                Change::PropertyChanged { .. } => "changed",
                Change::PropertyRemoved { .. } => "removed",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["added", "changed", "added", "removed"]);
    }

    #[test]
    fn concurrent_property_saves_both_survive() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let setup = SessionCache::new(Arc::clone(&ws));
        let node = setup
            .create_child(&root, "n", props(&[("k1", json!("value1")), ("k2", json!(2))]))
            .unwrap();
        setup.save().unwrap();

        let handles: Vec<_> = [("k2", 3), ("k3", 3)]
            .into_iter()
            .map(|(name, value)| {
                let ws = Arc::clone(&ws);
                let node = node.clone();
                thread::spawn(move || {
                    let session = SessionCache::new(ws);
                    session.set_property(&node, name, json!(value)).unwrap();
                    session.save().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reader = SessionCache::new(Arc::clone(&ws));
        let props = reader.get_node(&node).unwrap().unwrap().properties();
        assert_eq!(props.len(), 3);
        assert_eq!(props["k1"], json!("value1"));
        assert_eq!(props["k2"], json!(3));
        assert_eq!(props["k3"], json!(3));
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    #[test]
    fn rename_is_visible_before_and_after_save() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));
        let child = session.create_child(&root, "old", Map::new()).unwrap();
        session.save().unwrap();

        session.rename_child(&root, &child, "new").unwrap();
        assert_eq!(child_names(&session, &root), vec!["new"]);
        let other = SessionCache::new(Arc::clone(&ws));
        assert_eq!(child_names(&other, &root), vec!["old"]);

        session.save().unwrap();
        assert_eq!(child_names(&other, &root), vec!["new"]);
    }

    #[test]
    fn rename_of_unknown_child_fails() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));
        let stranger = root.with_id("stranger");
        assert!(matches!(
            session.rename_child(&root, &stranger, "x"),
            Err(CacheError::NodeNotFound(_))
        ));
        let a = session.create_child(&root, "a", Map::new()).unwrap();
        let b = session.create_child(&a, "b", Map::new()).unwrap();
        assert!(matches!(
            session.rename_child(&root, &b, "x"),
            Err(CacheError::InvalidOperation(_))
        ));
    }

    #[test]
    fn same_names_become_siblings() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));
        for _ in 0..3 {
            session.create_child(&root, "item", Map::new()).unwrap();
        }
        session.save().unwrap();
        assert_eq!(child_names(&session, &root), vec!["item", "item[2]", "item[3]"]);
        let root_node = session.get_node(&root).unwrap().unwrap();
        assert_eq!(root_node.child("item", 3).unwrap().unwrap().sns_index(), 3);
    }

    #[test]
    fn reorder_across_blocks_keeps_relative_order() {
        let (store, ws) = workspace();
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));
        let keys: Vec<NodeKey> = (0..12)
            .map(|i| session.create_child(&root, &format!("c{i}"), Map::new()).unwrap())
            .collect();
        session.save().unwrap();
        assert!(check_children(&*store, root.as_str()).unwrap().block_count() > 1);

        session.reorder_child(&root, &keys[11], Some(&keys[1])).unwrap();
        session.reorder_child(&root, &keys[0], None).unwrap();
        session.save().unwrap();

        let mut expected: Vec<String> = vec!["c1".into()];
        expected.insert(0, "c11".into());
        expected.extend((2..11).map(|i| format!("c{i}")));
        expected.push("c0".into());
        let reader = SessionCache::new(Arc::clone(&ws));
        assert_eq!(child_names(&reader, &root), expected);
        assert_eq!(check_children(&*store, root.as_str()).unwrap().count, 12);
    }

    #[test]
    fn create_rejects_duplicate_keys() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));
        let key = root.with_id("fixed");
        session.create_child_with_key(&root, key.clone(), "a", Map::new()).unwrap();
        assert!(matches!(
            session.create_child_with_key(&root, key, "b", Map::new()),
            Err(CacheError::NodeAlreadyExists(_))
        ));
        assert!(session.create_child(&root, "", Map::new()).is_err());
    }

    #[test]
    fn save_refuses_key_created_by_another_session() {
        let (store, ws) = workspace();
        let root = ws.root_key().clone();
        let setup = SessionCache::new(Arc::clone(&ws));
        let p1 = setup.create_child(&root, "p1", Map::new()).unwrap();
        let p2 = setup.create_child(&root, "p2", Map::new()).unwrap();
        setup.save().unwrap();

        let fixed = root.with_id("fixed");
        let a = SessionCache::new(Arc::clone(&ws));
        let b = SessionCache::new(Arc::clone(&ws));
        a.create_child_with_key(&p1, fixed.clone(), "fixed", Map::new()).unwrap();
        b.create_child_with_key(&p2, fixed.clone(), "fixed", Map::new()).unwrap();
        a.save().unwrap().unwrap();

        assert!(matches!(b.save(), Err(CacheError::NodeAlreadyExists(k)) if k == fixed));
        assert!(b.has_changes());
        assert_eq!(store.locked_count(), 0);

        let reader = SessionCache::new(Arc::clone(&ws));
        assert_eq!(reader.get_node(&fixed).unwrap().unwrap().parent_key(), Some(&p1));
        assert_eq!(child_names(&reader, &p1), vec!["fixed"]);
        assert!(child_names(&reader, &p2).is_empty());
        assert_eq!(check_children(&*store, p2.as_str()).unwrap().count, 0);
    }

    // -----------------------------------------------------------------------
    // Move and destroy
    // -----------------------------------------------------------------------

    #[test]
    fn move_relinks_both_parents() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));
        let a = session.create_child(&root, "a", Map::new()).unwrap();
        let b = session.create_child(&root, "b", Map::new()).unwrap();
        let x = session.create_child(&a, "x", Map::new()).unwrap();
        session.save().unwrap();

        session.move_node(&x, &b, "y").unwrap();
        assert!(matches!(session.move_node(&b, &x, "loop"), Err(CacheError::InvalidOperation(_))));
        assert!(matches!(session.move_node(&root, &a, "r"), Err(CacheError::InvalidOperation(_))));
        session.save().unwrap();

        let reader = SessionCache::new(Arc::clone(&ws));
        assert!(child_names(&reader, &a).is_empty());
        assert_eq!(child_names(&reader, &b), vec!["y"]);
        assert_eq!(reader.get_node(&x).unwrap().unwrap().parent_key(), Some(&b));
    }

    #[test]
    fn destroy_removes_subtree_and_all_blocks() {
        let (store, ws) = workspace();
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));
        let dir = session.create_child(&root, "dir", Map::new()).unwrap();
        for i in 0..14 {
            session.create_child(&dir, &format!("f{i}"), Map::new()).unwrap();
        }
        session.save().unwrap();
        assert!(check_children(&*store, dir.as_str()).unwrap().block_count() > 1);
        assert!(store.len() > 16);

        session.destroy(&dir).unwrap();
        assert!(session.is_destroyed(&dir));
        assert!(session.get_node(&dir).unwrap().is_none());
        assert_eq!(session.changed_node_keys().len(), 16);
        session.save().unwrap();

        assert_eq!(store.keys().unwrap().into_iter().collect::<Vec<_>>(), vec![root.to_string()]);
        assert!(child_names(&session, &root).is_empty());
        assert!(matches!(session.destroy(&root), Err(CacheError::InvalidOperation(_))));
    }

    #[test]
    fn destroying_created_node_leaves_no_trace() {
        let (store, ws) = workspace();
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));
        let a = session.create_child(&root, "a", Map::new()).unwrap();
        session.create_child(&a, "b", Map::new()).unwrap();
        session.mutable(&root).unwrap().remove_child(&a).unwrap();

        assert!(session.has_changes());
        assert!(session.save().unwrap().is_none());
        assert!(!session.has_changes());
        assert_eq!(store.len(), 1);
        assert!(child_names(&session, &root).is_empty());
    }

    #[test]
    fn overlay_follows_chain_reshaped_by_another_save() {
        let (store, ws) = workspace();
        let root = ws.root_key().clone();
        let setup = SessionCache::new(Arc::clone(&ws));
        let keys: Vec<NodeKey> = (0..12)
            .map(|i| setup.create_child(&root, &format!("c{i}"), Map::new()).unwrap())
            .collect();
        setup.save().unwrap();
        assert!(check_children(&*store, root.as_str()).unwrap().block_count() > 1);

        let editor = SessionCache::new(Arc::clone(&ws));
        editor.set_property(&root, "title", json!("home")).unwrap();

        let pruner = SessionCache::new(Arc::clone(&ws));
        for key in &keys[3..] {
            pruner.destroy(key).unwrap();
        }
        pruner.save().unwrap();

        assert_eq!(child_names(&editor, &root), vec!["c0", "c1", "c2"]);
        editor.save().unwrap().unwrap();

        let reader = SessionCache::new(Arc::clone(&ws));
        assert_eq!(child_names(&reader, &root), vec!["c0", "c1", "c2"]);
        let root_node = reader.get_node(&root).unwrap().unwrap();
        assert_eq!(root_node.property("title"), Some(&json!("home")));
        assert_eq!(check_children(&*store, root.as_str()).unwrap().count, 3);
    }

    #[test]
    fn edits_after_another_save_apply_to_the_new_head() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let editor = SessionCache::new(Arc::clone(&ws));
        editor.set_property(&root, "a", json!(1)).unwrap();

        let other = SessionCache::new(Arc::clone(&ws));
        let child = other.create_child(&root, "x", Map::new()).unwrap();
        other.set_property(&root, "b", json!(2)).unwrap();
        other.save().unwrap();

        editor.rename_child(&root, &child, "y").unwrap();
        let node = editor.get_node(&root).unwrap().unwrap();
        assert_eq!(node.property("a"), Some(&json!(1)));
        assert_eq!(node.property("b"), Some(&json!(2)));
        assert_eq!(child_names(&editor, &root), vec!["y"]);
    }

    // -----------------------------------------------------------------------
    // Changed keys
    // -----------------------------------------------------------------------

    #[test]
    fn changed_keys_at_or_below() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let setup = SessionCache::new(Arc::clone(&ws));
        let a = setup.create_child(&root, "a", Map::new()).unwrap();
        let b = setup.create_child(&root, "b", Map::new()).unwrap();
        let a1 = setup.create_child(&a, "a1", Map::new()).unwrap();
        setup.save().unwrap();

        let session = SessionCache::new(Arc::clone(&ws));
        session.set_property(&a1, "p", json!(true)).unwrap();
        session.set_property(&b, "p", json!(true)).unwrap();
        assert_eq!(session.changed_node_keys(), [a1.clone(), b.clone()].into_iter().collect());
        assert_eq!(
            session.changed_node_keys_at_or_below(&a).unwrap(),
            [a1.clone()].into_iter().collect()
        );
        assert_eq!(session.changed_node_keys_at_or_below(&root).unwrap().len(), 2);
        assert!(session.changed_node_keys_at_or_below(&a1.with_id("none")).unwrap().is_empty());
    }

    #[test]
    fn changed_keys_stop_at_parent_cycles() {
        let (store, ws) = workspace();
        let root = ws.root_key().clone();
        let setup = SessionCache::new(Arc::clone(&ws));
        let a = setup.create_child(&root, "a", Map::new()).unwrap();
        let b = setup.create_child(&root, "b", Map::new()).unwrap();
        setup.save().unwrap();
        for (node, parent) in [(&a, &b), (&b, &a)] {
            let mut doc = store.get(node.as_str()).unwrap().unwrap();
            record::set_parent(&mut doc, Some(parent));
            store.put(node.as_str(), doc).unwrap();
        }
        ws.clear();

        let session = SessionCache::new(Arc::clone(&ws));
        session.set_property(&a, "p", json!(1)).unwrap();
        assert!(session.changed_node_keys_at_or_below(&root).unwrap().is_empty());
        assert_eq!(
            session.changed_node_keys_at_or_below(&b).unwrap(),
            [a.clone()].into_iter().collect()
        );
    }

    // -----------------------------------------------------------------------
    // Partial save
    // -----------------------------------------------------------------------

    #[test]
    fn save_at_or_below_keeps_other_edits_pending() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let setup = SessionCache::new(Arc::clone(&ws));
        let a = setup.create_child(&root, "a", Map::new()).unwrap();
        let b = setup.create_child(&root, "b", Map::new()).unwrap();
        let a1 = setup.create_child(&a, "a1", Map::new()).unwrap();
        setup.save().unwrap();

        let session = SessionCache::new(Arc::clone(&ws));
        session.set_property(&a1, "p", json!(1)).unwrap();
        session.set_property(&b, "p", json!(1)).unwrap();
        let a2 = session.create_child(&a, "a2", Map::new()).unwrap();

        let set = session.save_at_or_below(&a).unwrap().unwrap();
        assert!(set.touches(&a) && set.touches(&a1) && set.touches(&a2));
        assert!(!set.touches(&b));
        assert_eq!(set.len(), 2);
        assert_eq!(session.changed_node_keys(), [b.clone()].into_iter().collect());

        let reader = SessionCache::new(Arc::clone(&ws));
        assert_eq!(child_names(&reader, &a), vec!["a1", "a2"]);
        assert_eq!(reader.get_node(&a1).unwrap().unwrap().property("p"), Some(&json!(1)));
        assert!(reader.get_node(&b).unwrap().unwrap().property("p").is_none());

        assert!(session.save_at_or_below(&a).unwrap().is_none());
        let rest = session.save().unwrap().unwrap();
        assert!(matches!(&rest.changes[..], [Change::PropertyAdded { key, .. }] if *key == b));
        assert_eq!(reader.get_node(&b).unwrap().unwrap().property("p"), Some(&json!(1)));
    }

    #[test]
    fn save_at_or_below_includes_the_parent_child_list() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));
        let x = session.create_child(&root, "x", Map::new()).unwrap();

        let set = session.save_at_or_below(&x).unwrap().unwrap();
        assert!(set.touches(&root));
        assert!(!session.has_changes());
        let reader = SessionCache::new(Arc::clone(&ws));
        assert_eq!(child_names(&reader, &root), vec!["x"]);
    }

    #[test]
    fn save_at_or_below_refuses_to_split_dependent_edits() {
        let (store, ws) = workspace();
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));

        // The root's child list also records y.
        let x = session.create_child(&root, "x", Map::new()).unwrap();
        session.create_child(&root, "y", Map::new()).unwrap();
        assert!(matches!(session.save_at_or_below(&x), Err(CacheError::InvalidOperation(_))));
        assert!(session.has_changes());
        assert_eq!(store.len(), 1);
        assert_eq!(store.locked_count(), 0);

        // The root has a property edit of its own.
        session.clear();
        let z = session.create_child(&root, "z", Map::new()).unwrap();
        session.set_property(&root, "t", json!(1)).unwrap();
        assert!(matches!(session.save_at_or_below(&z), Err(CacheError::InvalidOperation(_))));
        assert_eq!(store.len(), 1);

        session.save().unwrap().unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn save_at_or_below_a_move_target() {
        let (_store, ws) = workspace();
        let root = ws.root_key().clone();
        let setup = SessionCache::new(Arc::clone(&ws));
        let a = setup.create_child(&root, "a", Map::new()).unwrap();
        let b = setup.create_child(&root, "b", Map::new()).unwrap();
        let m = setup.create_child(&a, "m", Map::new()).unwrap();
        setup.save().unwrap();

        let session = SessionCache::new(Arc::clone(&ws));
        session.move_node(&m, &b, "m").unwrap();
        // The source alone would drop m without relinking it.
        assert!(matches!(session.save_at_or_below(&a), Err(CacheError::InvalidOperation(_))));

        let set = session.save_at_or_below(&b).unwrap().unwrap();
        assert!(set.touches(&a) && set.touches(&b) && set.touches(&m));
        assert!(!session.has_changes());

        let reader = SessionCache::new(Arc::clone(&ws));
        assert!(child_names(&reader, &a).is_empty());
        assert_eq!(child_names(&reader, &b), vec!["m"]);
        assert_eq!(reader.get_node(&m).unwrap().unwrap().parent_key(), Some(&b));
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    #[test]
    fn one_change_set_per_save() {
        let (_store, ws) = workspace();
        let mut rx = ws.subscribe();
        let session = SessionCache::new(Arc::clone(&ws));
        let root = ws.root_key().clone();
        let child = session.create_child(&root, "c", Map::new()).unwrap();
        let saved = session.save().unwrap().unwrap();
        assert!(session.save().unwrap().is_none());

        let received = rx.try_recv().unwrap();
        assert_eq!(received.id, saved.id);
        assert!(received.touches(&root));
        assert!(received.touches(&child));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn concurrent_appends_are_serialized() {
        let (store, ws) = workspace_with(config(8, 3));
        let root = ws.root_key().clone();
        let threads = 6;
        let per_thread = 10;
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let ws = Arc::clone(&ws);
                let root = root.clone();
                thread::spawn(move || {
                    let session = SessionCache::new(ws);
                    for i in 0..per_thread {
                        session.create_child(&root, &format!("t{t}-{i}"), Map::new()).unwrap();
                        session.save().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let report = check_children(&*store, root.as_str()).unwrap();
        assert_eq!(report.count, threads * per_thread);
        assert!(report.blocks.iter().all(|(_, n)| *n <= 8));
        let reader = SessionCache::new(Arc::clone(&ws));
        assert_eq!(reader.get_all_node_keys().count(), threads * per_thread + 1);
    }

    #[test]
    fn lock_timeout_keeps_pending_edits() {
        let mut cfg = config(5, 2);
        cfg.locking.max_attempts = 2;
        let (store, ws) = workspace_with(cfg);
        let root = ws.root_key().clone();
        let session = SessionCache::new(Arc::clone(&ws));
        session.set_property(&root, "x", json!(1)).unwrap();

        let holder = LockOwner::new();
        assert!(store.lock_documents(&holder, &[root.to_string()]).unwrap());
        assert!(matches!(session.save(), Err(CacheError::LockTimeout { attempts: 2, .. })));
        assert!(session.has_changes());
        assert_eq!(store.locked_count(), 1);

        store.unlock_documents(&holder, &[root.to_string()]).unwrap();
        session.save().unwrap().unwrap();
        let reader = SessionCache::new(Arc::clone(&ws));
        assert_eq!(reader.get_node(&root).unwrap().unwrap().property("x"), Some(&json!(1)));
    }

    #[test]
    fn save_of_node_removed_elsewhere_fails_cleanly() {
        let (store, ws) = workspace();
        let root = ws.root_key().clone();
        let setup = SessionCache::new(Arc::clone(&ws));
        let a = setup.create_child(&root, "a", Map::new()).unwrap();
        setup.save().unwrap();

        let editor = SessionCache::new(Arc::clone(&ws));
        editor.set_property(&a, "p", json!(1)).unwrap();
        let remover = SessionCache::new(Arc::clone(&ws));
        remover.destroy(&a).unwrap();
        remover.save().unwrap();

        assert!(matches!(editor.save(), Err(CacheError::NodeNotFound(k)) if k == a));
        assert!(editor.has_changes());
        assert_eq!(store.locked_count(), 0);
        assert!(!store.contains(a.as_str()).unwrap());
    }
}
