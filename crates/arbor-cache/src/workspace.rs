use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_document::record::new_node_document;
use arbor_document::DocumentTranslator;
use arbor_store::{DocumentStore, StoreTransaction};
use arbor_types::NodeKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Map;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::changes::ChangeSet;
use crate::config::RepositoryConfig;
use crate::error::CacheResult;
use crate::iterator::NodeCache;
use crate::node::{CachedNode, NodeRead, PersistedNode};
use crate::retry::LockRetry;

/// Receiver of change sets published by saves in one workspace.
pub type ChangeStream = broadcast::Receiver<Arc<ChangeSet>>;

/// The shared, persisted view of one workspace.
///
/// Head records are parsed on first access and kept until a save changes
/// them. Reads never hold a map lock while reading the store; a read that
/// races with a save's eviction is returned to its caller but not cached.
pub struct WorkspaceCache {
    name: String,
    root_key: NodeKey,
    translator: DocumentTranslator,
    config: Arc<RepositoryConfig>,
    nodes: DashMap<NodeKey, Arc<PersistedNode>>,
    /// Bumped before every eviction.
    generation: AtomicU64,
    events: broadcast::Sender<Arc<ChangeSet>>,
}

impl WorkspaceCache {
    /// Open the workspace `name`, creating its root record if missing.
    pub fn open(store: Arc<dyn DocumentStore>, config: Arc<RepositoryConfig>, name: &str) -> CacheResult<Self> {
        config.validate()?;
        let root_key = NodeKey::new(&NodeKey::key_for(&config.name), &NodeKey::key_for(name), "root")?;
        let translator = DocumentTranslator::new(store, config.children.block_sizes()?);
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let cache = Self {
            name: name.to_string(),
            root_key,
            translator,
            config,
            nodes: DashMap::new(),
            generation: AtomicU64::new(0),
            events,
        };
        cache.ensure_root()?;
        info!(workspace = %cache.name, root = %cache.root_key, "workspace opened");
        Ok(cache)
    }

    fn ensure_root(&self) -> CacheResult<()> {
        let store = self.translator.store();
        if store.contains(self.root_key.as_str())? {
            return Ok(());
        }
        let mut txn = StoreTransaction::begin(&**store);
        LockRetry::new(&self.config.locking).acquire(&mut txn, &[self.root_key.to_string()])?;
        if txn.get(self.root_key.as_str())?.is_none() {
            txn.put(self.root_key.as_str(), new_node_document(&self.root_key, None, Map::new()));
            debug!(workspace = %self.name, "root record created");
        }
        txn.commit()?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Arc<RepositoryConfig> {
        &self.config
    }

    pub fn document_store(&self) -> &Arc<dyn DocumentStore> {
        self.translator.store()
    }

    pub fn translator(&self) -> &DocumentTranslator {
        &self.translator
    }

    /// The persisted node under `key`, loading and caching it on a miss.
    pub fn persisted_node(&self, key: &NodeKey) -> CacheResult<Option<Arc<PersistedNode>>> {
        if let Some(node) = self.nodes.get(key) {
            return Ok(Some(Arc::clone(node.value())));
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let Some(document) = self.translator.get(key)? else {
            return Ok(None);
        };
        let node = Arc::new(PersistedNode::new(
            Arc::clone(self.translator.store()),
            key.clone(),
            document,
        )?);
        match self.nodes.entry(key.clone()) {
            Entry::Occupied(existing) => Ok(Some(Arc::clone(existing.get()))),
            Entry::Vacant(slot) => {
                if self.generation.load(Ordering::SeqCst) == generation {
                    slot.insert(Arc::clone(&node));
                    debug!(key = %key, "node cached");
                }
                Ok(Some(node))
            }
        }
    }

    /// Whether `key` is currently held in memory.
    pub fn is_cached(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn cached_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn put_node(&self, node: Arc<PersistedNode>) {
        self.nodes.insert(node.key().clone(), node);
    }

    pub fn remove_node(&self, key: &NodeKey) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.nodes.remove(key).is_some()
    }

    /// Evict every node a committed save touched, then publish the change
    /// set to subscribers.
    pub fn apply_changes(&self, changes: Arc<ChangeSet>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        for key in &changes.changed_keys {
            self.nodes.remove(key);
        }
        // No subscribers is not an error.
        let receivers = self.events.send(Arc::clone(&changes)).unwrap_or(0);
        debug!(
            workspace = %self.name,
            keys = changes.changed_keys.len(),
            receivers,
            "change set applied"
        );
    }

    /// Receive every change set applied after this call.
    pub fn subscribe(&self) -> ChangeStream {
        self.events.subscribe()
    }

    /// Drop every cached node.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.nodes.clear();
        debug!(workspace = %self.name, "workspace cache cleared");
    }
}

impl NodeCache for WorkspaceCache {
    fn root_key(&self) -> &NodeKey {
        &self.root_key
    }

    fn get_node(&self, key: &NodeKey) -> CacheResult<Option<CachedNode>> {
        Ok(self.persisted_node(key)?.map(CachedNode::Immutable))
    }
}

impl std::fmt::Debug for WorkspaceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCache")
            .field("name", &self.name)
            .field("root_key", &self.root_key)
            .field("cached", &self.nodes.len())
            .finish()
    }
}
