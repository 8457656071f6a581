use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use arbor_document::constants::KEY;
use arbor_document::record::node_key;
use arbor_document::{check_children, BlockSizes, DocumentError, DocumentOptimizer, OptimizationResults};
use arbor_store::{DocumentStore, StoreTransaction};
use arbor_types::NodeKey;
use tracing::{info, warn};

use crate::changes::ChangeSet;
use crate::config::RepositoryConfig;
use crate::error::CacheResult;
use crate::iterator::NodeCache;
use crate::retry::LockRetry;
use crate::session::SessionCache;
use crate::workspace::WorkspaceCache;

/// Outcome of [`Repository::check_children`].
#[derive(Debug, Default)]
pub struct IntegrityReport {
    /// Head records checked.
    pub nodes: usize,
    /// Blocks in healthy chains, heads included.
    pub blocks: usize,
    /// Children in healthy chains.
    pub children: usize,
    /// `(head key, fault)` for every broken chain.
    pub faults: Vec<(String, DocumentError)>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Entry point over one record store: opens workspaces and sessions and
/// runs maintenance passes.
pub struct Repository {
    config: Arc<RepositoryConfig>,
    store: Arc<dyn DocumentStore>,
    workspaces: RwLock<HashMap<String, Arc<WorkspaceCache>>>,
}

impl Repository {
    pub fn new(store: Arc<dyn DocumentStore>, config: RepositoryConfig) -> CacheResult<Self> {
        config.validate()?;
        info!(name = %config.name, "repository opened");
        Ok(Self {
            config: Arc::new(config),
            store,
            workspaces: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Arc<RepositoryConfig> {
        &self.config
    }

    pub fn document_store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// The cache of workspace `name`, opened on first use.
    pub fn workspace(&self, name: &str) -> CacheResult<Arc<WorkspaceCache>> {
        if let Some(cache) = self.workspaces.read().expect("lock poisoned").get(name) {
            return Ok(Arc::clone(cache));
        }
        let opened = Arc::new(WorkspaceCache::open(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            name,
        )?);
        let mut workspaces = self.workspaces.write().expect("lock poisoned");
        Ok(Arc::clone(workspaces.entry(name.to_string()).or_insert(opened)))
    }

    /// Names of the workspaces opened so far.
    pub fn workspace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workspaces
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// A new session on workspace `name`.
    pub fn login(&self, name: &str) -> CacheResult<SessionCache> {
        Ok(SessionCache::new(self.workspace(name)?))
    }

    /// A new session on the default workspace.
    pub fn login_default(&self) -> CacheResult<SessionCache> {
        self.login(&self.config.default_workspace)
    }

    /// Head record keys: every record carrying its own node key.
    fn head_keys(&self) -> CacheResult<Vec<String>> {
        let mut heads = Vec::new();
        for key in self.store.keys()? {
            if let Some(doc) = self.store.get(&key)? {
                if doc.contains_key(KEY) {
                    heads.push(key);
                }
            }
        }
        Ok(heads)
    }

    /// Run one optimization pass over every node's children chain.
    ///
    /// Each node is locked and optimized in its own transaction, so the
    /// pass can run next to live sessions. `sizes` overrides the configured
    /// block limits. Every node whose blocks were rewritten is evicted from
    /// its open workspace cache, and announced to its subscribers, right
    /// after its commit.
    pub fn optimize_children(&self, sizes: Option<BlockSizes>) -> CacheResult<OptimizationResults> {
        let sizes = match sizes {
            Some(sizes) => sizes,
            None => self.config.children.block_sizes()?,
        };
        let optimizer = DocumentOptimizer::new(sizes);
        let retry = LockRetry::new(&self.config.locking);
        let mut results = OptimizationResults::default();
        for head in self.head_keys()? {
            let mut txn = StoreTransaction::begin(&*self.store);
            retry.acquire(&mut txn, std::slice::from_ref(&head))?;
            let Some(doc) = txn.get(&head)? else {
                continue;
            };
            let key = node_key(&doc)?;
            let node_results = optimizer.optimize_children_blocks(&mut txn, &key)?;
            let reshaped = node_results.changed();
            results += node_results;
            txn.commit()?;
            if reshaped {
                self.publish_reshaped(&key);
            }
        }
        info!(
            nodes = results.nodes_visited,
            split = results.blocks_split,
            merged = results.blocks_merged,
            rebalanced = results.blocks_rebalanced,
            "children optimization finished"
        );
        Ok(results)
    }

    /// Evict `key` from the cache of its workspace, if open, and publish a
    /// change set naming it.
    fn publish_reshaped(&self, key: &NodeKey) {
        let workspaces = self.workspaces.read().expect("lock poisoned");
        for workspace in workspaces.values() {
            if workspace.root_key().same_workspace(key) {
                let changed_keys = BTreeSet::from([key.clone()]);
                let changes = ChangeSet::new(workspace.name(), Vec::new(), changed_keys);
                workspace.apply_changes(Arc::new(changes));
            }
        }
    }

    /// Check the children chain of every node.
    pub fn check_children(&self) -> CacheResult<IntegrityReport> {
        let mut report = IntegrityReport::default();
        for head in self.head_keys()? {
            report.nodes += 1;
            match check_children(&*self.store, &head) {
                Ok(chain) => {
                    report.blocks += chain.block_count();
                    report.children += chain.count;
                }
                Err(DocumentError::Store(e)) => return Err(e.into()),
                Err(fault) => {
                    warn!(key = %head, error = %fault, "children chain is broken");
                    report.faults.push((head, fault));
                }
            }
        }
        info!(
            nodes = report.nodes,
            blocks = report.blocks,
            faults = report.faults.len(),
            "children check finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.config.name)
            .field("workspaces", &self.workspace_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRead;
    use arbor_document::record::ChildrenInfo;
    use arbor_store::{FileDocumentStore, InMemoryDocumentStore};
    use serde_json::Map;

    fn small_blocks() -> RepositoryConfig {
        let mut config = RepositoryConfig::default();
        config.children.max_block_size = 5;
        config.children.min_block_size = 2;
        config
    }

    #[test]
    fn workspaces_are_opened_once() {
        let repo = Repository::new(Arc::new(InMemoryDocumentStore::new()), RepositoryConfig::default()).unwrap();
        let a = repo.workspace("default").unwrap();
        let b = repo.workspace("default").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        repo.workspace("other").unwrap();
        assert_eq!(repo.workspace_names(), vec!["default", "other"]);
        let session = repo.login_default().unwrap();
        assert!(Arc::ptr_eq(session.workspace(), &a));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = RepositoryConfig::default();
        config.children.min_block_size = 5000;
        assert!(Repository::new(Arc::new(InMemoryDocumentStore::new()), config).is_err());
    }

    #[test]
    fn optimize_reshapes_chains_to_new_limits() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let mut config = small_blocks();
        config.children.optimize_on_save = false;
        let repo = Repository::new(store.clone(), config).unwrap();
        let session = repo.login("default").unwrap();
        let root = session.root_key().clone();
        for i in 0..20 {
            session.create_child(&root, &format!("c{i}"), Map::new()).unwrap();
        }
        session.save().unwrap();
        // Without optimization on save everything sits in the head.
        assert_eq!(check_children(&*store, root.as_str()).unwrap().block_count(), 1);

        let results = repo.optimize_children(None).unwrap();
        assert!(results.blocks_split > 0);
        let chain = check_children(&*store, root.as_str()).unwrap();
        assert!(chain.block_count() > 1);
        assert!(chain.blocks.iter().all(|(_, n)| *n <= 5));
        assert_eq!(chain.count, 20);

        // Reads see the new shape.
        let reader = repo.login("default").unwrap();
        assert_eq!(reader.get_all_node_keys().count(), 21);

        let again = repo.optimize_children(Some(BlockSizes::new(50, 10).unwrap())).unwrap();
        assert!(again.blocks_merged > 0);
        assert_eq!(check_children(&*store, root.as_str()).unwrap().block_count(), 1);
    }

    #[test]
    fn optimize_evicts_and_announces_each_reshaped_node() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let mut config = small_blocks();
        config.children.optimize_on_save = false;
        let repo = Repository::new(store.clone(), config).unwrap();
        let session = repo.login("default").unwrap();
        let root = session.root_key().clone();
        let dir = session.create_child(&root, "dir", Map::new()).unwrap();
        for i in 0..12 {
            session.create_child(&dir, &format!("f{i}"), Map::new()).unwrap();
        }
        session.save().unwrap();

        let ws = repo.workspace("default").unwrap();
        ws.get_node(&dir).unwrap();
        ws.get_node(&root).unwrap();
        assert!(ws.is_cached(&dir));
        let mut rx = ws.subscribe();
        let other = repo.workspace("other").unwrap();
        let mut other_rx = other.subscribe();

        repo.optimize_children(None).unwrap();
        assert!(!ws.is_cached(&dir));
        // Nothing to split under the root.
        assert!(ws.is_cached(&root));

        let fresh = ws.get_node(&dir).unwrap().unwrap();
        let names: Vec<String> = fresh
            .children()
            .unwrap()
            .map(|c| c.unwrap().name().to_string())
            .collect();
        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "f0");
        assert_eq!(names[11], "f11");
        assert!(check_children(&*store, dir.as_str()).unwrap().block_count() > 1);

        let announced = rx.try_recv().unwrap();
        assert_eq!(announced.workspace, "default");
        assert!(announced.touches(&dir));
        assert!(announced.changes.is_empty());
        assert!(rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn check_reports_broken_chains() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let repo = Repository::new(store.clone(), small_blocks()).unwrap();
        let session = repo.login("default").unwrap();
        let root = session.root_key().clone();
        let dir = session.create_child(&root, "dir", Map::new()).unwrap();
        for i in 0..12 {
            session.create_child(&dir, &format!("f{i}"), Map::new()).unwrap();
        }
        session.save().unwrap();

        let healthy = repo.check_children().unwrap();
        assert!(healthy.is_healthy());
        assert_eq!(healthy.nodes, 14);
        assert_eq!(healthy.children, 13);

        let mut head = store.get(dir.as_str()).unwrap().unwrap();
        let info = ChildrenInfo::read(dir.as_str(), &head).unwrap();
        store.remove(&info.next_block.unwrap()).unwrap();
        let mut info = ChildrenInfo::read(dir.as_str(), &head).unwrap();
        info.count = info.count.map(|c| c + 1);
        info.write_to(&mut head);
        store.put(dir.as_str(), head).unwrap();

        let broken = repo.check_children().unwrap();
        assert_eq!(broken.faults.len(), 1);
        assert_eq!(broken.faults[0].0, dir.to_string());
        assert!(matches!(broken.faults[0].1, DocumentError::MissingBlock { .. }));
    }

    #[test]
    fn repository_over_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = {
            let store = Arc::new(FileDocumentStore::open(dir.path()).unwrap());
            let repo = Repository::new(store, RepositoryConfig::default()).unwrap();
            let session = repo.login_default().unwrap();
            let root = session.root_key().clone();
            let key = session.create_child(&root, "kept", Map::new()).unwrap();
            session.save().unwrap();
            key
        };
        let store = Arc::new(FileDocumentStore::open(dir.path()).unwrap());
        let repo = Repository::new(store, RepositoryConfig::default()).unwrap();
        let session = repo.login_default().unwrap();
        assert!(session.get_node(&key).unwrap().is_some());
        assert!(repo.check_children().unwrap().is_healthy());
    }
}
