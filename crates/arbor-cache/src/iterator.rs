use arbor_types::NodeKey;

use crate::error::{CacheError, CacheResult};
use crate::node::{CachedNode, ChildReferences, NodeRead};

/// A source of nodes addressable by key.
pub trait NodeCache {
    /// Key of the workspace root.
    fn root_key(&self) -> &NodeKey;

    /// The node under `key`, or `None` if it does not exist.
    fn get_node(&self, key: &NodeKey) -> CacheResult<Option<CachedNode>>;

    /// Keys of the direct children of `key`, in order.
    fn child_keys(&self, key: &NodeKey) -> CacheResult<Vec<NodeKey>> {
        let node = self
            .get_node(key)?
            .ok_or_else(|| CacheError::NodeNotFound(key.clone()))?;
        let mut keys = Vec::new();
        for child in node.raw_children()? {
            keys.push(child?.key().clone());
        }
        Ok(keys)
    }

    /// Pre-order traversal of the whole workspace.
    fn get_all_node_keys(&self) -> NodeCacheIterator<'_, Self>
    where
        Self: Sized,
    {
        NodeCacheIterator::new(self, self.root_key().clone())
    }

    /// Pre-order traversal of the subtree rooted at `key`.
    fn get_all_node_keys_at_and_below(&self, key: &NodeKey) -> NodeCacheIterator<'_, Self>
    where
        Self: Sized,
    {
        NodeCacheIterator::new(self, key.clone())
    }
}

/// Depth-first, pre-order traversal over a [`NodeCache`].
///
/// Yields the start key, then each child's subtree in child order. Memory
/// is bounded by the tree depth: the only state is one lazy child cursor per
/// level on the current path. A node that cannot be loaded, or a broken
/// children chain, is yielded as an error and ends the traversal.
pub struct NodeCacheIterator<'c, C: NodeCache + ?Sized> {
    cache: &'c C,
    start: Option<NodeKey>,
    stack: Vec<ChildReferences>,
    buffered: Option<CacheResult<NodeKey>>,
    finished: bool,
}

impl<'c, C: NodeCache + ?Sized> NodeCacheIterator<'c, C> {
    pub fn new(cache: &'c C, start: NodeKey) -> Self {
        Self {
            cache,
            start: Some(start),
            stack: Vec::new(),
            buffered: None,
            finished: false,
        }
    }

    /// Whether another item (key or error) remains. May load the next node.
    pub fn has_next(&mut self) -> bool {
        if self.buffered.is_none() {
            self.buffered = self.advance();
        }
        self.buffered.is_some()
    }

    /// The next key; [`CacheError::NoSuchElement`] once exhausted.
    pub fn next_key(&mut self) -> CacheResult<NodeKey> {
        self.next().unwrap_or(Err(CacheError::NoSuchElement))
    }

    /// Current depth of the traversal below the start node.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn advance(&mut self) -> Option<CacheResult<NodeKey>> {
        if self.finished {
            return None;
        }
        if let Some(start) = self.start.take() {
            return Some(self.visit(start));
        }
        loop {
            let cursor = self.stack.last_mut()?;
            match cursor.next() {
                Some(Ok(child)) => return Some(self.visit(child.key().clone())),
                Some(Err(e)) => return Some(self.fail(e.into())),
                None => {
                    self.stack.pop();
                }
            }
        }
    }

    /// Load `key` and descend into its children.
    fn visit(&mut self, key: NodeKey) -> CacheResult<NodeKey> {
        let node = match self.cache.get_node(&key) {
            Ok(Some(node)) => node,
            Ok(None) => return self.fail(CacheError::NodeNotFound(key)),
            Err(e) => return self.fail(e),
        };
        match node.raw_children() {
            Ok(children) => {
                self.stack.push(children);
                Ok(key)
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail<T>(&mut self, error: CacheError) -> CacheResult<T> {
        self.finished = true;
        self.stack.clear();
        Err(error)
    }
}

impl<C: NodeCache + ?Sized> Iterator for NodeCacheIterator<'_, C> {
    type Item = CacheResult<NodeKey>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.buffered.take() {
            Some(item) => Some(item),
            None => self.advance(),
        }
    }
}
