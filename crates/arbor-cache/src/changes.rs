use std::collections::BTreeSet;

use arbor_types::NodeKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One structural or property change recorded by a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    NodeCreated {
        key: NodeKey,
        parent: NodeKey,
    },
    NodeRemoved {
        key: NodeKey,
        parent: Option<NodeKey>,
    },
    NodeMoved {
        key: NodeKey,
        from: Option<NodeKey>,
        to: NodeKey,
    },
    NodeRenamed {
        parent: NodeKey,
        key: NodeKey,
        name: String,
    },
    ChildrenReordered {
        parent: NodeKey,
    },
    PropertyAdded {
        key: NodeKey,
        name: String,
        value: Value,
    },
    PropertyChanged {
        key: NodeKey,
        name: String,
        value: Value,
    },
    PropertyRemoved {
        key: NodeKey,
        name: String,
    },
}

impl Change {
    /// The node this change is about.
    pub fn node_key(&self) -> &NodeKey {
        match self {
            Change::NodeCreated { key, .. }
            | Change::NodeRemoved { key, .. }
            | Change::NodeMoved { key, .. }
            | Change::NodeRenamed { key, .. }
            | Change::PropertyAdded { key, .. }
            | Change::PropertyChanged { key, .. }
            | Change::PropertyRemoved { key, .. } => key,
            Change::ChildrenReordered { parent } => parent,
        }
    }
}

/// Everything one successful save wrote, published to workspace
/// subscribers after the commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: Uuid,
    pub workspace: String,
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<Change>,
    /// Head records written or removed; these are evicted from the
    /// workspace cache.
    pub changed_keys: BTreeSet<NodeKey>,
}

impl ChangeSet {
    pub fn new(workspace: impl Into<String>, changes: Vec<Change>, changed_keys: BTreeSet<NodeKey>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workspace: workspace.into(),
            timestamp: Utc::now(),
            changes,
            changed_keys,
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.changed_keys.is_empty()
    }

    /// Whether the node's head record was written or removed.
    pub fn touches(&self, key: &NodeKey) -> bool {
        self.changed_keys.contains(key)
    }
}
