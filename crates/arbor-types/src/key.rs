use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Number of characters in the source component of a [`NodeKey`].
pub const SOURCE_KEY_LENGTH: usize = 7;

/// Number of characters in the workspace component of a [`NodeKey`].
pub const WORKSPACE_KEY_LENGTH: usize = 7;

const PREFIX_LENGTH: usize = SOURCE_KEY_LENGTH + WORKSPACE_KEY_LENGTH;

/// Stable identifier of a node within a `(source, workspace)` pair.
///
/// The textual form is the concatenation `source + workspace + identifier`,
/// where the first two components have fixed widths. That string is used
/// verbatim as the record-store key of the node's head record, so a key is
/// stored in its textual form and the components are sliced out on demand.
///
/// Keys are never reused: generated identifiers are UUID v7 strings.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeKey {
    key: String,
}

impl NodeKey {
    /// Build a key from its three components.
    ///
    /// `source` and `workspace` must be exactly [`SOURCE_KEY_LENGTH`] and
    /// [`WORKSPACE_KEY_LENGTH`] ASCII characters; `identifier` must be
    /// non-empty.
    pub fn new(source: &str, workspace: &str, identifier: &str) -> Result<Self, TypeError> {
        check_component(source, SOURCE_KEY_LENGTH)?;
        check_component(workspace, WORKSPACE_KEY_LENGTH)?;
        if identifier.is_empty() {
            return Err(TypeError::InvalidNodeKey {
                key: format!("{source}{workspace}"),
                reason: "identifier is empty".into(),
            });
        }
        Ok(Self {
            key: format!("{source}{workspace}{identifier}"),
        })
    }

    /// Parse the textual form of a key.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if s.len() <= PREFIX_LENGTH {
            return Err(TypeError::InvalidNodeKey {
                key: s.to_string(),
                reason: format!("expected more than {PREFIX_LENGTH} characters"),
            });
        }
        if !s.is_char_boundary(PREFIX_LENGTH) || !s[..PREFIX_LENGTH].is_ascii() {
            return Err(TypeError::InvalidNodeKey {
                key: s.to_string(),
                reason: "source and workspace components must be ASCII".into(),
            });
        }
        Ok(Self { key: s.to_string() })
    }

    /// Derive the fixed-width component key for a source or workspace name.
    ///
    /// The first 7 hex characters of the BLAKE3 hash of the name, so the same
    /// name always maps to the same component.
    pub fn key_for(name: &str) -> String {
        let hash = blake3::hash(name.as_bytes());
        hex::encode(hash.as_bytes())[..SOURCE_KEY_LENGTH].to_string()
    }

    /// A new, unique identifier (UUID v7, so keys sort by creation time).
    pub fn generate_identifier() -> String {
        uuid::Uuid::now_v7().to_string()
    }

    /// The 7-character source component.
    pub fn source_key(&self) -> &str {
        &self.key[..SOURCE_KEY_LENGTH]
    }

    /// The 7-character workspace component.
    pub fn workspace_key(&self) -> &str {
        &self.key[SOURCE_KEY_LENGTH..PREFIX_LENGTH]
    }

    /// The identifier component.
    pub fn identifier(&self) -> &str {
        &self.key[PREFIX_LENGTH..]
    }

    /// The full textual form (the record-store key).
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// A sibling key in the same source and workspace.
    pub fn with_id(&self, identifier: &str) -> Self {
        Self {
            key: format!("{}{}", &self.key[..PREFIX_LENGTH], identifier),
        }
    }

    /// A sibling key with a freshly generated identifier.
    pub fn with_random_id(&self) -> Self {
        self.with_id(&Self::generate_identifier())
    }

    /// Whether both keys belong to the same source and workspace.
    pub fn same_workspace(&self, other: &NodeKey) -> bool {
        self.key[..PREFIX_LENGTH] == other.key[..PREFIX_LENGTH]
    }

    /// Short identifier for log lines (first 8 characters of the identifier).
    pub fn short_id(&self) -> &str {
        let id = self.identifier();
        match id.char_indices().nth(8) {
            Some((idx, _)) => &id[..idx],
            None => id,
        }
    }
}

fn check_component(component: &str, expected: usize) -> Result<(), TypeError> {
    if component.len() != expected || !component.is_ascii() {
        return Err(TypeError::InvalidComponent {
            component: component.to_string(),
            expected,
        });
    }
    Ok(())
}

impl FromStr for NodeKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeKey {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NodeKey> for String {
    fn from(key: NodeKey) -> Self {
        key.key
    }
}

impl AsRef<str> for NodeKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", self.key)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}
