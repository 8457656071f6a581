use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::key::NodeKey;

/// One entry in a parent's ordered child list.
///
/// The same-name-sibling (SNS) index is 1-based and disambiguates children
/// that share a name under one parent. It is a positional property: it is
/// derived from the number of earlier siblings with the same name and is not
/// persisted.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildReference {
    key: NodeKey,
    name: String,
    sns_index: usize,
}

impl ChildReference {
    /// A reference with SNS index 1.
    pub fn new(key: NodeKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            sns_index: 1,
        }
    }

    /// A reference with a non-empty name, checked.
    pub fn named(key: NodeKey, name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TypeError::EmptyName);
        }
        Ok(Self::new(key, name))
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sns_index(&self) -> usize {
        self.sns_index
    }

    /// The same child under a different name and SNS index.
    pub fn with_name(&self, name: impl Into<String>, sns_index: usize) -> Self {
        Self {
            key: self.key.clone(),
            name: name.into(),
            sns_index,
        }
    }

    /// The same child with a recomputed SNS index.
    pub fn with_sns_index(mut self, sns_index: usize) -> Self {
        self.sns_index = sns_index;
        self
    }

    /// `(name, sns, key)` view used when comparing child lists.
    pub fn as_tuple(&self) -> (&str, usize, &NodeKey) {
        (&self.name, self.sns_index, &self.key)
    }
}

impl fmt::Debug for ChildReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] ({})", self.name, self.sns_index, self.key)
    }
}

impl fmt::Display for ChildReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sns_index == 1 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}[{}]", self.name, self.sns_index)
        }
    }
}
