//! Field access for node records and children blocks.
//!
//! A head record looks like:
//!
//! ```text
//! { "key": "...", "parent": "...",
//!   "properties": { <name>: <value>, ... },
//!   "children": [ {"key": "...", "name": "..."}, ... ],
//!   "childrenInfo": { "count": N, "nextBlock": "...", "lastBlock": "...", "blockSize": n } }
//! ```
//!
//! A satellite block holds only `children` and a `childrenInfo` with
//! `blockSize` and an optional `nextBlock`.

use arbor_store::Document;
use arbor_types::{ChildReference, NodeKey};
use serde_json::{Map, Value};

use crate::constants::{
    BLOCK_SIZE, CHILDREN, CHILDREN_INFO, COUNT, KEY, LAST_BLOCK, NAME, NEXT_BLOCK, PARENT,
    PROPERTIES,
};
use crate::error::{DocumentError, DocumentResult};

/// The `childrenInfo` object of one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChildrenInfo {
    /// Total children across the chain; only present on the head.
    pub count: Option<usize>,
    pub next_block: Option<String>,
    /// Only present on the head of a multi-block chain.
    pub last_block: Option<String>,
    /// Present on every block once the chain has more than one block.
    pub block_size: Option<usize>,
}

impl ChildrenInfo {
    /// Read the metadata of the block stored under `key`.
    ///
    /// A missing `childrenInfo` object reads as the empty default.
    pub fn read(key: &str, doc: &Document) -> DocumentResult<Self> {
        let Some(value) = doc.get(CHILDREN_INFO) else {
            return Ok(Self::default());
        };
        let info = value
            .as_object()
            .ok_or_else(|| DocumentError::corrupt(key, "childrenInfo is not an object"))?;
        Ok(Self {
            count: optional_usize(key, info, COUNT)?,
            next_block: optional_string(key, info, NEXT_BLOCK)?,
            last_block: optional_string(key, info, LAST_BLOCK)?,
            block_size: optional_usize(key, info, BLOCK_SIZE)?,
        })
    }

    /// Replace the block's `childrenInfo` with this value.
    pub fn write_to(&self, doc: &mut Document) {
        let mut info = Map::new();
        if let Some(count) = self.count {
            info.insert(COUNT.into(), count.into());
        }
        if let Some(next) = &self.next_block {
            info.insert(NEXT_BLOCK.into(), Value::String(next.clone()));
        }
        if let Some(last) = &self.last_block {
            info.insert(LAST_BLOCK.into(), Value::String(last.clone()));
        }
        if let Some(size) = self.block_size {
            info.insert(BLOCK_SIZE.into(), size.into());
        }
        doc.insert(CHILDREN_INFO.into(), Value::Object(info));
    }

    /// Total child count recorded on a head block.
    pub fn total(&self) -> usize {
        self.count.unwrap_or(0)
    }
}

fn optional_usize(key: &str, info: &Map<String, Value>, field: &str) -> DocumentResult<Option<usize>> {
    match info.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| DocumentError::corrupt(key, format!("{field} is not a non-negative integer"))),
    }
}

fn optional_string(key: &str, info: &Map<String, Value>, field: &str) -> DocumentResult<Option<String>> {
    match info.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(DocumentError::corrupt(key, format!("{field} is not a string"))),
    }
}

// ---------------------------------------------------------------------------
// Child entries
// ---------------------------------------------------------------------------

/// Decode one raw child entry. The SNS index of the result is always 1; it
/// is positional and derived while iterating a whole child list.
pub fn child_reference_from(block: &str, entry: &Value) -> DocumentResult<ChildReference> {
    let object = entry
        .as_object()
        .ok_or_else(|| DocumentError::corrupt(block, "child entry is not an object"))?;
    let key = object
        .get(KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| DocumentError::corrupt(block, "child entry has no key"))?;
    let name = object
        .get(NAME)
        .and_then(Value::as_str)
        .ok_or_else(|| DocumentError::corrupt(block, format!("child {key} has no name")))?;
    let key = NodeKey::parse(key).map_err(|e| DocumentError::corrupt(block, e.to_string()))?;
    Ok(ChildReference::new(key, name))
}

/// Encode a child reference as a raw entry.
pub fn to_child_entry(child: &ChildReference) -> Value {
    let mut entry = Map::new();
    entry.insert(KEY.into(), Value::String(child.key().to_string()));
    entry.insert(NAME.into(), Value::String(child.name().to_string()));
    Value::Object(entry)
}

/// The raw child entries held by one block.
pub fn children_entries<'d>(block: &str, doc: &'d Document) -> DocumentResult<&'d [Value]> {
    match doc.get(CHILDREN) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(entries)) => Ok(entries),
        Some(_) => Err(DocumentError::corrupt(block, "children is not an array")),
    }
}

/// Remove and return a block's entries, leaving it empty.
pub(crate) fn take_children(block: &str, doc: &mut Document) -> DocumentResult<Vec<Value>> {
    match doc.remove(CHILDREN) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(entries)) => Ok(entries),
        Some(_) => Err(DocumentError::corrupt(block, "children is not an array")),
    }
}

pub(crate) fn set_children(doc: &mut Document, entries: Vec<Value>) {
    doc.insert(CHILDREN.into(), Value::Array(entries));
}

/// Decoded children held inline in a head record.
pub fn head_children(key: &str, doc: &Document) -> DocumentResult<Vec<ChildReference>> {
    children_entries(key, doc)?
        .iter()
        .map(|entry| child_reference_from(key, entry))
        .collect()
}

// ---------------------------------------------------------------------------
// Identity and properties
// ---------------------------------------------------------------------------

/// A new head record with no children.
pub fn new_node_document(key: &NodeKey, parent: Option<&NodeKey>, properties: Map<String, Value>) -> Document {
    let mut doc = Document::new();
    set_key(&mut doc, key);
    set_parent(&mut doc, parent);
    doc.insert(PROPERTIES.into(), Value::Object(properties));
    set_children(&mut doc, Vec::new());
    ChildrenInfo {
        count: Some(0),
        ..ChildrenInfo::default()
    }
    .write_to(&mut doc);
    doc
}

pub fn node_key(doc: &Document) -> DocumentResult<NodeKey> {
    let key = doc
        .get(KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| DocumentError::corrupt("<unknown>", "record has no key"))?;
    NodeKey::parse(key).map_err(|e| DocumentError::corrupt(key, e.to_string()))
}

pub fn set_key(doc: &mut Document, key: &NodeKey) {
    doc.insert(KEY.into(), Value::String(key.to_string()));
}

/// The parent's key, or `None` for the root.
pub fn parent_key(key: &str, doc: &Document) -> DocumentResult<Option<NodeKey>> {
    match doc.get(PARENT) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(parent)) => NodeKey::parse(parent)
            .map(Some)
            .map_err(|e| DocumentError::corrupt(key, e.to_string())),
        Some(_) => Err(DocumentError::corrupt(key, "parent is not a string")),
    }
}

pub fn set_parent(doc: &mut Document, parent: Option<&NodeKey>) {
    match parent {
        Some(parent) => {
            doc.insert(PARENT.into(), Value::String(parent.to_string()));
        }
        None => {
            doc.remove(PARENT);
        }
    }
}

/// The record's properties; `None` when the field is absent or malformed.
pub fn properties(doc: &Document) -> Option<&Map<String, Value>> {
    doc.get(PROPERTIES).and_then(Value::as_object)
}

pub fn property<'d>(doc: &'d Document, name: &str) -> Option<&'d Value> {
    properties(doc).and_then(|props| props.get(name))
}

/// Set one property, returning the previous value.
pub fn set_property(doc: &mut Document, name: &str, value: Value) -> Option<Value> {
    properties_mut(doc).insert(name.to_string(), value)
}

/// Remove one property, returning the previous value.
pub fn remove_property(doc: &mut Document, name: &str) -> Option<Value> {
    match doc.get_mut(PROPERTIES) {
        Some(Value::Object(props)) => props.remove(name),
        _ => None,
    }
}

fn properties_mut(doc: &mut Document) -> &mut Map<String, Value> {
    let slot = doc
        .entry(PROPERTIES)
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(props) => props,
        _ => unreachable!("properties slot was just set to an object"),
    }
}
