//! Foundation types for Arbor.
//!
//! This crate provides the identity and structural types shared by every
//! other Arbor crate: the stable [`NodeKey`] that names a node (and its
//! persisted record), and the [`ChildReference`] entries that make up a
//! node's ordered child list.
//!
//! # Key Types
//!
//! - [`NodeKey`] -- `(source, workspace, identifier)` triple whose textual
//!   form is the record-store key of the node's head record
//! - [`ChildReference`] -- `(key, name, same-name-sibling index)` entry in a
//!   parent's child list

pub mod child;
pub mod error;
pub mod key;

pub use child::ChildReference;
pub use error::TypeError;
pub use key::{NodeKey, SOURCE_KEY_LENGTH, WORKSPACE_KEY_LENGTH};
