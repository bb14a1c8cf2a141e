//! Changes and their operational-transform translation.
//!
//! The executor describes what it committed as [`Change`]s. The realtime
//! layer turns each one into wire-level ops on a path: `set` replaces the
//! object at the path, `insert` inserts into the list at the path, and
//! `delete` removes `count` list items starting at `index`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One component of a document path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// A committed change to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Change {
    Set {
        path: Vec<String>,
        value: Value,
    },
    Insert {
        path: Vec<String>,
        index: usize,
        value: Value,
    },
    Delete {
        path: Vec<String>,
        index: usize,
        count: usize,
    },
}

impl Change {
    pub fn set(path: impl IntoIterator<Item = impl Into<String>>, value: Value) -> Self {
        Change::Set {
            path: path.into_iter().map(Into::into).collect(),
            value,
        }
    }
}

/// A wire-level op. `path` includes the list index for list ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OtOp {
    ObjectReplace { path: Vec<PathSegment>, value: Value },
    ListInsert { path: Vec<PathSegment>, value: Value },
    ListDelete { path: Vec<PathSegment> },
}

impl OtOp {
    pub fn path(&self) -> &[PathSegment] {
        match self {
            OtOp::ObjectReplace { path, .. }
            | OtOp::ListInsert { path, .. }
            | OtOp::ListDelete { path } => path,
        }
    }
}

fn keyed(path: &[String]) -> Vec<PathSegment> {
    path.iter().cloned().map(PathSegment::Key).collect()
}

fn indexed(path: &[String], index: usize) -> Vec<PathSegment> {
    let mut p = keyed(path);
    p.push(PathSegment::Index(index));
    p
}

/// Translate one change into ops.
///
/// Deletes are issued from the highest index down so that removing one item
/// never shifts the index of an item still to be removed. A delete running
/// past `usize::MAX` is clamped there.
pub fn translate(change: &Change) -> Vec<OtOp> {
    match change {
        Change::Set { path, value } => vec![OtOp::ObjectReplace {
            path: keyed(path),
            value: value.clone(),
        }],
        Change::Insert { path, index, value } => vec![OtOp::ListInsert {
            path: indexed(path, *index),
            value: value.clone(),
        }],
        Change::Delete { path, index, count } => (*index..index.saturating_add(*count))
            .rev()
            .map(|i| OtOp::ListDelete {
                path: indexed(path, i),
            })
            .collect(),
    }
}

/// Channel carrying every document of a collection.
pub fn collection_channel(collection: &str) -> String {
    collection.to_string()
}

/// Channel carrying one document.
pub fn document_channel(collection: &str, document_id: &str) -> String {
    format!("{collection}.{document_id}")
}

/// Collection name for the records of a table.
pub fn record_collection(table_id: &crate::ids::TableId) -> String {
    format!("rec_{table_id}")
}
