//! Lookup-map construction and parent/child nesting used by the join engine.

use crate::{get_path, scalar_key, Document};
use indexmap::IndexMap;
use serde_json::Value;

/// Map each row's `field` value to the row itself, last writer wins.
///
/// Only meaningful on fields known unique per row (the parent side of a
/// `many_to_one` relationship). Rows without the field key under `"null"`.
pub fn index_by(rows: &[Document], field: &str) -> IndexMap<String, Document> {
    let mut map = IndexMap::new();
    for row in rows {
        let key = scalar_key(get_path(row, field).unwrap_or(&Value::Null));
        map.insert(key, row.clone());
    }
    map
}

/// Group rows by their `field` value, preserving row order within a group.
pub fn group_by(rows: &[Document], field: &str) -> IndexMap<String, Vec<Document>> {
    let mut map: IndexMap<String, Vec<Document>> = IndexMap::new();
    for row in rows {
        let key = scalar_key(get_path(row, field).unwrap_or(&Value::Null));
        map.entry(key).or_default().push(row.clone());
    }
    map
}

/// A child lookup selected by relationship cardinality: a single row per key
/// or an ordered group of rows per key.
#[derive(Debug, Clone)]
pub enum ChildLookup {
    One(IndexMap<String, Document>),
    Many(IndexMap<String, Vec<Document>>),
}

impl ChildLookup {
    fn get(&self, key: &str) -> Option<Value> {
        match self {
            Self::One(map) => map.get(key).map(|row| Value::Object(row.clone())),
            Self::Many(map) => map
                .get(key)
                .map(|rows| Value::Array(rows.iter().cloned().map(Value::Object).collect())),
        }
    }
}

/// Attach children to each parent row at `store_key`, looked up by the
/// parent's `join_key` value. Parents with no matching children are left
/// without the key.
pub fn nest_children(
    parents: &mut [Document],
    children: &ChildLookup,
    join_key: &str,
    store_key: &str,
) {
    for parent in parents.iter_mut() {
        let key = scalar_key(get_path(parent, join_key).unwrap_or(&Value::Null));
        if let Some(value) = children.get(&key) {
            parent.insert(store_key.to_string(), value);
        }
    }
}
