//! Dot-delimited path traversal over document values.

use crate::Document;
use serde_json::Value;

/// Resolve `path` against `doc`, descending through nested objects.
///
/// Returns `None` when any segment is missing or an intermediate is not an
/// object. An empty trailing segment (`"a."`) resolves like any other missing
/// key.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;

    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Like [`get_path`] but clones the resolved value.
pub fn get_path_owned(doc: &Document, path: &str) -> Option<Value> {
    get_path(doc, path).cloned()
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// A non-object intermediate along the path is overwritten with a fresh
/// object; the final segment is always overwritten.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, intermediate) = match segments.split_last() {
        Some(parts) => parts,
        None => return,
    };

    let mut current = doc;
    for segment in intermediate {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if !entry.is_object() {
            *entry = Value::Object(Document::new());
        }
        current = match entry {
            Value::Object(next) => next,
            // The entry was replaced with an object just above.
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}

/// Remove the value at `path`, returning it when present.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, intermediate) = segments.split_last()?;

    let mut current = doc;
    for segment in intermediate {
        current = current.get_mut(*segment)?.as_object_mut()?;
    }
    current.remove(*last)
}
