//! Dynamic, schema-less document values and the small set of operations the
//! storage and join engines perform on them.
//!
//! A document is a JSON object (`serde_json::Map<String, Value>`). Fields are
//! addressed with dot-delimited paths; traversal through a missing segment or
//! a non-object intermediate yields `None` rather than an error.
//!
//! Deep copy is structural `clone()` and deep equality is `PartialEq`: the
//! owned value tree cannot alias or cycle, so no memoization is required.

use serde_json::Value;

pub mod compare;
pub mod lookup;
pub mod path;

pub use compare::compare;
pub use lookup::{group_by, index_by, nest_children, ChildLookup};
pub use path::{get_path, get_path_owned, remove_path, set_path};

/// A single row: an arbitrary mapping from field name to value.
pub type Document = serde_json::Map<String, Value>;

/// Render a scalar value as a map key.
///
/// Strings render bare; every other value renders as its JSON text, so the
/// number `1` keys as `"1"` and `null` as `"null"`. This is the key form used
/// for primary-key values inside partition images and for join-key lookups.
pub fn scalar_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Order-preserving deduplication by value equality.
pub fn distinct(values: impl IntoIterator<Item = Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_key_strings_render_bare() {
        assert_eq!(scalar_key(&json!("US")), "US");
        assert_eq!(scalar_key(&json!(1)), "1");
        assert_eq!(scalar_key(&json!(2.5)), "2.5");
        assert_eq!(scalar_key(&json!(true)), "true");
        assert_eq!(scalar_key(&Value::Null), "null");
    }

    #[test]
    fn distinct_preserves_first_occurrence_order() {
        let values = vec![json!(3), json!(1), json!(3), json!("a"), json!(1)];
        assert_eq!(distinct(values), vec![json!(3), json!(1), json!("a")]);
    }

    #[test]
    fn distinct_compares_structurally() {
        let values = vec![json!({"a": 1}), json!({"a": 1}), json!({"a": 2})];
        assert_eq!(distinct(values), vec![json!({"a": 1}), json!({"a": 2})]);
    }
}
