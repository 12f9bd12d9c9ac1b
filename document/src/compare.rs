//! A total ordering over document values.
//!
//! Numbers compare numerically regardless of integer/float representation.
//! Values of different types order by a fixed type rank (null < bool <
//! number < string < array < object); arrays and objects compare
//! lexicographically over their items and sorted entries. The ordering is
//! arbitrary across types but total and stable, which is what the range
//! operators and partition pruning need.

use itertools::{EitherOrBoth, Itertools};
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Evaluate the deep ordering of `lhs` and `rhs`.
pub fn compare(lhs: &Value, rhs: &Value) -> Ordering {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(lhs), Value::Bool(rhs)) => lhs.cmp(rhs),
        (Value::Number(lhs), Value::Number(rhs)) => compare_number(lhs, rhs),
        (Value::String(lhs), Value::String(rhs)) => lhs.cmp(rhs),
        (Value::Array(lhs), Value::Array(rhs)) => lhs
            .iter()
            .zip_longest(rhs.iter())
            .map(|eob| match eob {
                EitherOrBoth::Both(lhs, rhs) => compare(lhs, rhs),
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
        (Value::Object(lhs), Value::Object(rhs)) => lhs
            .iter()
            .zip_longest(rhs.iter())
            .map(|eob| match eob {
                EitherOrBoth::Both((lk, lv), (rk, rv)) => match lk.cmp(rk) {
                    Ordering::Equal => compare(lv, rv),
                    unequal => unequal,
                },
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),

        // Differing types: fixed rank ordering.
        (lhs, rhs) => type_rank(lhs).cmp(&type_rank(rhs)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_number(lhs: &Number, rhs: &Number) -> Ordering {
    if let (Some(lhs), Some(rhs)) = (lhs.as_i64(), rhs.as_i64()) {
        return lhs.cmp(&rhs);
    }
    if let (Some(lhs), Some(rhs)) = (lhs.as_u64(), rhs.as_u64()) {
        return lhs.cmp(&rhs);
    }

    // Mixed representations fall back to f64. JSON numbers are never NaN, so
    // partial_cmp cannot fail for values parsed from documents.
    let lhs = lhs.as_f64().unwrap_or(f64::MAX);
    let rhs = rhs.as_f64().unwrap_or(f64::MAX);
    lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn is_lt(lhs: Value, rhs: Value) {
        assert_eq!(compare(&lhs, &rhs), Ordering::Less, "{lhs} < {rhs}");
        assert_eq!(compare(&rhs, &lhs), Ordering::Greater, "{rhs} > {lhs}");
    }

    fn is_eq(lhs: Value, rhs: Value) {
        assert_eq!(compare(&lhs, &rhs), Ordering::Equal, "{lhs} == {rhs}");
        assert_eq!(compare(&rhs, &lhs), Ordering::Equal, "{rhs} == {lhs}");
    }

    #[test]
    fn number_ordering_is_numeric_across_representations() {
        is_eq(json!(10), json!(10));
        is_eq(json!(20), json!(20.0));
        is_eq(json!(-20), json!(-20.0));
        is_lt(json!(10), json!(20));
        is_lt(json!(-20), json!(-10));
        is_lt(json!(-1), json!(1));
        is_lt(json!(10), json!(10.5));
        is_lt(json!(10.5), json!(11));
    }

    #[test]
    fn string_ordering() {
        is_eq(json!("foo"), json!("foo"));
        is_lt(json!(""), json!("foo"));
        is_lt(json!("foo"), json!("fp"));
    }

    #[test]
    fn array_ordering_is_lexicographic() {
        is_eq(json!([1, 2]), json!([1, 2]));
        is_lt(json!([]), json!([1]));
        is_lt(json!([1, 2]), json!([1, 2, 3]));
        is_lt(json!([1, 2, 3]), json!([1, 3]));
    }

    #[test]
    fn object_ordering_is_lexicographic_over_entries() {
        is_eq(json!({"a": 1, "b": 2}), json!({"a": 1, "b": 2}));
        is_lt(json!({}), json!({"a": 1}));
        is_lt(json!({"a": 1}), json!({"a": 2}));
        is_lt(json!({"a": 1}), json!({"b": 0}));
        is_lt(json!({"a": 1}), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn cross_type_rank_is_total() {
        is_lt(Value::Null, json!(false));
        is_lt(json!(true), json!(0));
        is_lt(json!(99), json!("0"));
        is_lt(json!("z"), json!([]));
        is_lt(json!([9]), json!({}));
    }
}
