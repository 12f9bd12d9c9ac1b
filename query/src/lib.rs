//! The query grammar: MongoDB-style clause maps normalized into a typed
//! predicate, evaluated per row by the table scan.
//!
//! A query is a JSON object mapping a field path to either a bare literal
//! (sugar for `$eq`) or an operator map. Clauses on a single field are ANDed,
//! as are clauses across fields:
//!
//! ```text
//! { "country": "US", "score": { "$gte": 10, "$lt": 50 } }
//! ```

use document::{compare, get_path, Document};
use indexmap::IndexMap;
use serde_json::Value;
use snafu::{OptionExt, Snafu};
use std::cmp::Ordering;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unsupported query operator: {}", op))]
    UnsupportedOperator { op: String },

    #[snafu(display("$between argument must be a two-element array, got {}", arg))]
    MalformedBetween { arg: Value },

    #[snafu(display("{} argument must be an array, got {}", op, arg))]
    MalformedMembership { op: String, arg: Value },

    #[snafu(display("Query must be a JSON object, got {}", input))]
    NotAnObject { input: Value },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single normalized clause applied to one scalar field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Between(Value, Value),
}

impl Clause {
    /// Parse one `$op: argument` pair.
    pub fn parse(op: &str, arg: &Value) -> Result<Self> {
        let membership = |arg: &Value| -> Result<Vec<Value>> {
            arg.as_array().cloned().context(MalformedMembershipSnafu {
                op: op.to_string(),
                arg: arg.clone(),
            })
        };

        Ok(match op {
            "$eq" => Self::Eq(arg.clone()),
            "$ne" => Self::Ne(arg.clone()),
            "$gt" => Self::Gt(arg.clone()),
            "$gte" => Self::Gte(arg.clone()),
            "$lt" => Self::Lt(arg.clone()),
            "$lte" => Self::Lte(arg.clone()),
            "$in" => Self::In(membership(arg)?),
            "$nin" => Self::Nin(membership(arg)?),
            "$between" => match arg.as_array().map(Vec::as_slice) {
                Some([lo, hi]) => Self::Between(lo.clone(), hi.clone()),
                _ => return MalformedBetweenSnafu { arg: arg.clone() }.fail(),
            },
            _ => {
                return UnsupportedOperatorSnafu { op: op.to_string() }.fail();
            }
        })
    }

    /// Evaluate this clause against a field value.
    ///
    /// Equality and membership treat an absent field as JSON null; the
    /// ordered operators never match an absent field.
    pub fn matches(&self, field: Option<&Value>) -> bool {
        let present = field.unwrap_or(&Value::Null);
        let equals = |a: &Value, b: &Value| compare(a, b) == Ordering::Equal;

        match self {
            Self::Eq(arg) => equals(present, arg),
            Self::Ne(arg) => !equals(present, arg),
            Self::In(args) => args.iter().any(|arg| equals(present, arg)),
            Self::Nin(args) => !args.iter().any(|arg| equals(present, arg)),
            Self::Gt(arg) => field.map_or(false, |v| compare(v, arg) == Ordering::Greater),
            Self::Gte(arg) => field.map_or(false, |v| compare(v, arg) != Ordering::Less),
            Self::Lt(arg) => field.map_or(false, |v| compare(v, arg) == Ordering::Less),
            Self::Lte(arg) => field.map_or(false, |v| compare(v, arg) != Ordering::Greater),
            Self::Between(lo, hi) => field.map_or(false, |v| {
                compare(v, lo) != Ordering::Less && compare(v, hi) != Ordering::Greater
            }),
        }
    }
}

/// A normalized query: field path to the ANDed clauses on that field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    clauses: IndexMap<String, Vec<Clause>>,
}

impl Query {
    /// Normalize a clause map. Bare literals become `$eq`; operator maps are
    /// parsed clause by clause.
    pub fn parse(input: &Value) -> Result<Self> {
        let object = input.as_object().context(NotAnObjectSnafu {
            input: input.clone(),
        })?;

        let mut clauses = IndexMap::new();
        for (field, clause_value) in object {
            let parsed = match clause_value {
                Value::Object(ops) => ops
                    .iter()
                    .map(|(op, arg)| Clause::parse(op, arg))
                    .collect::<Result<Vec<_>>>()?,
                literal => vec![Clause::Eq(literal.clone())],
            };
            clauses.insert(field.clone(), parsed);
        }
        Ok(Self { clauses })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The number of fields carrying clauses.
    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    /// The clauses declared on `field`, if any.
    pub fn get(&self, field: &str) -> Option<&[Clause]> {
        self.clauses.get(field).map(Vec::as_slice)
    }

    /// Remove and return the clauses on `field`.
    pub fn remove(&mut self, field: &str) -> Option<Vec<Clause>> {
        self.clauses.shift_remove(field)
    }

    /// Iterate fields and their clauses.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &[Clause])> {
        self.clauses.iter().map(|(field, c)| (field, c.as_slice()))
    }

    /// True iff every clause on every field holds for `row`.
    pub fn matches(&self, row: &Document) -> bool {
        self.clauses.iter().all(|(field, clauses)| {
            let value = get_path(row, field);
            clauses.iter().all(|clause| clause.matches(value))
        })
    }

    /// A copy of this query with the clauses on `field` replaced by a single
    /// `$in` over `values`. The join engine composes child queries this way:
    /// the parent-id restriction wins over any addon clause on the join key.
    pub fn with_in_clause(&self, field: &str, values: Vec<Value>) -> Self {
        let mut merged = self.clone();
        merged.clauses.insert(field.to_string(), vec![Clause::In(values)]);
        merged
    }
}

impl TryFrom<Value> for Query {
    type Error = Error;

    fn try_from(input: Value) -> Result<Self> {
        Self::parse(&input)
    }
}
