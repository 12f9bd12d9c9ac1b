//! The join engine: walk declared connections from a chosen root table,
//! query each visited table, and nest children under their parents.
//!
//! Child queries are composed by push-down: the child's addon (if any) plus
//! an `$in` restriction over the distinct join-key values observed on the
//! parent side, so a child scan is bounded by the parents actually selected.

use crate::database::Database;
use crate::results::Results;
use crate::table::JoinType;
use document::{
    distinct, get_path_owned, group_by, index_by, nest_children, ChildLookup, Document,
};
use indexmap::IndexMap;
use query::Query;
use serde_json::Value;
use snafu::{OptionExt, Snafu};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unknown table in join: {}", table_name))]
    UnknownTable { table_name: String },

    #[snafu(display(
        "Multiple tables without parent found ({}) and no query addon to disambiguate",
        candidates.join(", ")
    ))]
    AmbiguousJoinRoot { candidates: Vec<String> },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Per-table join state: the (nested) rows plus lookup maps over every
/// foreign key and the primary key. The maps are built after children have
/// been nested, so tables further up the traversal observe nested
/// descendants.
#[derive(Debug, Default)]
pub struct TableJoinData {
    pub data: Vec<Document>,
    pub indexes: BTreeMap<String, IndexMap<String, Document>>,
    pub groups: BTreeMap<String, IndexMap<String, Vec<Document>>>,
}

/// The outcome of a join traversal. `results` holds the base table's rows
/// with children nested; `tables` holds the state of every visited table.
#[derive(Debug, Default)]
pub struct JoinTracker {
    pub results: Results,
    pub tables: BTreeMap<String, TableJoinData>,
}

/// Join `base_table` with `include_tables` along declared connections,
/// applying each table's `query_addons` entry at its `find` call.
pub fn join(
    db: &Database,
    base_table: &str,
    include_tables: &[&str],
    query_addons: Option<&BTreeMap<String, Query>>,
) -> Result<JoinTracker> {
    let empty_addons = BTreeMap::new();
    let query_addons = query_addons.unwrap_or(&empty_addons);

    // Requested tables in declaration order, base first, deduplicated.
    let mut requested: Vec<String> = Vec::new();
    for name in std::iter::once(base_table).chain(include_tables.iter().copied()) {
        if !requested.iter().any(|r| r == name) {
            requested.push(name.to_string());
        }
    }
    for name in &requested {
        db.table(name).context(UnknownTableSnafu { table_name: name })?;
    }

    let root = highest_parent(db, &requested, query_addons)?;
    debug!(%root, base_table, "join traversal root chosen");

    let mut tracker = JoinTracker::default();
    let mut needed: BTreeSet<String> = requested.iter().cloned().collect();
    join_for_table(db, &root, &mut needed, query_addons, None, &mut tracker)?;

    if root != base_table {
        let mut needed: BTreeSet<String> = requested.iter().cloned().collect();
        join_for_table(db, base_table, &mut needed, query_addons, None, &mut tracker)?;
    }

    Ok(tracker)
}

/// The traversal root: the requested table that is a parent of the rest.
///
/// Tables with a `many_to_one` edge into the requested set have a parent and
/// are discarded. A single survivor is the root. No survivor means the
/// requested tables form a cycle; fall back to the table with the largest
/// addon clause map, else the base table. Multiple survivors prefer one with
/// an addon; with none to prefer, the root is ambiguous.
fn highest_parent(
    db: &Database,
    requested: &[String],
    query_addons: &BTreeMap<String, Query>,
) -> Result<String> {
    let requested_set: BTreeSet<&String> = requested.iter().collect();

    let mut without_parent: Vec<String> = requested
        .iter()
        .filter(|name| {
            let table = match db.table(name) {
                Some(table) => table,
                None => return false,
            };
            !table.connections().iter().any(|(other, connection)| {
                connection.join_type == JoinType::ManyToOne && requested_set.contains(other)
            })
        })
        .cloned()
        .collect();

    match without_parent.len() {
        1 => Ok(without_parent.remove(0)),
        0 => Ok(most_precise_query_table(requested, query_addons)
            .unwrap_or_else(|| requested[0].clone())),
        _ => without_parent
            .iter()
            .find(|name| query_addons.contains_key(*name))
            .cloned()
            .ok_or(Error::AmbiguousJoinRoot {
                candidates: without_parent,
            }),
    }
}

/// The requested table with the most addon clauses, if any addon is
/// non-empty.
fn most_precise_query_table(
    requested: &[String],
    query_addons: &BTreeMap<String, Query>,
) -> Option<String> {
    let mut best: Option<(&String, usize)> = None;
    for name in requested {
        let count = query_addons.get(name).map(Query::len).unwrap_or(0);
        if count > best.map(|(_, c)| c).unwrap_or(0) {
            best = Some((name, count));
        }
    }
    best.map(|(name, _)| name.clone())
}

fn join_for_table(
    db: &Database,
    table_name: &str,
    needed: &mut BTreeSet<String>,
    query_addons: &BTreeMap<String, Query>,
    pushed_query: Option<Query>,
    tracker: &mut JoinTracker,
) -> Result<Vec<Document>> {
    let table = db.table(table_name).context(UnknownTableSnafu { table_name })?;
    needed.remove(table_name);

    // The pushed-down composition wins over the raw addon: it already
    // contains the addon clauses plus the parent-id restriction.
    let query = pushed_query.or_else(|| query_addons.get(table_name).cloned());
    let mut data = table.find(query.as_ref()).into_rows();

    for (child_name, connection) in table.connections() {
        if !needed.contains(&child_name) {
            continue;
        }
        let join_key = &connection.join_key;

        let parent_join_ids = distinct(
            data.iter()
                .map(|row| get_path_owned(row, join_key).unwrap_or(Value::Null)),
        );
        let child_query = query_addons
            .get(&child_name)
            .cloned()
            .unwrap_or_default()
            .with_in_clause(join_key, parent_join_ids);

        join_for_table(
            db,
            &child_name,
            needed,
            query_addons,
            Some(child_query),
            tracker,
        )?;

        let child = tracker.tables.get(&child_name);
        let (lookup, store_key) = match connection.join_type {
            // Each parent has at most one child: a unique index and the
            // singular storage key.
            JoinType::ManyToOne => (
                ChildLookup::One(
                    child
                        .and_then(|c| c.indexes.get(join_key))
                        .cloned()
                        .unwrap_or_default(),
                ),
                child_name.clone(),
            ),
            _ => (
                ChildLookup::Many(
                    child
                        .and_then(|c| c.groups.get(join_key))
                        .cloned()
                        .unwrap_or_default(),
                ),
                format!("{child_name}s"),
            ),
        };
        nest_children(&mut data, &lookup, join_key, &store_key);
    }

    let mut indexes = BTreeMap::new();
    let mut groups = BTreeMap::new();
    for field in table.foreign_and_primary_keys() {
        indexes.insert(field.clone(), index_by(&data, &field));
        groups.insert(field.clone(), group_by(&data, &field));
    }
    tracker.tables.insert(
        table_name.to_string(),
        TableJoinData {
            data: data.clone(),
            indexes,
            groups,
        },
    );
    tracker.results = Results::new(data.clone());
    Ok(data)
}
