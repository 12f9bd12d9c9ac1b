//! A table owns a set of partitions and routes every row to exactly one of
//! them by the row's index-field values.
//!
//! Two maps carry the routing invariant: `partitions` (name to shard) and
//! `routing` (primary-key value to partition name). A primary-key value lives
//! in at most one partition, and the two maps agree on where.

use crate::partition::{self, partition_name_from_indices, Partition};
use crate::results::Results;
use document::{get_path, get_path_owned, remove_path, scalar_key, Document};
use futures::stream::{FuturesUnordered, TryStreamExt};
use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use query::{Clause, Query};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Error in partition of table {}: {}", table_name, source))]
    Partition {
        table_name: String,
        source: partition::Error,
    },

    #[snafu(display(
        "Row with primary key {} does not exist in table {} and cannot be updated",
        value,
        table_name
    ))]
    UnknownPrimaryKey { table_name: String, value: String },

    #[snafu(display("Error serializing catalog of table {}: {}", table_name, source))]
    SerializeCatalog {
        table_name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Table catalog {} is corrupt: {}", path.display(), source))]
    CorruptCatalog {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("I/O error on table file {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The cardinality of a declared relationship, seen from the owning table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    OneToOne,
    OneToMany,
    ManyToOne,
}

impl JoinType {
    /// The type of the automatically inserted reverse edge.
    pub fn inverse(self) -> Self {
        match self {
            Self::OneToOne => Self::OneToOne,
            Self::OneToMany => Self::ManyToOne,
            Self::ManyToOne => Self::OneToMany,
        }
    }
}

/// A declared relationship to another table: the shared join field and the
/// cardinality of this side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConnection {
    pub join_key: String,
    pub join_type: JoinType,
}

/// The serialized table catalog.
#[derive(Debug, Serialize, Deserialize)]
struct TableCatalog {
    table_name: String,
    indices: Vec<String>,
    primary_key: String,
    partition_names: Vec<String>,
    output_file_path: String,
    storage_location: String,
    table_connections: BTreeMap<String, TableConnection>,
    do_compression: bool,
}

#[derive(Debug)]
pub struct Table {
    table_name: String,
    indices: Vec<String>,
    primary_key: String,
    delete_key_list: Vec<String>,
    do_compression: bool,
    storage_location: PathBuf,
    output_file_path: PathBuf,
    connections: RwLock<BTreeMap<String, TableConnection>>,
    /// Partition name to shard, name-ordered; iteration order fixes result
    /// order.
    partitions: RwLock<BTreeMap<String, Arc<Partition>>>,
    /// Primary-key value (scalar key form) to owning partition name.
    routing: RwLock<HashMap<String, String>>,
}

impl Table {
    pub(crate) fn new(
        table_name: impl Into<String>,
        indices: Vec<String>,
        db_storage_location: &std::path::Path,
        primary_key: impl Into<String>,
        delete_key_list: Vec<String>,
        do_compression: bool,
    ) -> Self {
        let table_name = table_name.into();
        let storage_location = db_storage_location.join(&table_name);
        let output_file_path = storage_location.join(format!("_{table_name}.json"));
        Self {
            table_name,
            indices,
            primary_key: primary_key.into(),
            delete_key_list,
            do_compression,
            storage_location,
            output_file_path,
            connections: RwLock::new(BTreeMap::new()),
            partitions: RwLock::new(BTreeMap::new()),
            routing: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.table_name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn indices(&self) -> &[String] {
        &self.indices
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn partition_names(&self) -> Vec<String> {
        self.partitions.read().keys().cloned().collect()
    }

    pub(crate) fn add_connection(&self, other_table: &str, connection: TableConnection) {
        self.connections
            .write()
            .insert(other_table.to_string(), connection);
    }

    /// The declared connection to `other_table`, if any.
    pub fn connection(&self, other_table: &str) -> Option<TableConnection> {
        self.connections.read().get(other_table).cloned()
    }

    /// All declared connections, in other-table-name order.
    pub fn connections(&self) -> Vec<(String, TableConnection)> {
        self.connections
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.clone()))
            .collect()
    }

    /// The join keys of every declared connection.
    pub fn foreign_keys(&self) -> Vec<String> {
        self.connections
            .read()
            .values()
            .map(|c| c.join_key.clone())
            .collect()
    }

    /// Foreign keys plus the primary key, deduplicated. These are the fields
    /// the join engine builds lookup maps over.
    pub fn foreign_and_primary_keys(&self) -> Vec<String> {
        let mut keys = self.foreign_keys();
        keys.push(self.primary_key.clone());
        let mut seen = BTreeSet::new();
        keys.retain(|k| seen.insert(k.clone()));
        keys
    }

    /// Shallow-copy `rows` with the `delete_key_list` fields stripped, so
    /// downstream writes never touch the caller's documents.
    fn cleanse_before_alter(&self, rows: Vec<Document>) -> Vec<Document> {
        rows.into_iter()
            .map(|mut row| {
                for field in &self.delete_key_list {
                    remove_path(&mut row, field);
                }
                row
            })
            .collect()
    }

    /// Insert rows, routing each to its partition by index values. Aborts on
    /// the first failure; rows ahead of a faulty one stay inserted.
    pub fn insert(&self, rows: Vec<Document>) -> Result<()> {
        for row in self.cleanse_before_alter(rows) {
            self.insert_cleansed(row)?;
        }
        Ok(())
    }

    fn insert_cleansed(&self, row: Document) -> Result<()> {
        let mut partition_indices = IndexMap::new();
        for field in &self.indices {
            let value = get_path_owned(&row, field).unwrap_or(Value::Null);
            partition_indices.insert(field.clone(), value);
        }
        let partition_name = partition_name_from_indices(&partition_indices);

        let partition = Arc::clone(
            self.partitions
                .write()
                .entry(partition_name)
                .or_insert_with(|| {
                    Arc::new(Partition::new(
                        self.storage_location.clone(),
                        partition_indices,
                        &self.primary_key,
                        self.do_compression,
                    ))
                }),
        );

        let pk_key = get_path(&row, &self.primary_key).map(scalar_key);
        partition.insert(vec![row]).context(PartitionSnafu {
            table_name: &self.table_name,
        })?;

        // Routing is recorded only after the partition accepted the row, so
        // a rejected insert never poisons the map.
        if let Some(pk_key) = pk_key {
            self.routing
                .write()
                .insert(pk_key, partition.name().to_string());
        }
        Ok(())
    }

    /// Update rows in place, moving any row whose index values changed to its
    /// new partition.
    pub fn update(&self, rows: Vec<Document>) -> Result<()> {
        for row in self.cleanse_before_alter(rows) {
            let pk_key = scalar_key(get_path(&row, &self.primary_key).unwrap_or(&Value::Null));

            let old_partition_name = self
                .routing
                .read()
                .get(&pk_key)
                .cloned()
                .context(UnknownPrimaryKeySnafu {
                    table_name: &self.table_name,
                    value: &pk_key,
                })?;

            // Remove from the old shard before re-routing; the pair of maps
            // never holds the row twice.
            if let Some(old_partition) = self.partitions.read().get(&old_partition_name) {
                old_partition.remove(&pk_key);
            }
            self.routing.write().remove(&pk_key);

            self.insert_cleansed(row)?;
        }
        Ok(())
    }

    /// Delete every row matching `query`; with no query, clear the table.
    pub async fn delete(&self, query: Option<&Query>) -> Result<()> {
        let query = match query {
            None => return self.clear().await,
            Some(query) => query,
        };

        for row in self.find(Some(query)) {
            let pk_key = scalar_key(get_path(&row, &self.primary_key).unwrap_or(&Value::Null));
            let partition_name = self.routing.write().remove(&pk_key);
            if let Some(partition_name) = partition_name {
                if let Some(partition) = self.partitions.read().get(&partition_name) {
                    partition.remove(&pk_key);
                }
            }
        }
        Ok(())
    }

    /// Delete every partition file and empty both maps.
    pub async fn clear(&self) -> Result<()> {
        let partitions: Vec<Arc<Partition>> =
            self.partitions.write().values().cloned().collect();

        partitions
            .iter()
            .map(|p| p.delete_file())
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await
            .context(PartitionSnafu {
                table_name: &self.table_name,
            })?;

        self.partitions.write().clear();
        self.routing.write().clear();
        Ok(())
    }

    /// Run `query` against the table.
    ///
    /// Rows come back in deterministic order: partition name ascending, then
    /// insertion order within each partition. No query (or an empty one)
    /// returns every row.
    pub fn find(&self, query: Option<&Query>) -> Results {
        let query = match query {
            Some(query) if !query.is_empty() => query,
            _ => return Results::new(self.all_rows()),
        };

        let mut candidates: Vec<Arc<Partition>> =
            self.partitions.read().values().cloned().collect();

        // Primary-key pruning through the routing map. The clauses stay in
        // the residual filter: a partition holds more rows than the targeted
        // keys, and operators that cannot prune still have to hold row-wise.
        if let Some(clauses) = query.get(&self.primary_key) {
            if let Some(names) = self.primary_key_partition_names(clauses) {
                candidates.retain(|p| names.contains(p.name()));
            }
        }

        // Index pruning: every row of a partition shares the pinned index
        // value, so testing the partition stands in for testing its rows and
        // the clause can leave the residual query.
        let mut residual = query.clone();
        for field in &self.indices {
            if let Some(clauses) = residual.remove(field) {
                candidates.retain(|p| {
                    let value = p.index_value(field);
                    clauses.iter().all(|clause| clause.matches(value))
                });
            }
        }

        let mut rows = Vec::new();
        for partition in candidates {
            for row in partition.rows() {
                if residual.matches(&row) {
                    rows.push(row);
                }
            }
        }
        Results::new(rows)
    }

    /// The first matching row in deterministic order, if any.
    pub fn find_one(&self, query: Option<&Query>) -> Option<Document> {
        self.find(query).into_rows().into_iter().next()
    }

    fn all_rows(&self) -> Vec<Document> {
        self.partitions
            .read()
            .values()
            .flat_map(|p| p.rows())
            .collect()
    }

    /// `Some(names)` when the primary-key clauses pin the candidate set via
    /// the routing map; `None` when no clause can prune.
    fn primary_key_partition_names(&self, clauses: &[Clause]) -> Option<BTreeSet<String>> {
        let routing = self.routing.read();
        let mut names: Option<BTreeSet<String>> = None;

        for clause in clauses {
            let keys: Vec<String> = match clause {
                Clause::Eq(value) => vec![scalar_key(value)],
                Clause::In(values) => values.iter().map(scalar_key).collect(),
                _ => continue,
            };
            let targeted: BTreeSet<String> = keys
                .iter()
                .filter_map(|key| routing.get(key).cloned())
                .collect();
            names = Some(match names {
                None => targeted,
                Some(previous) => previous.intersection(&targeted).cloned().collect(),
            });
        }
        names
    }

    /// Flush every partition, then commit the table catalog. Partitions go
    /// first so a crash between the two never leaves the catalog naming
    /// partitions that were not durable.
    pub async fn flush(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.storage_location)
            .await
            .context(IoSnafu {
                path: &self.storage_location,
            })?;

        let partitions: Vec<Arc<Partition>> =
            self.partitions.read().values().cloned().collect();
        partitions
            .iter()
            .map(|p| p.write_to_file())
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await
            .context(PartitionSnafu {
                table_name: &self.table_name,
            })?;

        let catalog = TableCatalog {
            table_name: self.table_name.clone(),
            indices: self.indices.clone(),
            primary_key: self.primary_key.clone(),
            partition_names: self.partitions.read().keys().cloned().collect(),
            output_file_path: self.output_file_path.display().to_string(),
            storage_location: self.storage_location.display().to_string(),
            table_connections: self.connections.read().clone(),
            do_compression: self.do_compression,
        };
        let text = serde_json::to_string_pretty(&catalog).context(SerializeCatalogSnafu {
            table_name: &self.table_name,
        })?;

        let tmp_path = self.output_file_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, text.as_bytes())
            .await
            .context(IoSnafu { path: &tmp_path })?;
        tokio::fs::rename(&tmp_path, &self.output_file_path)
            .await
            .context(IoSnafu {
                path: &self.output_file_path,
            })?;

        debug!(table_name = %self.table_name, "flushed table");
        Ok(())
    }

    /// Load the table catalog and every partition it names, rebuilding the
    /// routing map from the loaded rows. An absent catalog is a fresh table.
    pub async fn load(&self) -> Result<()> {
        let raw = match tokio::fs::read(&self.output_file_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(table_name = %self.table_name, "no table catalog, starting fresh");
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Io {
                    path: self.output_file_path.clone(),
                    source: e,
                })
            }
        };

        let catalog: TableCatalog = serde_json::from_slice(&raw).context(CorruptCatalogSnafu {
            path: &self.output_file_path,
        })?;
        *self.connections.write() = catalog.table_connections;

        let loaded: Vec<Partition> = catalog
            .partition_names
            .iter()
            .map(|name| {
                Partition::load(
                    self.storage_location.clone(),
                    name,
                    &self.primary_key,
                    self.do_compression,
                )
            })
            .collect::<FuturesUnordered<_>>()
            .try_collect()
            .await
            .context(PartitionSnafu {
                table_name: &self.table_name,
            })?;

        let mut partitions = self.partitions.write();
        let mut routing = self.routing.write();
        for partition in loaded {
            for pk_key in partition.row_keys() {
                routing.insert(pk_key, partition.name().to_string());
            }
            partitions.insert(partition.name().to_string(), Arc::new(partition));
        }
        Ok(())
    }
}
