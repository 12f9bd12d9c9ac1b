//! The database owns a set of tables and their declared connections, and
//! orchestrates whole-store persistence.
//!
//! The storage root is `<folder_path>/<dbname>`; the catalog file
//! `_<dbname>.json` summarizes the tables so a cold start can rebuild them
//! before each table loads its own catalog and partitions.

use crate::table::{self, JoinType, Table, TableConnection};
use futures::stream::{FuturesUnordered, TryStreamExt};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Table name is required"))]
    MissingTableName,

    #[snafu(display("Table does not exist for connection: {}", table_name))]
    UnknownTable { table_name: String },

    #[snafu(display("Error flushing table {}: {}", table_name, source))]
    FlushTable {
        table_name: String,
        source: table::Error,
    },

    #[snafu(display("Error loading table {}: {}", table_name, source))]
    LoadTable {
        table_name: String,
        source: table::Error,
    },

    #[snafu(display("Error serializing database catalog: {}", source))]
    SerializeCatalog { source: serde_json::Error },

    #[snafu(display("Database catalog {} is corrupt: {}", path.display(), source))]
    CorruptCatalog {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("I/O error on database file {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The serialized database catalog.
#[derive(Debug, Serialize, Deserialize)]
struct DatabaseCatalog {
    dbname: String,
    tables: Vec<TableSummary>,
    storage_location: String,
    output_file_path: String,
    do_compression: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableSummary {
    table_name: String,
    indices: Vec<String>,
    primary_key: String,
}

#[derive(Debug)]
pub struct Database {
    dbname: String,
    do_compression: bool,
    storage_location: PathBuf,
    output_file_path: PathBuf,
    tables: BTreeMap<String, Arc<Table>>,
}

impl Database {
    pub fn new(
        dbname: impl Into<String>,
        folder_path: impl Into<PathBuf>,
        do_compression: bool,
    ) -> Self {
        let dbname = dbname.into();
        let storage_location = folder_path.into().join(&dbname);
        let output_file_path = storage_location.join(format!("_{dbname}.json"));
        Self {
            dbname,
            do_compression,
            storage_location,
            output_file_path,
            tables: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.dbname
    }

    /// The table named `table_name`, if declared.
    pub fn table(&self, table_name: &str) -> Option<Arc<Table>> {
        self.tables.get(table_name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Declare a table. Idempotent: re-declaring an existing name returns the
    /// existing handle unchanged.
    pub fn add_table(
        &mut self,
        table_name: &str,
        indices: Vec<String>,
        primary_key: &str,
        delete_key_list: Vec<String>,
    ) -> Result<Arc<Table>> {
        ensure!(!table_name.is_empty(), MissingTableNameSnafu);

        if let Some(existing) = self.tables.get(table_name) {
            return Ok(Arc::clone(existing));
        }

        let table = Arc::new(Table::new(
            table_name,
            indices,
            &self.storage_location,
            primary_key,
            delete_key_list,
            self.do_compression,
        ));
        self.tables.insert(table_name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Declare a relationship between two tables. The forward edge goes on
    /// `table_a`; the inverse edge is written on `table_b` automatically.
    pub fn add_connection(
        &self,
        table_a_name: &str,
        table_b_name: &str,
        join_key: &str,
        join_type: JoinType,
    ) -> Result<()> {
        let table_a = self.tables.get(table_a_name).context(UnknownTableSnafu {
            table_name: table_a_name,
        })?;
        let table_b = self.tables.get(table_b_name).context(UnknownTableSnafu {
            table_name: table_b_name,
        })?;

        table_a.add_connection(
            table_b_name,
            TableConnection {
                join_key: join_key.to_string(),
                join_type,
            },
        );
        table_b.add_connection(
            table_a_name,
            TableConnection {
                join_key: join_key.to_string(),
                join_type: join_type.inverse(),
            },
        );

        info!(
            table_a = table_a_name,
            table_b = table_b_name,
            join_key,
            ?join_type,
            "added connection"
        );
        Ok(())
    }

    /// Persist the whole store: every table flushes its partitions and
    /// catalog, and only then is the database catalog committed, so crash
    /// recovery always sees a catalog whose tables are durable.
    pub async fn save_database(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.storage_location)
            .await
            .context(IoSnafu {
                path: &self.storage_location,
            })?;

        self.tables
            .values()
            .map(|table| async move {
                table.flush().await.context(FlushTableSnafu {
                    table_name: table.name(),
                })
            })
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await?;

        let catalog = DatabaseCatalog {
            dbname: self.dbname.clone(),
            tables: self
                .tables
                .values()
                .map(|table| TableSummary {
                    table_name: table.name().to_string(),
                    indices: table.indices().to_vec(),
                    primary_key: table.primary_key().to_string(),
                })
                .collect(),
            storage_location: self.storage_location.display().to_string(),
            output_file_path: self.output_file_path.display().to_string(),
            do_compression: self.do_compression,
        };
        let text =
            serde_json::to_string_pretty(&catalog).context(SerializeCatalogSnafu)?;

        let tmp_path = self.output_file_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, text.as_bytes())
            .await
            .context(IoSnafu { path: &tmp_path })?;
        tokio::fs::rename(&tmp_path, &self.output_file_path)
            .await
            .context(IoSnafu {
                path: &self.output_file_path,
            })?;

        debug!(dbname = %self.dbname, "saved database");
        Ok(())
    }

    /// Load the store from disk. An absent catalog means a fresh database,
    /// not an error.
    pub async fn read_from_file(&mut self) -> Result<()> {
        let raw = match tokio::fs::read(&self.output_file_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dbname = %self.dbname, "no database catalog, starting fresh");
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Io {
                    path: self.output_file_path.clone(),
                    source: e,
                })
            }
        };

        let catalog: DatabaseCatalog =
            serde_json::from_slice(&raw).context(CorruptCatalogSnafu {
                path: &self.output_file_path,
            })?;
        self.do_compression = catalog.do_compression;

        for summary in catalog.tables {
            let table = self.add_table(
                &summary.table_name,
                summary.indices,
                &summary.primary_key,
                vec![],
            )?;
            table.load().await.context(LoadTableSnafu {
                table_name: &summary.table_name,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use document::Document;
    use query::Query;
    use serde_json::{json, Value};

    fn docs(v: Value) -> Vec<Document> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn add_table_requires_a_name() {
        let mut db = Database::new("testdb", "/tmp/dbs", false);
        assert_matches!(
            db.add_table("", vec![], "id", vec![]),
            Err(Error::MissingTableName)
        );
    }

    #[test]
    fn add_table_is_idempotent() {
        let mut db = Database::new("testdb", "/tmp/dbs", false);
        let first = db
            .add_table("users", vec!["country".to_string()], "id", vec![])
            .unwrap();
        let second = db.add_table("users", vec![], "other", vec![]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // The original declaration wins.
        assert_eq!(second.primary_key(), "id");
    }

    #[test]
    fn add_connection_writes_both_edges() {
        let mut db = Database::new("testdb", "/tmp/dbs", false);
        db.add_table("users", vec![], "user_id", vec![]).unwrap();
        db.add_table("orders", vec![], "order_id", vec![]).unwrap();
        db.add_connection("users", "orders", "user_id", JoinType::OneToMany)
            .unwrap();

        let users = db.table("users").unwrap();
        let orders = db.table("orders").unwrap();
        assert_eq!(
            users.connection("orders"),
            Some(TableConnection {
                join_key: "user_id".to_string(),
                join_type: JoinType::OneToMany,
            })
        );
        assert_eq!(
            orders.connection("users"),
            Some(TableConnection {
                join_key: "user_id".to_string(),
                join_type: JoinType::ManyToOne,
            })
        );
    }

    #[test]
    fn one_to_one_connection_is_self_inverse() {
        let mut db = Database::new("testdb", "/tmp/dbs", false);
        db.add_table("users", vec![], "user_id", vec![]).unwrap();
        db.add_table("profiles", vec![], "profile_id", vec![]).unwrap();
        db.add_connection("users", "profiles", "user_id", JoinType::OneToOne)
            .unwrap();

        assert_eq!(
            db.table("profiles").unwrap().connection("users").unwrap().join_type,
            JoinType::OneToOne
        );
    }

    #[test]
    fn add_connection_to_unknown_table_is_rejected() {
        let mut db = Database::new("testdb", "/tmp/dbs", false);
        db.add_table("users", vec![], "user_id", vec![]).unwrap();
        assert_matches!(
            db.add_connection("users", "ghosts", "user_id", JoinType::OneToMany),
            Err(Error::UnknownTable { table_name }) => assert_eq!(table_name, "ghosts")
        );
    }

    #[tokio::test]
    async fn save_writes_catalog_and_table_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::new("appdb", dir.path(), false);
        let users = db
            .add_table("users", vec!["country".to_string()], "id", vec![])
            .unwrap();
        users
            .insert(docs(json!([
                {"id": 1, "country": "US"},
                {"id": 2, "country": "DE"},
            ])))
            .unwrap();

        db.save_database().await.unwrap();

        let root = dir.path().join("appdb");
        assert!(root.join("_appdb.json").exists());
        assert!(root.join("users/_users.json").exists());
        assert!(root.join("users/country_US.json").exists());
        assert!(root.join("users/country_DE.json").exists());

        let catalog: Value =
            serde_json::from_slice(&std::fs::read(root.join("_appdb.json")).unwrap()).unwrap();
        assert_eq!(catalog["dbname"], json!("appdb"));
        assert_eq!(catalog["do_compression"], json!(false));
        assert_eq!(catalog["tables"][0]["table_name"], json!("users"));
        assert_eq!(catalog["tables"][0]["indices"], json!(["country"]));
        assert_eq!(catalog["tables"][0]["primary_key"], json!("id"));
    }

    #[tokio::test]
    async fn save_and_reload_round_trips_queries() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::new("appdb", dir.path(), false);
        let users = db
            .add_table("users", vec!["country".to_string()], "id", vec![])
            .unwrap();
        users
            .insert(docs(json!([
                {"id": 1, "country": "US", "score": 10},
                {"id": 2, "country": "DE", "score": 20},
                {"id": 3, "country": "US", "score": 30},
            ])))
            .unwrap();
        db.save_database().await.unwrap();

        let mut reloaded = Database::new("appdb", dir.path(), false);
        reloaded.read_from_file().await.unwrap();

        let q = Query::parse(&json!({"score": {"$gte": 15}})).unwrap();
        let original = db.table("users").unwrap().find(Some(&q)).into_rows();
        let restored = reloaded.table("users").unwrap().find(Some(&q)).into_rows();
        assert_eq!(original, restored);

        let all = reloaded.table("users").unwrap().find(None);
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn reload_missing_catalog_is_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::new("nothere", dir.path(), false);
        db.read_from_file().await.unwrap();
        assert!(db.table_names().is_empty());
    }

    #[tokio::test]
    async fn compressed_database_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::new("zipped", dir.path(), true);
        let users = db.add_table("users", vec![], "id", vec![]).unwrap();
        users.insert(docs(json!([{"id": 1, "name": "A"}]))).unwrap();
        db.save_database().await.unwrap();

        assert!(dir.path().join("zipped/users/default.txt").exists());

        let mut reloaded = Database::new("zipped", dir.path(), true);
        reloaded.read_from_file().await.unwrap();
        assert_eq!(reloaded.table("users").unwrap().find(None).len(), 1);
    }
}
