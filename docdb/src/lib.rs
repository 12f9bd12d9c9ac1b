//! An embedded, partitioned, document-oriented data store with declarative
//! cross-table joins.
//!
//! Rows are JSON documents routed to on-disk partition files by their
//! index-field values. Queries are MongoDB-style clause maps; primary-key and
//! index clauses prune the candidate partition set before rows are scanned.
//! Declared connections between tables let the join engine materialize
//! parent/child aggregates.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use docdb::{join, Database, JoinType, Query};
//! use serde_json::json;
//!
//! let mut db = Database::new("shop", "/var/lib/shop", false);
//! let users = db.add_table("users", vec!["country".into()], "user_id", vec![])?;
//! let orders = db.add_table("orders", vec![], "order_id", vec![])?;
//! db.add_connection("users", "orders", "user_id", JoinType::OneToMany)?;
//!
//! users.insert(vec![
//!     json!({"user_id": 1, "country": "US"}).as_object().unwrap().clone(),
//! ])?;
//!
//! let q = Query::parse(&json!({"country": "US"}))?;
//! let us_users = users.find(Some(&q));
//!
//! let tracker = join(&db, "users", &["orders"], None)?;
//! db.save_database().await?;
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod join;
pub mod partition;
pub mod results;
pub mod table;

pub use database::Database;
pub use join::{join, JoinTracker};
pub use results::Results;
pub use table::{JoinType, Table, TableConnection};

// Re-exported so embedders can build queries and documents without naming the
// leaf crates.
pub use document::Document;
pub use query::Query;
