//! A partition owns one shard of a table: every row whose index-field values
//! match the partition's pinned tuple, keyed by primary-key value.
//!
//! Partitions track their own dirtiness and serialize themselves to a single
//! file (`<name>.json`, or gzip'd `<name>.txt`). Writes are all-or-nothing
//! from a reader's perspective: the image is written beside the target and
//! renamed into place.

use chrono::{DateTime, Utc};
use document::{get_path, remove_path, scalar_key, Document};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "Primary key {} missing from row, cannot insert into partition {}",
        primary_key,
        partition_name
    ))]
    MissingPrimaryKey {
        partition_name: String,
        primary_key: String,
    },

    #[snafu(display(
        "Duplicate primary key value {} for field {} in partition {}",
        value,
        primary_key,
        partition_name
    ))]
    DuplicatePrimaryKey {
        partition_name: String,
        primary_key: String,
        value: String,
    },

    #[snafu(display(
        "Row with primary key {} does not exist in partition {}",
        value,
        partition_name
    ))]
    UnknownPrimaryKey {
        partition_name: String,
        value: String,
    },

    #[snafu(display("Error serializing partition {}: {}", partition_name, source))]
    SerializePartition {
        partition_name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Partition file {} is corrupt: {}", path.display(), source))]
    CorruptPartition {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("I/O error on partition file {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Derive a partition's name from its pinned index tuple, in index
/// declaration order. The empty tuple names the `default` partition.
pub fn partition_name_from_indices(indices: &IndexMap<String, Value>) -> String {
    if indices.is_empty() {
        return "default".to_string();
    }
    indices
        .iter()
        .map(|(field, value)| format!("{}_{}", field, scalar_key(value)))
        .collect::<Vec<_>>()
        .join("_")
}

/// Interior row state, guarded together so dirtiness always reflects `rows`.
#[derive(Debug, Default)]
struct PartitionState {
    /// Primary-key value (scalar key form) to row, in insertion order.
    rows: IndexMap<String, Document>,
    last_update_dt: Option<DateTime<Utc>>,
    is_dirty: bool,
}

/// One on-disk shard of a table.
#[derive(Debug)]
pub struct Partition {
    partition_name: String,
    partition_indices: IndexMap<String, Value>,
    primary_key: String,
    storage_location: PathBuf,
    do_compression: bool,
    state: RwLock<PartitionState>,
    /// Single-flight write latch: at most one outstanding flush per
    /// partition, concurrent requests coalesce.
    write_lock: AtomicBool,
}

/// The serialized partition image.
#[derive(Debug, Serialize, Deserialize)]
struct PartitionImage {
    partition_name: String,
    partition_indices: IndexMap<String, Value>,
    data: IndexMap<String, Document>,
    storage_location: String,
    primary_key: String,
    last_update_dt: Option<String>,
}

impl Partition {
    pub fn new(
        storage_location: impl Into<PathBuf>,
        partition_indices: IndexMap<String, Value>,
        primary_key: impl Into<String>,
        do_compression: bool,
    ) -> Self {
        let partition_name = partition_name_from_indices(&partition_indices);
        Self {
            partition_name,
            partition_indices,
            primary_key: primary_key.into(),
            storage_location: storage_location.into(),
            do_compression,
            state: RwLock::new(PartitionState {
                is_dirty: true,
                ..Default::default()
            }),
            write_lock: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.partition_name
    }

    /// The pinned value this partition holds for `field`, when `field` is an
    /// index field.
    pub fn index_value(&self, field: &str) -> Option<&Value> {
        self.partition_indices.get(field)
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().is_dirty
    }

    pub fn last_update_dt(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_update_dt
    }

    pub fn row_count(&self) -> usize {
        self.state.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().rows.is_empty()
    }

    /// All rows in insertion order.
    pub fn rows(&self) -> Vec<Document> {
        self.state.read().rows.values().cloned().collect()
    }

    /// The primary-key values held here, in scalar key form.
    pub fn row_keys(&self) -> Vec<String> {
        self.state.read().rows.keys().cloned().collect()
    }

    /// The file this partition persists to. The extension is the only signal
    /// of encoding: `.txt` is gzip'd, `.json` is plain.
    pub fn file_path(&self) -> PathBuf {
        let extension = if self.do_compression { "txt" } else { "json" };
        self.storage_location
            .join(format!("{}.{}", self.partition_name, extension))
    }

    /// Insert rows, aborting on the first failure. Rows ahead of a faulty
    /// one stay inserted.
    pub fn insert(&self, rows: Vec<Document>) -> Result<()> {
        let mut state = self.state.write();
        for row in rows {
            let pk_value = get_path(&row, &self.primary_key).context(MissingPrimaryKeySnafu {
                partition_name: &self.partition_name,
                primary_key: &self.primary_key,
            })?;
            let key = scalar_key(pk_value);
            if state.rows.contains_key(&key) {
                return DuplicatePrimaryKeySnafu {
                    partition_name: &self.partition_name,
                    primary_key: &self.primary_key,
                    value: key,
                }
                .fail();
            }
            state.rows.insert(key, row);
            state.is_dirty = true;
            state.last_update_dt = Some(Utc::now());
        }
        Ok(())
    }

    /// Replace an existing row, stripping `fields_to_drop` (path-aware)
    /// first.
    pub fn update(&self, mut row: Document, fields_to_drop: &[String]) -> Result<()> {
        let key = scalar_key(
            get_path(&row, &self.primary_key).unwrap_or(&Value::Null),
        );

        let mut state = self.state.write();
        if !state.rows.contains_key(&key) {
            return UnknownPrimaryKeySnafu {
                partition_name: &self.partition_name,
                value: key,
            }
            .fail();
        }

        for field in fields_to_drop {
            remove_path(&mut row, field);
        }
        state.rows.insert(key, row);
        state.is_dirty = true;
        state.last_update_dt = Some(Utc::now());
        Ok(())
    }

    /// Remove the row keyed by `pk_key`, marking the partition dirty when a
    /// row was actually removed.
    pub fn remove(&self, pk_key: &str) -> Option<Document> {
        let mut state = self.state.write();
        let removed = state.rows.shift_remove(pk_key);
        if removed.is_some() {
            state.is_dirty = true;
            state.last_update_dt = Some(Utc::now());
        }
        removed
    }

    /// Flush this partition to disk if it is dirty.
    ///
    /// A flush already in progress wins the latch and this call returns
    /// immediately, leaving the dirty bit for the next save cycle. Failures
    /// re-mark the partition dirty and surface.
    pub async fn write_to_file(&self) -> Result<()> {
        if !self.state.read().is_dirty {
            return Ok(());
        }
        if self
            .write_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Ok(());
        }

        let result = self.write_image().await;
        if result.is_err() {
            self.state.write().is_dirty = true;
        }
        self.write_lock.store(false, Ordering::Release);
        result
    }

    async fn write_image(&self) -> Result<()> {
        let image = {
            let mut state = self.state.write();
            if !state.is_dirty {
                return Ok(());
            }
            // Cleared optimistically; a mutation racing the write below
            // re-dirties the partition and is caught by the next save.
            state.is_dirty = false;
            PartitionImage {
                partition_name: self.partition_name.clone(),
                partition_indices: self.partition_indices.clone(),
                data: state.rows.clone(),
                storage_location: self.storage_location.display().to_string(),
                primary_key: self.primary_key.clone(),
                last_update_dt: state.last_update_dt.map(|dt| dt.to_rfc3339()),
            }
        };

        let text =
            serde_json::to_string_pretty(&image).context(SerializePartitionSnafu {
                partition_name: &self.partition_name,
            })?;

        let path = self.file_path();
        let bytes = if self.do_compression {
            gzip_bytes(text.as_bytes()).context(IoSnafu { path: &path })?
        } else {
            text.into_bytes()
        };

        tokio::fs::create_dir_all(&self.storage_location)
            .await
            .context(IoSnafu {
                path: &self.storage_location,
            })?;

        // Temp-file-and-rename so readers never observe a partial image.
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .context(IoSnafu { path: &tmp_path })?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .context(IoSnafu { path: &path })?;

        debug!(partition_name = %self.partition_name, path = %path.display(), "flushed partition");
        Ok(())
    }

    /// Construct a partition from its on-disk image.
    ///
    /// An absent file is the cold-start case: the partition loads empty
    /// under the catalogued name. A file that fails to decompress or parse
    /// is an error.
    pub async fn load(
        storage_location: impl Into<PathBuf>,
        partition_name: &str,
        primary_key: &str,
        do_compression: bool,
    ) -> Result<Self> {
        let storage_location = storage_location.into();
        let extension = if do_compression { "txt" } else { "json" };
        let path = storage_location.join(format!("{partition_name}.{extension}"));

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(partition_name, path = %path.display(), "no partition file, loading empty");
                return Ok(Self {
                    partition_name: partition_name.to_string(),
                    partition_indices: IndexMap::new(),
                    primary_key: primary_key.to_string(),
                    storage_location,
                    do_compression,
                    state: RwLock::new(PartitionState {
                        is_dirty: true,
                        ..Default::default()
                    }),
                    write_lock: AtomicBool::new(false),
                });
            }
            Err(e) => return Err(Error::Io { path, source: e }),
        };

        let text = if do_compression {
            gunzip_bytes(&raw).context(IoSnafu { path: &path })?
        } else {
            raw
        };

        let image: PartitionImage =
            serde_json::from_slice(&text).context(CorruptPartitionSnafu { path: &path })?;

        let last_update_dt = image.last_update_dt.as_deref().and_then(|raw| {
            match DateTime::parse_from_rfc3339(raw) {
                Ok(dt) => Some(dt.with_timezone(&Utc)),
                Err(e) => {
                    warn!(partition_name, %raw, %e, "unparseable last_update_dt, dropping");
                    None
                }
            }
        });

        Ok(Self {
            partition_name: image.partition_name,
            partition_indices: image.partition_indices,
            primary_key: image.primary_key,
            storage_location,
            do_compression,
            state: RwLock::new(PartitionState {
                rows: image.data,
                last_update_dt,
                is_dirty: false,
            }),
            write_lock: AtomicBool::new(false),
        })
    }

    /// Drop all rows and remove the backing file. A missing file is fine.
    pub async fn delete_file(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            state.rows.clear();
            state.is_dirty = true;
        }

        let path = self.file_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io { path, source: e }),
        }
    }
}

fn gzip_bytes(text: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text)?;
    encoder.finish()
}

fn gunzip_bytes(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(raw);
    let mut text = Vec::new();
    decoder.read_to_end(&mut text)?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().unwrap().clone()
    }

    fn indices(v: serde_json::Value) -> IndexMap<String, Value> {
        v.as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[test]
    fn name_derivation_follows_index_order() {
        assert_eq!(
            partition_name_from_indices(&indices(json!({"country": "US"}))),
            "country_US"
        );

        let mut two = IndexMap::new();
        two.insert("country".to_string(), json!("US"));
        two.insert("tier".to_string(), json!(2));
        assert_eq!(partition_name_from_indices(&two), "country_US_tier_2");

        assert_eq!(partition_name_from_indices(&IndexMap::new()), "default");
    }

    #[test]
    fn insert_requires_primary_key() {
        let p = Partition::new("/tmp/t", IndexMap::new(), "id", false);
        assert_matches!(
            p.insert(vec![doc(json!({"name": "no id"}))]),
            Err(Error::MissingPrimaryKey { primary_key, .. }) => assert_eq!(primary_key, "id")
        );
        assert_eq!(p.row_count(), 0);
    }

    #[test]
    fn insert_rejects_duplicates_but_keeps_earlier_rows() {
        let p = Partition::new("/tmp/t", IndexMap::new(), "id", false);
        let result = p.insert(vec![
            doc(json!({"id": 1})),
            doc(json!({"id": 2})),
            doc(json!({"id": 1, "again": true})),
        ]);
        assert_matches!(
            result,
            Err(Error::DuplicatePrimaryKey { value, .. }) => assert_eq!(value, "1")
        );
        // Rows ahead of the faulty one stay inserted.
        assert_eq!(p.row_count(), 2);
        assert!(p.is_dirty());
        assert!(p.last_update_dt().is_some());
    }

    #[test]
    fn update_unknown_primary_key_is_rejected() {
        let p = Partition::new("/tmp/t", IndexMap::new(), "id", false);
        p.insert(vec![doc(json!({"id": 1}))]).unwrap();

        assert_matches!(
            p.update(doc(json!({"id": 9})), &[]),
            Err(Error::UnknownPrimaryKey { value, .. }) => assert_eq!(value, "9")
        );
        assert_matches!(
            p.update(doc(json!({"no_pk": true})), &[]),
            Err(Error::UnknownPrimaryKey { .. })
        );
    }

    #[test]
    fn update_strips_dropped_fields_path_aware() {
        let p = Partition::new("/tmp/t", IndexMap::new(), "id", false);
        p.insert(vec![doc(json!({"id": 1, "keep": 1}))]).unwrap();

        p.update(
            doc(json!({"id": 1, "keep": 2, "secret": "x", "meta": {"internal": true, "public": 1}})),
            &["secret".to_string(), "meta.internal".to_string()],
        )
        .unwrap();

        let rows = p.rows();
        assert_eq!(
            Value::Object(rows[0].clone()),
            json!({"id": 1, "keep": 2, "meta": {"public": 1}})
        );
    }

    #[test]
    fn remove_marks_dirty_only_when_present() {
        let p = Partition::new("/tmp/t", IndexMap::new(), "id", false);
        p.insert(vec![doc(json!({"id": 1}))]).unwrap();

        assert!(p.remove("1").is_some());
        assert!(p.remove("1").is_none());
        assert_eq!(p.row_count(), 0);
    }

    #[tokio::test]
    async fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let p = Partition::new(
            dir.path(),
            indices(json!({"country": "US"})),
            "id",
            false,
        );
        p.insert(vec![
            doc(json!({"id": 1, "country": "US", "name": "A"})),
            doc(json!({"id": 2, "country": "US", "name": "B"})),
        ])
        .unwrap();

        p.write_to_file().await.unwrap();
        assert!(!p.is_dirty());
        assert!(dir.path().join("country_US.json").exists());
        // No leftover temp file from the atomic rename.
        assert!(!dir.path().join("country_US.tmp").exists());

        let loaded = Partition::load(dir.path(), "country_US", "id", false)
            .await
            .unwrap();
        assert_eq!(loaded.name(), "country_US");
        assert_eq!(loaded.index_value("country"), Some(&json!("US")));
        assert_eq!(loaded.rows(), p.rows());
        assert!(!loaded.is_dirty());
        assert_eq!(loaded.last_update_dt(), p.last_update_dt());
    }

    #[tokio::test]
    async fn compressed_write_is_a_gzip_stream_of_the_same_json() {
        let dir = tempfile::tempdir().unwrap();
        let p = Partition::new(dir.path(), indices(json!({"country": "DE"})), "id", true);
        p.insert(vec![doc(json!({"id": 7, "country": "DE"}))]).unwrap();
        p.write_to_file().await.unwrap();

        let path = dir.path().join("country_DE.txt");
        let raw = std::fs::read(&path).unwrap();
        // gzip magic number.
        assert_eq!(raw[0], 0x1f);
        assert_eq!(raw[1], 0x8b);

        let text = gunzip_bytes(&raw).unwrap();
        let image: serde_json::Value = serde_json::from_slice(&text).unwrap();
        assert_eq!(image["partition_name"], json!("country_DE"));
        assert_eq!(image["data"]["7"]["country"], json!("DE"));

        let loaded = Partition::load(dir.path(), "country_DE", "id", true)
            .await
            .unwrap();
        assert_eq!(loaded.rows(), p.rows());
    }

    #[tokio::test]
    async fn clean_partition_write_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let p = Partition::new(dir.path(), IndexMap::new(), "id", false);
        p.insert(vec![doc(json!({"id": 1}))]).unwrap();
        p.write_to_file().await.unwrap();

        let mtime = std::fs::metadata(p.file_path()).unwrap().modified().unwrap();
        p.write_to_file().await.unwrap();
        assert_eq!(
            std::fs::metadata(p.file_path()).unwrap().modified().unwrap(),
            mtime
        );
    }

    #[tokio::test]
    async fn load_absent_file_is_empty_partition() {
        let dir = tempfile::tempdir().unwrap();
        let p = Partition::load(dir.path(), "country_FR", "id", false)
            .await
            .unwrap();
        assert_eq!(p.name(), "country_FR");
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn load_corrupt_file_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{ not json").unwrap();
        assert_matches!(
            Partition::load(dir.path(), "bad", "id", false).await,
            Err(Error::CorruptPartition { .. })
        );
    }

    #[tokio::test]
    async fn delete_file_clears_rows_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = Partition::new(dir.path(), IndexMap::new(), "id", false);
        p.insert(vec![doc(json!({"id": 1}))]).unwrap();

        // Never written: removing the file is still fine.
        p.delete_file().await.unwrap();
        assert!(p.is_empty());

        p.insert(vec![doc(json!({"id": 2}))]).unwrap();
        p.write_to_file().await.unwrap();
        assert!(p.file_path().exists());
        p.delete_file().await.unwrap();
        assert!(!p.file_path().exists());
    }
}
