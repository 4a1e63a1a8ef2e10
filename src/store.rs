//! Persistent key-value store collaborator.
//!
//! The engine talks to storage through the `KeyValueStore` trait so the
//! backend stays swappable. Production uses RocksDB embedded storage;
//! tests use the dashmap-backed `MemoryStore`. Values are bincode-encoded
//! serde structs.
//!
//! Key layout (three namespaces under a configurable prefix):
//! - `{prefix}:tests:{test_id}`
//! - `{prefix}:assignments:{test_id}:{user_id}`
//! - `{prefix}:results:{test_id}:{nanos:020}:{uuid}`
//!
//! Result keys embed a zero-padded timestamp so prefix scans return the log
//! in append order.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use rocksdb::{Options, WriteOptions, DB};
use uuid::Uuid;

use crate::errors::EngineError;

/// Failures from the storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Durable string-keyed storage with prefix enumeration.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
    /// Flush buffered writes; called from engine shutdown.
    fn flush(&self) -> Result<(), StoreError>;
}

/// Write mode for storage operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// fsync() on every write; durable across power loss but slower
    Sync,
    /// Buffered in the OS page cache; survives process crashes
    Async,
}

impl Default for WriteMode {
    fn default() -> Self {
        match std::env::var("PRAYOG_WRITE_MODE") {
            Ok(mode) if mode.to_lowercase() == "sync" => WriteMode::Sync,
            _ => WriteMode::Async,
        }
    }
}

/// Helper trait to iterate over RocksDB results with error logging.
/// Unlike `.flatten()` which silently ignores errors, this logs them.
trait LogErrors<T> {
    fn log_errors(self) -> impl Iterator<Item = T>;
}

impl<I, T, E> LogErrors<T> for I
where
    I: Iterator<Item = Result<T, E>>,
    E: std::fmt::Display,
{
    fn log_errors(self) -> impl Iterator<Item = T> {
        self.filter_map(|r| match r {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("RocksDB iterator error (continuing): {}", e);
                None
            }
        })
    }
}

/// Embedded RocksDB store.
pub struct RocksDbStore {
    db: Arc<DB>,
    write_mode: WriteMode,
}

impl RocksDbStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        // Assignment traffic is write-heavy with small values
        opts.set_max_write_buffer_number(4);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_level_zero_file_num_compaction_trigger(4);
        opts.set_max_background_jobs(2);
        opts.set_level_compaction_dynamic_level_bytes(true);

        // Point lookups dominate reads (sticky assignment checks)
        use rocksdb::{BlockBasedOptions, Cache};
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_block_cache(&Cache::new_lru_cache(128 * 1024 * 1024));
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        let db = Arc::new(DB::open(&opts, path)?);
        let write_mode = WriteMode::default();
        tracing::info!(?write_mode, path = %path.display(), "store opened");

        Ok(Self { db, write_mode })
    }
}

impl KeyValueStore for RocksDbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.write_mode == WriteMode::Sync);
        self.db.put_opt(key.as_bytes(), value, &write_opts)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        for (key, value) in self.db.prefix_iterator(prefix.as_bytes()).log_errors() {
            let Ok(key_str) = std::str::from_utf8(&key) else {
                continue;
            };
            // prefix_iterator can run past the prefix range
            if !key_str.starts_with(prefix) {
                break;
            }
            out.push((key_str.to_string(), value.to_vec()));
        }
        Ok(out)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral embedding.
#[derive(Default)]
pub struct MemoryStore {
    map: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.get(key).map(|entry| entry.value().clone()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.map.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut out: Vec<(String, Vec<u8>)> = self
            .map
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Namespaced key layout under a configurable prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn test_key(&self, test_id: &str) -> String {
        format!("{}:tests:{}", self.prefix, test_id)
    }

    pub fn tests_prefix(&self) -> String {
        format!("{}:tests:", self.prefix)
    }

    pub fn assignment_key(&self, test_id: &str, user_id: &str) -> String {
        format!("{}:assignments:{}:{}", self.prefix, test_id, user_id)
    }

    pub fn assignments_prefix(&self, test_id: &str) -> String {
        format!("{}:assignments:{}:", self.prefix, test_id)
    }

    pub fn result_key(&self, test_id: &str, nanos: i64, record_id: &Uuid) -> String {
        format!(
            "{}:results:{}:{:020}:{}",
            self.prefix, test_id, nanos, record_id
        )
    }

    pub fn results_prefix(&self, test_id: &str) -> String {
        format!("{}:results:{}:", self.prefix, test_id)
    }
}

/// Encode a fixed-shape record for storage.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| EngineError::Codec(e.to_string()))
}

/// Decode a fixed-shape record.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| EngineError::Codec(e.to_string()))
}

/// Encode a test for the catalog namespace. Tests carry an opaque JSON
/// payload per variant, which bincode cannot round-trip (it is not
/// self-describing), so the catalog is stored as JSON.
pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(value).map_err(|e| EngineError::Codec(e.to_string()))
}

/// Decode a catalog entry.
pub fn decode_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::Codec(e.to_string()))
}
