//! RocksDB-backed store for the host's shared document.
//!
//! Column families:
//! - `snapshots`: full Yrs state (LZ4 compressed), one record
//! - `deltas`:    updates applied since, keyed by version (big-endian)
//! - `metadata`:  versions and sizes (bincode)
//!
//! Recovery = latest snapshot + every delta newer than the snapshot's
//! version. Replaying a delta the snapshot already contains is harmless,
//! Yrs ignores updates it has seen.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::delta::CompressedDelta;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_DELTAS, CF_METADATA];

const SNAPSHOT_KEY: &[u8] = b"current";
const METADATA_KEY: &[u8] = b"document";

/// Default storage directory.
pub const DEFAULT_STORAGE_DIR: &str = ".swarm";

/// Where and how the document store keeps its RocksDB files.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STORAGE_DIR),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Highest delta version stored
    pub version: u64,
    /// Deltas currently stored (not yet compacted)
    pub delta_count: u64,
    /// Highest delta version folded into the snapshot
    pub snapshot_version: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new() -> Self {
        let now = now_secs();
        Self {
            created_at: now,
            updated_at: now,
            ..Self::default()
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// RocksDB-backed persistence for the shared document.
///
/// Three column families: the latest snapshot, the deltas written since,
/// and metadata. Recovery loads the snapshot and replays newer deltas.
/// Calls block; async callers run them on the blocking pool.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StorageConfig,
}

impl DocumentStore {
    /// Open (creating if missing) the store at `config.path`.
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::debug!("opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StorageConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Payloads are LZ4-compressed already.
            CF_SNAPSHOTS | CF_DELTAS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Replace the snapshot with `state`, which includes every delta up to
    /// and including `version`.
    pub fn save_snapshot(&self, version: u64, state: &[u8]) -> Result<DocumentMetadata, StorageError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);

        let mut meta = self.metadata()?.unwrap_or_else(DocumentMetadata::new);
        meta.snapshot_version = version;
        meta.version = meta.version.max(version);
        meta.snapshot_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, SNAPSHOT_KEY, &compressed);
        batch.put_cf(&cf_meta, METADATA_KEY, meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    /// The snapshot and the delta version it covers, if one was saved.
    pub fn load_snapshot(&self) -> Result<Option<(u64, Vec<u8>)>, StorageError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(&cf, SNAPSHOT_KEY)? else {
            return Ok(None);
        };
        let state = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        let version = self.metadata()?.map_or(0, |m| m.snapshot_version);
        Ok(Some((version, state)))
    }

    // ─── Deltas ───────────────────────────────────────────────────────

    /// Append one update under `version`. Returns the compressed size.
    pub fn store_delta(&self, version: u64, update: &[u8]) -> Result<usize, StorageError> {
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let record = CompressedDelta::compress(version, update);
        let size = record.compressed_size();

        let mut meta = self.metadata()?.unwrap_or_else(DocumentMetadata::new);
        meta.version = meta.version.max(version);
        meta.delta_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deltas, version.to_be_bytes(), record.encode()?);
        batch.put_cf(&cf_meta, METADATA_KEY, meta.encode()?);
        self.write(batch)?;

        log::trace!(
            "delta {version}: {} -> {size} bytes ({:.1}x)",
            update.len(),
            record.compression_ratio()
        );
        Ok(size)
    }

    /// Deltas with version >= `since`, in version order.
    pub fn load_deltas_since(&self, since: u64) -> Result<Vec<(u64, Vec<u8>)>, StorageError> {
        let cf = self.cf(CF_DELTAS)?;
        let start = since.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        let mut deltas = Vec::new();
        for item in iter {
            let (_, value) = item?;
            let record = CompressedDelta::decode(&value)?;
            deltas.push((record.version, record.decompress()?));
        }
        Ok(deltas)
    }

    /// Drop every delta with version <= `up_to`. Returns how many.
    pub fn compact_deltas(&self, up_to: u64) -> Result<u64, StorageError> {
        let cf = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key_version(&key).is_some_and(|v| v > up_to) {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            if let Some(mut meta) = self.metadata()? {
                meta.delta_count = meta.delta_count.saturating_sub(count);
                batch.put_cf(&cf_meta, METADATA_KEY, meta.encode()?);
            }
            self.write(batch)?;
            log::debug!("compacted {count} deltas up to version {up_to}");
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn metadata(&self) -> Result<Option<DocumentMetadata>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, METADATA_KEY)? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Highest delta version ever stored (0 for a fresh store).
    pub fn last_version(&self) -> Result<u64, StorageError> {
        Ok(self.metadata()?.map_or(0, |m| m.version))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

fn key_version(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StorageConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert_eq!(store.metadata().unwrap(), None);
        assert_eq!(store.last_version().unwrap(), 0);
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        assert!(store.load_snapshot().unwrap().is_none());

        let state = b"snapshot of the shared todo document, compressible compressible".to_vec();
        let meta = store.save_snapshot(12, &state).unwrap();
        assert_eq!(meta.snapshot_version, 12);
        assert_eq!(meta.snapshot_size, state.len() as u64);
        assert!(meta.compressed_size > 0);

        let (version, loaded) = store.load_snapshot().unwrap().unwrap();
        assert_eq!(version, 12);
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_deltas_in_version_order() {
        let (_dir, store) = open_temp();
        for v in [3u64, 1, 2, 256, 10] {
            store.store_delta(v, format!("delta_{v}").as_bytes()).unwrap();
        }

        let all = store.load_deltas_since(0).unwrap();
        let versions: Vec<u64> = all.iter().map(|(v, _)| *v).collect();
        assert_eq!(versions, vec![1, 2, 3, 10, 256]);
        assert_eq!(all[0].1, b"delta_1");

        let recent = store.load_deltas_since(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(store.last_version().unwrap(), 256);
        assert_eq!(store.metadata().unwrap().unwrap().delta_count, 5);
    }

    #[test]
    fn test_compact_deltas() {
        let (_dir, store) = open_temp();
        for v in 1..=10u64 {
            store.store_delta(v, &[v as u8]).unwrap();
        }
        assert_eq!(store.compact_deltas(6).unwrap(), 6);
        assert_eq!(store.compact_deltas(6).unwrap(), 0);

        let left: Vec<u64> = store.load_deltas_since(0).unwrap().iter().map(|(v, _)| *v).collect();
        assert_eq!(left, vec![7, 8, 9, 10]);
        let meta = store.metadata().unwrap().unwrap();
        assert_eq!(meta.delta_count, 4);
        assert_eq!(meta.version, 10);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = DocumentStore::open(StorageConfig::for_testing(&path)).unwrap();
            store.save_snapshot(1, b"state").unwrap();
            store.store_delta(2, b"update").unwrap();
            store.flush().unwrap();
        }
        let store = DocumentStore::open(StorageConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_snapshot().unwrap(), Some((1, b"state".to_vec())));
        assert_eq!(store.load_deltas_since(2).unwrap(), vec![(2, b"update".to_vec())]);
        assert_eq!(store.last_version().unwrap(), 2);
    }
}
