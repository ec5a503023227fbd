//! RocksDB-backed event log.
//!
//! Column families:
//! - `updates`   — Append-only update blobs (LZ4 compressed), keyed by
//!                 `<doc_id bytes><0x00><seq:8 bytes big-endian>`
//! - `meta`      — Per-document log metadata (bincode: entry count, next
//!                 sequence, timestamps)
//! - `directory` — The process-wide set of known document ids under one
//!                 fixed key, so the directory survives restarts

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{DocDirectory, DurableLog, LogHandle, StoreError};
use crate::doc::merge_update_batch;
use crate::protocol::DocumentId;

const CF_UPDATES: &str = "updates";
const CF_META: &str = "meta";
const CF_DIRECTORY: &str = "directory";

const COLUMN_FAMILIES: &[&str] = &[CF_UPDATES, CF_META, CF_DIRECTORY];

/// Fixed key holding the known-document set.
const DIRECTORY_KEY: &[u8] = b"docs";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("meshdoc_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document log metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogMeta {
    entry_count: u64,
    next_seq: u64,
    created_at: u64,
    updated_at: u64,
}

impl LogMeta {
    fn new() -> Self {
        let now = unix_now();
        Self {
            entry_count: 0,
            next_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct Inner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

/// RocksDB-backed append-only update log. Clones share one database.
#[derive(Clone)]
pub struct EventLogStore {
    inner: Arc<Inner>,
}

impl EventLogStore {
    /// Open the store at the configured path, creating the database and
    /// column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("event log store opened at {}", config.path.display());
        Ok(Self {
            inner: Arc::new(Inner { db, config }),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        // Values are LZ4-framed by us already; skip double compression.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.inner
            .db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Key for one update entry: doc bytes, NUL separator, seq big-endian.
    fn update_key(doc: &DocumentId, seq: u64) -> Vec<u8> {
        let doc_bytes = doc.as_str().as_bytes();
        let mut key = Vec::with_capacity(doc_bytes.len() + 9);
        key.extend_from_slice(doc_bytes);
        key.push(0);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn load_meta(&self, doc: &DocumentId) -> Result<Option<LogMeta>, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.inner.db.get_cf(cf, doc.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(LogMeta::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of entries appended to a document's log.
    pub fn entry_count(&self, doc: &DocumentId) -> Result<u64, StoreError> {
        Ok(self.load_meta(doc)?.map(|m| m.entry_count).unwrap_or(0))
    }

    /// All stored update blobs for a document, in append order.
    pub fn load_entries(&self, doc: &DocumentId) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let mut prefix = doc.as_str().as_bytes().to_vec();
        prefix.push(0);

        let mut entries = Vec::new();
        let iter = self.inner.db.iterator_cf(
            cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let blob = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            entries.push(blob);
        }
        Ok(entries)
    }

    /// Append one blob to a document's log.
    pub fn append_entry(&self, doc: &DocumentId, update: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;

        let mut meta = self.load_meta(doc)?.unwrap_or_else(LogMeta::new);
        let seq = meta.next_seq;
        meta.next_seq += 1;
        meta.entry_count += 1;
        meta.updated_at = unix_now();

        let compressed = lz4_flex::compress_prepend_size(update);

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_updates, Self::update_key(doc, seq), &compressed);
        batch.put_cf(cf_meta, doc.as_str().as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.inner.config.sync_writes);
        self.inner.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "appended entry {seq} ({} bytes raw) to log {doc}",
            update.len()
        );
        Ok(seq)
    }

}

impl DocDirectory for EventLogStore {
    fn save_directory(&self, docs: &[DocumentId]) -> Result<(), StoreError> {
        let cf = self.cf(CF_DIRECTORY)?;
        let encoded = bincode::serde::encode_to_vec(docs, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.inner.db.put_cf(cf, DIRECTORY_KEY, encoded)?;
        Ok(())
    }

    fn load_directory(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_DIRECTORY)?;
        match self.inner.db.get_cf(cf, DIRECTORY_KEY)? {
            Some(bytes) => {
                let (docs, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(docs)
            }
            None => Ok(Vec::new()),
        }
    }
}

impl DurableLog for EventLogStore {
    fn open(&self, doc: &DocumentId) -> Result<Box<dyn LogHandle>, StoreError> {
        Ok(Box::new(RocksLogHandle {
            store: self.clone(),
            doc: doc.clone(),
            open: true,
        }))
    }
}

struct RocksLogHandle {
    store: EventLogStore,
    doc: DocumentId,
    open: bool,
}

impl RocksLogHandle {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::HandleClosed)
        }
    }
}

impl LogHandle for RocksLogHandle {
    fn doc_id(&self) -> &DocumentId {
        &self.doc
    }

    fn load(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        let entries = self.store.load_entries(&self.doc)?;
        if entries.is_empty() {
            return Ok(None);
        }
        let merged = merge_update_batch(&entries)
            .map_err(|e| StoreError::CorruptEntry(e.to_string()))?;
        Ok(Some(merged))
    }

    fn append(&mut self, update: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.store.append_entry(&self.doc, update)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.open = false;
        Ok(())
    }
}

/// CPU core count for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
