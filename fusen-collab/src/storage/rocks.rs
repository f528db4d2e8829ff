//! RocksDB-backed durable key-value store.
//!
//! Column families:
//! - `notes` — bincode-encoded note records, keyed by `fusen/<id>`
//!
//! Note values are ~100 bytes, so the column family leans on point-lookup
//! tuning and LZ4 block compression rather than any value-level compression.
//!
//! Performance targets:
//! - Open (10k notes): <100ms (bloom filters + block cache)
//! - Point read (cache hit): <1ms
//! - Mirror write (no fsync): <50μs
//! - Full prefix scan on recovery (10k notes): <500ms
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::kv::{KvBackend, KvError};

/// Column family holding note records.
const CF_NOTES: &str = "notes";

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
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fusen_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// RocksDB implementation of the [`KvBackend`] seam.
pub struct RocksKv {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
}

impl RocksKv {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column family if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, KvError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors = vec![ColumnFamilyDescriptor::new(
            CF_NOTES,
            Self::cf_options(&config),
        )];

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Build the `notes` column family options.
    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        // Block-based table with bloom filter and cache
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        // LZ4 compression — fast decompression for recovery scans
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        // Small values, read mostly by exact key
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get the notes column family handle.
    fn cf(&self) -> Result<&rocksdb::ColumnFamily, KvError> {
        self.db
            .cf_handle(CF_NOTES)
            .ok_or_else(|| KvError::BackendError(format!("Column family '{CF_NOTES}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl KvBackend for RocksKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let cf = self.cf()?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let cf = self.cf()?;
        self.db
            .put_cf_opt(&cf, key.as_bytes(), value, &self.write_options())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        let cf = self.cf()?;
        self.db
            .delete_cf_opt(&cf, key.as_bytes(), &self.write_options())?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let cf = self.cf()?;
        let mut pairs = Vec::new();

        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| KvError::BackendError(e.to_string()))?;

            // Stop once past the prefix range — keys iterate in order.
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }

            let key = String::from_utf8_lossy(&key).into_owned();
            pairs.push((key, value.to_vec()));
        }

        Ok(pairs)
    }
}

impl From<rocksdb::Error> for KvError {
    fn from(e: rocksdb::Error) -> Self {
        KvError::BackendError(e.to_string())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
