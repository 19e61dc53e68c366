//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: replica snapshots (LZ4 compressed), keyed by document id
//! - `metadata`: bincode record: title, sizes, timestamps
//!
//! A document exists iff its metadata row exists. Snapshot and metadata are
//! always written in one batch, and every metadata read-modify-write holds
//! the store's write lock.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{now_millis, Document, DocumentId, DocumentRepository, DocumentSummary, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, saves are infrequent)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("minidoc_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Everything about a document except its snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentMeta {
    title: String,
    /// Uncompressed snapshot size; 0 until the first save
    snapshot_size: u64,
    compressed_size: u64,
    created_at: u64,
    updated_at: u64,
}

impl DocumentMeta {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }

    fn summary(&self, id: DocumentId) -> DocumentSummary {
        DocumentSummary {
            id,
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB document store.
pub struct RocksStore {
    /// Single-threaded column family mode; concurrency comes from tokio
    db: DBWithThreadMode<SingleThreaded>,
    /// Serializes load-modify-store of metadata rows
    writes: Mutex<()>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self {
            db,
            writes: Mutex::new(()),
            config,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn write_lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.writes
            .lock()
            .map_err(|e| StoreError::Database(format!("Write lock poisoned: {e}")))
    }

    fn load_meta(&self, id: &DocumentId) -> Result<DocumentMeta, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => DocumentMeta::decode(&bytes),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    fn load_snapshot(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn put_meta(&self, id: &DocumentId, meta: &DocumentMeta) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .put_cf_opt(&cf, id.as_bytes(), meta.encode()?, &self.write_opts())?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl DocumentRepository for RocksStore {
    fn create(&self, title: &str) -> Result<Document, StoreError> {
        let doc = Document::new(DocumentId::generate(), title);
        let meta = DocumentMeta {
            title: doc.title.clone(),
            snapshot_size: 0,
            compressed_size: 0,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        };
        self.put_meta(&doc.id, &meta)?;
        Ok(doc)
    }

    fn get(&self, id: &DocumentId) -> Result<Document, StoreError> {
        let meta = self.load_meta(id)?;
        Ok(Document {
            id: id.clone(),
            title: meta.title,
            content: self.load_snapshot(id)?,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        })
    }

    fn list(&self) -> Result<Vec<DocumentSummary>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut docs = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let id = std::str::from_utf8(&key)
                .map_err(|_| StoreError::Deserialization("Invalid document key".into()))?;
            docs.push(DocumentMeta::decode(&value)?.summary(DocumentId::new(id)));
        }

        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    fn update_title(&self, id: &DocumentId, title: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock()?;
        let mut meta = self.load_meta(id)?;
        meta.title = title.to_owned();
        meta.updated_at = now_millis();
        self.put_meta(id, &meta)
    }

    fn save_content(&self, id: &DocumentId, content: &[u8]) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.write_lock()?;
        let mut meta = self.load_meta(id)?;
        let compressed = lz4_flex::compress_prepend_size(content);
        meta.snapshot_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        log::debug!(
            "Saved snapshot for {id}: {} bytes ({} compressed)",
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }

    fn delete(&self, id: &DocumentId) -> Result<(), StoreError> {
        let _guard = self.write_lock()?;
        self.load_meta(id)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_DOCUMENTS)?, id.as_bytes());
        batch.delete_cf(&self.cf(CF_METADATA)?, id.as_bytes());
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_create_then_get_has_no_content() {
        let (_dir, store) = open_temp();
        let doc = store.create("Draft").unwrap();
        let loaded = store.get(&doc.id).unwrap();
        assert_eq!(loaded.title, "Draft");
        assert!(loaded.content.is_none());
        assert_eq!(loaded.created_at, doc.created_at);
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let doc = store.create("Draft").unwrap();
        let data = b"Hello, minidoc! A snapshot with enough repetition repetition repetition.".to_vec();

        store.save_content(&doc.id, &data).unwrap();
        let loaded = store.get(&doc.id).unwrap();
        assert_eq!(loaded.content, Some(data));
        assert!(loaded.updated_at >= loaded.created_at);
    }

    #[test]
    fn test_save_replaces_snapshot() {
        let (_dir, store) = open_temp();
        let doc = store.create("Draft").unwrap();
        store.save_content(&doc.id, b"first").unwrap();
        store.save_content(&doc.id, b"second").unwrap();
        assert_eq!(store.get(&doc.id).unwrap().content.as_deref(), Some(&b"second"[..]));
    }

    #[test]
    fn test_missing_document_errors() {
        let (_dir, store) = open_temp();
        let id = DocumentId::new("missing");
        assert!(store.get(&id).unwrap_err().is_not_found());
        assert!(store.save_content(&id, b"x").unwrap_err().is_not_found());
        assert!(store.update_title(&id, "x").unwrap_err().is_not_found());
        assert!(store.delete(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_title_keeps_content() {
        let (_dir, store) = open_temp();
        let doc = store.create("Old").unwrap();
        store.save_content(&doc.id, b"state").unwrap();
        store.update_title(&doc.id, "New").unwrap();

        let loaded = store.get(&doc.id).unwrap();
        assert_eq!(loaded.title, "New");
        assert_eq!(loaded.content.as_deref(), Some(&b"state"[..]));
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, store) = open_temp();
        let ids: Vec<DocumentId> = (0..4).map(|i| store.create(&format!("Doc {i}")).unwrap().id).collect();
        store.save_content(&ids[0], b"data").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 4);
        for id in &ids {
            assert!(listed.iter().any(|d| &d.id == id));
        }

        store.delete(&ids[0]).unwrap();
        assert_eq!(store.list().unwrap().len(), 3);
        assert!(store.get(&ids[0]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_reopen_preserves_documents() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));

        let id = {
            let store = RocksStore::open(config.clone()).unwrap();
            let doc = store.create("Durable").unwrap();
            store.save_content(&doc.id, b"snapshot").unwrap();
            store.flush().unwrap();
            doc.id
        };

        let store = RocksStore::open(config).unwrap();
        let loaded = store.get(&id).unwrap();
        assert_eq!(loaded.title, "Durable");
        assert_eq!(loaded.content.as_deref(), Some(&b"snapshot"[..]));
    }

    #[test]
    fn test_large_snapshot() {
        let (_dir, store) = open_temp();
        let doc = store.create("Big").unwrap();
        let data = vec![42u8; 1_000_000];
        store.save_content(&doc.id, &data).unwrap();

        let loaded = store.get(&doc.id).unwrap().content.unwrap();
        assert_eq!(loaded.len(), 1_000_000);
        assert_eq!(loaded[999_999], 42);
    }

    #[test]
    fn test_title_survives_concurrent_saves() {
        let (_dir, store) = open_temp();
        let doc = store.create("t0").unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..500u32 {
                    store.save_content(&doc.id, &i.to_le_bytes()).unwrap();
                }
            });
            scope.spawn(|| {
                for i in 1..=500 {
                    let title = format!("t{i}");
                    store.update_title(&doc.id, &title).unwrap();
                    assert_eq!(store.get(&doc.id).unwrap().title, title);
                }
            });
        });

        let loaded = store.get(&doc.id).unwrap();
        assert_eq!(loaded.title, "t500");
        assert_eq!(loaded.content.as_deref(), Some(&499u32.to_le_bytes()[..]));
    }

    #[test]
    fn test_save_after_delete_does_not_resurrect() {
        let (_dir, store) = open_temp();
        let doc = store.create("Doomed").unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..200 {
                    let _ = store.save_content(&doc.id, b"late");
                }
            });
            scope.spawn(|| store.delete(&doc.id).unwrap());
        });

        // Whatever interleaving happened, the delete is final
        assert!(store.get(&doc.id).unwrap_err().is_not_found());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(config.sync_writes);
    }
}
