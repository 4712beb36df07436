//! In-memory storage and remote doubles shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::catalog::Catalog;
use crate::config::CatalogConfig;
use crate::errors::{CatalogError, CatalogResult};
use crate::indexer::client::{Client, ClientRegistry, FileStream};
use crate::models::{ColumnTypes, DatasetRecord, DatasetRow, DatasetStats, FileMeta};
use crate::remote::protocol::RemoteService;
use crate::store::database::Database;

// ---------------------------------------------------------------------------
// mem:// storage
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BucketState {
    files: Mutex<Vec<(FileMeta, Vec<u8>)>>,
    crawls: AtomicUsize,
    fail_crawls: AtomicBool,
    reject_crawls: Mutex<Option<String>>,
}

/// A `mem://` bucket. Clones share state, so a test keeps one to inspect
/// crawl counts while the registry hands out others.
#[derive(Clone)]
pub struct MemoryBucket {
    uri: String,
    state: Arc<BucketState>,
}

impl MemoryBucket {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            state: Arc::new(BucketState::default()),
        }
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.file_with(path, data, &[])
    }

    /// Add a file carrying custom column values.
    pub fn file_with(self, path: &str, data: &[u8], custom: &[(&str, Value)]) -> Self {
        let meta = FileMeta {
            path: path.to_string(),
            size: data.len() as i64,
            checksum: format!("{:08x}", crc32fast::hash(data)),
            last_modified: "2024-01-01T00:00:00Z".to_string(),
            custom: custom
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<IndexMap<_, _>>(),
        };
        self.state.files.lock().push((meta, data.to_vec()));
        self
    }

    pub fn crawl_count(&self) -> usize {
        self.state.crawls.load(Ordering::SeqCst)
    }

    /// Make crawls fail after yielding their first file.
    pub fn fail_crawls(&self, fail: bool) {
        self.state.fail_crawls.store(fail, Ordering::SeqCst);
    }

    /// Make crawls fail up front with a validation error.
    pub fn reject_crawls(&self, message: Option<&str>) {
        *self.state.reject_crawls.lock() = message.map(str::to_string);
    }
}

impl Client for MemoryBucket {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn crawl(&self, prefix: &str) -> CatalogResult<FileStream<'_>> {
        if let Some(message) = self.state.reject_crawls.lock().clone() {
            return Err(CatalogError::validation(message));
        }
        self.state.crawls.fetch_add(1, Ordering::SeqCst);
        let prefix = prefix.trim_matches('/').to_string();
        let mut files: Vec<CatalogResult<FileMeta>> = self
            .state
            .files
            .lock()
            .iter()
            .filter(|(meta, _)| {
                prefix.is_empty()
                    || meta.path == prefix
                    || meta.path.starts_with(&format!("{prefix}/"))
            })
            .map(|(meta, _)| Ok(meta.clone()))
            .collect();
        if self.state.fail_crawls.load(Ordering::SeqCst) {
            files.truncate(1);
            files.push(Err(CatalogError::Client(format!(
                "{}: connection reset",
                self.uri
            ))));
        }
        Ok(Box::new(files.into_iter()))
    }

    fn clone_handle(&self) -> Arc<dyn Client> {
        Arc::new(self.clone())
    }

    fn fetch_object(&self, path: &str) -> CatalogResult<Vec<u8>> {
        self.state
            .files
            .lock()
            .iter()
            .find(|(meta, _)| meta.path == path)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| CatalogError::Client(format!("{}/{path} not found", self.uri)))
    }
}

/// Registry serving the given buckets under the `mem` scheme.
pub fn memory_registry(buckets: &[MemoryBucket]) -> ClientRegistry {
    let by_uri: HashMap<String, MemoryBucket> = buckets
        .iter()
        .map(|b| (b.uri.clone(), b.clone()))
        .collect();
    let mut registry = ClientRegistry::new();
    registry.register(
        "mem",
        Arc::new(move |uri: &str| -> CatalogResult<Arc<dyn Client>> {
            by_uri
                .get(uri)
                .map(|b| Arc::new(b.clone()) as Arc<dyn Client>)
                .ok_or_else(|| CatalogError::Client(format!("no such bucket: {uri}")))
        }),
    );
    registry
}

/// Catalog over a temp database serving the given `mem://` buckets.
pub fn catalog_with(buckets: &[MemoryBucket]) -> (tempfile::TempDir, Catalog) {
    catalog_with_config(buckets, CatalogConfig::default())
}

pub fn catalog_with_config(buckets: &[MemoryBucket], config: CatalogConfig) -> (tempfile::TempDir, Catalog) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db")).unwrap();
    let catalog = Catalog::new(db, config, memory_registry(buckets));
    (dir, catalog)
}

// ---------------------------------------------------------------------------
// Remote service
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RemoteState {
    datasets: Mutex<HashMap<String, (DatasetRecord, HashMap<i64, Vec<DatasetRow>>)>>,
    fail_offset: Mutex<Option<i64>>,
    chunk_requests: AtomicUsize,
}

/// Bare remote dataset record named `name`.
pub fn dataset_record(name: &str) -> DatasetRecord {
    serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
}

/// Remote service serving datasets from memory.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<RemoteState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `rows` as `version` of `record`.
    pub fn publish(&self, mut record: DatasetRecord, version: i64, columns: ColumnTypes, rows: Vec<DatasetRow>) {
        let mut datasets = self.state.datasets.lock();
        let entry = datasets
            .entry(record.name.clone())
            .or_insert_with(|| (record.clone(), HashMap::new()));
        record.versions = entry.0.versions.clone();
        record.versions.push(crate::models::DatasetVersion {
            id: version,
            dataset_id: record.id,
            version,
            sources: record.sources.clone(),
            query_script: record.query_script.clone(),
            custom_column_types: columns,
            status: crate::models::DatasetStatus::Complete,
            created_at: String::new(),
        });
        entry.0 = record;
        entry.1.insert(version, rows);
    }

    /// Fail the chunk request starting at `offset`.
    pub fn fail_chunk_at(&self, offset: Option<i64>) {
        *self.state.fail_offset.lock() = offset;
    }

    pub fn chunk_requests(&self) -> usize {
        self.state.chunk_requests.load(Ordering::SeqCst)
    }
}

impl RemoteService for FakeRemote {
    fn dataset_info(&self, name: &str) -> CatalogResult<DatasetRecord> {
        self.state
            .datasets
            .lock()
            .get(name)
            .map(|(record, _)| record.clone())
            .ok_or_else(|| CatalogError::Remote(format!("Dataset {name} not found")))
    }

    fn dataset_stats(&self, name: &str, version: i64) -> CatalogResult<DatasetStats> {
        let datasets = self.state.datasets.lock();
        let rows = datasets
            .get(name)
            .and_then(|(_, versions)| versions.get(&version))
            .ok_or_else(|| CatalogError::Remote(format!("Dataset {name}@v{version} not found")))?;
        Ok(DatasetStats {
            num_objects: rows.len() as i64,
            size: rows.iter().map(|r| r.size).sum(),
        })
    }

    fn dataset_rows_chunk(
        &self,
        name: &str,
        version: i64,
        offset: i64,
        limit: i64,
    ) -> CatalogResult<Vec<DatasetRow>> {
        self.state.chunk_requests.fetch_add(1, Ordering::SeqCst);
        if *self.state.fail_offset.lock() == Some(offset) {
            return Err(CatalogError::Remote(format!("chunk at offset {offset} unavailable")));
        }
        let datasets = self.state.datasets.lock();
        let rows = datasets
            .get(name)
            .and_then(|(_, versions)| versions.get(&version))
            .ok_or_else(|| CatalogError::Remote(format!("Dataset {name}@v{version} not found")))?;
        Ok(rows
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn clone_service(&self) -> Arc<dyn RemoteService> {
        Arc::new(self.clone())
    }
}
