//! The catalog context: one explicit handle threading the metastore, the
//! indexer, configuration, and the optional remote service through every
//! dataset operation.

pub mod datasets;
pub mod lineage;
pub mod merge;
pub mod shadow;
pub mod version;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::CatalogConfig;
use crate::errors::{CatalogError, CatalogResult};
use crate::indexer::client::{ClientRegistry, LocalClient};
use crate::indexer::enlist::Indexer;
use crate::indexer::listing::{DataSource, Listing};
use crate::models::Storage;
use crate::remote::protocol::{RemoteService, StudioClient};
use crate::store::database::Database;

pub const DATASET_INTERNAL_ERROR_MESSAGE: &str = "Internal error on creating dataset";

pub struct Catalog {
    pub(crate) db: Database,
    pub(crate) config: CatalogConfig,
    pub(crate) indexer: Indexer,
    remote: Option<Arc<dyn RemoteService>>,
}

impl Catalog {
    pub fn new(db: Database, config: CatalogConfig, clients: ClientRegistry) -> Self {
        let indexer = Indexer::new(db.clone(), clients, config.ttl_secs);
        Self {
            db,
            config,
            indexer,
            remote: None,
        }
    }

    /// Open the database named by `config` and connect the remote service
    /// when a URL is configured.
    pub fn open(config: CatalogConfig) -> CatalogResult<Self> {
        let db = Database::open(&config.db_path)?;
        let remote: Option<Arc<dyn RemoteService>> = if config.remote.url.trim().is_empty() {
            None
        } else {
            Some(Arc::new(StudioClient::new(&config.remote)?))
        };
        info!(db = %db.db_path().display(), remote = remote.is_some(), "catalog opened");
        let mut catalog = Self::new(db, config, ClientRegistry::new());
        catalog.remote = remote;
        Ok(catalog)
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteService>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub(crate) fn remote(&self) -> CatalogResult<&Arc<dyn RemoteService>> {
        self.remote
            .as_ref()
            .ok_or_else(|| CatalogError::validation("remote service is not configured"))
    }

    // -- indexing ------------------------------------------------------------

    pub fn enlist(
        &self,
        source: &str,
        ttl: Option<i64>,
        force_update: bool,
        skip_indexing: bool,
    ) -> CatalogResult<(Listing, String)> {
        self.indexer.enlist(source, ttl, force_update, skip_indexing)
    }

    pub fn enlist_sources(
        &self,
        sources: &[String],
        ttl: Option<i64>,
        update: bool,
        skip_indexing: bool,
        only_index: bool,
    ) -> CatalogResult<Option<Vec<DataSource>>> {
        self.indexer
            .enlist_sources(sources, ttl, update, skip_indexing, only_index)
    }

    pub fn index(&self, sources: &[String], ttl: Option<i64>, update: bool) -> CatalogResult<()> {
        self.indexer.index(sources, ttl, update)
    }

    // -- storages ------------------------------------------------------------

    /// Register a local directory as a storage without crawling it.
    pub fn add_storage(&self, path: &Path) -> CatalogResult<Storage> {
        let client = LocalClient::new(path)?;
        let uri = crate::indexer::client::Client::uri(&client).to_string();
        self.db
            .with_session(|s| s.create_storage_if_not_registered(&uri))
    }

    pub fn get_storage(&self, uri: &str) -> CatalogResult<Storage> {
        self.db.get_storage(uri)
    }

    pub fn list_storages(&self) -> CatalogResult<Vec<Storage>> {
        self.db.with_session(|s| s.list_storages())
    }

    pub fn ls_storage_uris(&self) -> CatalogResult<Vec<String>> {
        Ok(self.list_storages()?.into_iter().map(|s| s.uri).collect())
    }

    pub fn unlist_source(&self, uri: &str) -> CatalogResult<()> {
        self.indexer.unlist_source(uri)
    }

    /// Mark crawls with no progress for `stale_after_secs` as STALE.
    pub fn find_stale_storages(&self, stale_after_secs: i64) -> CatalogResult<usize> {
        let changed = self
            .db
            .with_session(|s| s.find_stale_storages(stale_after_secs))?;
        if changed > 0 {
            info!(count = changed, "marked stale storages");
        }
        Ok(changed)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("db", &self.db)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StorageStatus;
    use crate::test_support::{catalog_with, MemoryBucket};

    #[test]
    fn storage_management() {
        let bucket = MemoryBucket::new("mem://cats").file("a.jpg", b"a");
        let (dir, catalog) = catalog_with(&[bucket]);
        catalog.index(&["mem://cats".to_string()], None, false).unwrap();

        let local = catalog.add_storage(dir.path()).unwrap();
        assert!(local.uri.starts_with("file://"));
        assert_eq!(local.status, StorageStatus::Created);

        let uris = catalog.ls_storage_uris().unwrap();
        assert_eq!(uris.len(), 2);
        assert_eq!(
            catalog.get_storage("mem://cats").unwrap().status,
            StorageStatus::Complete
        );
        assert_eq!(catalog.find_stale_storages(0).unwrap(), 0);
    }

    #[test]
    fn remote_is_optional() {
        let (_dir, catalog) = catalog_with(&[]);
        assert!(matches!(catalog.remote(), Err(CatalogError::Validation(_))));
    }
}
