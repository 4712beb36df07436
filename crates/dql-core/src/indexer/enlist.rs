//! Indexer: decides whether a storage index is fresh, drives crawls, and
//! records their outcome.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::{CatalogError, CatalogResult};
use crate::indexer::client::{index_prefix, Client, ClientRegistry};
use crate::indexer::listing::{DataSource, Listing};
use crate::models::{FileMeta, Storage, StorageStatus};
use crate::store::database::{nodes_table_name, Database};

pub const INDEX_INTERNAL_ERROR_MESSAGE: &str = "Internal error on indexing";

/// Message stored on a storage whose crawl failed. Validation errors are the
/// caller's to fix and are shown as is.
fn crawl_error_message(e: &CatalogError) -> String {
    match e {
        CatalogError::Validation(msg) => msg.clone(),
        _ => INDEX_INTERNAL_ERROR_MESSAGE.to_string(),
    }
}

/// Files inserted per statement batch during a crawl.
const CRAWL_BATCH_SIZE: usize = 1_000;

#[derive(Clone, Debug)]
pub struct Indexer {
    db: Database,
    clients: ClientRegistry,
    default_ttl: i64,
}

impl Indexer {
    pub fn new(db: Database, clients: ClientRegistry, default_ttl: i64) -> Self {
        Self {
            db,
            clients,
            default_ttl,
        }
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Bind a source to an index, crawling only when no unexpired index
    /// covers it. Returns the listing and the path inside the storage.
    ///
    /// Fails with [`CatalogError::PendingIndexing`] when another crawl of the
    /// same storage is in progress.
    pub fn enlist(
        &self,
        source: &str,
        ttl: Option<i64>,
        force_update: bool,
        skip_indexing: bool,
    ) -> CatalogResult<(Listing, String)> {
        if force_update && skip_indexing {
            return Err(CatalogError::validation(
                "Both force_update and skip_indexing flags cannot be set at the same time",
            ));
        }
        let ttl = ttl.unwrap_or(self.default_ttl);
        let (client, path) = self.clients.parse_url(source)?;
        let uri = client.uri().to_string();
        let prefix = index_prefix(&path);

        if skip_indexing {
            let (storage, partial_id) = self.db.with_session(|s| {
                let storage = s.create_storage_if_not_registered(&uri)?;
                s.init_id_generator(&format!("partials:{uri}"))?;
                let partial_id = s.get_next_partial_id(&uri)?;
                s.init_nodes_table(&nodes_table_name(storage.id, partial_id))?;
                Ok((storage, partial_id))
            })?;
            debug!(uri = %uri, partial_id, "enlist: indexing skipped");
            return Ok((Listing::new(storage, partial_id, self.db.clone(), client), path));
        }

        let (storage, need_index, in_progress, partial_id) = self
            .db
            .transaction(|s| s.register_storage_for_indexing(&uri, force_update, &prefix))?;

        if in_progress {
            warn!(uri = %uri, "enlist: indexing already in progress");
            return Err(CatalogError::PendingIndexing(uri));
        }

        if !need_index {
            let partial_id = partial_id.ok_or_else(|| {
                CatalogError::Indexing(format!("no valid partial index for {uri}"))
            })?;
            debug!(uri = %uri, prefix = %prefix, partial_id, "enlist: cache hit");
            return Ok((Listing::new(storage, partial_id, self.db.clone(), client), path));
        }

        // The storage is PENDING from here on; every failure must clear it.
        let crawled = self
            .db
            .with_session(|s| s.get_next_partial_id(&uri))
            .and_then(|partial_id| {
                info!(uri = %uri, prefix = %prefix, partial_id, "enlist: crawling");
                let count = self.crawl_into(client.as_ref(), &storage, partial_id, &prefix)?;
                Ok((partial_id, count))
            });
        let partial_id = match crawled {
            Ok((partial_id, count)) => {
                let status = if prefix.is_empty() {
                    StorageStatus::Complete
                } else {
                    StorageStatus::Partial
                };
                self.db.with_session(|s| {
                    s.mark_storage_indexed(&uri, status, ttl, &prefix, Some(partial_id), "", "")
                })?;
                info!(uri = %uri, partial_id, files = count, "enlist: crawl finished");
                partial_id
            }
            Err(e) => {
                warn!(uri = %uri, error = %e, "enlist: crawl failed");
                self.db.with_session(|s| {
                    s.mark_storage_indexed(
                        &uri,
                        StorageStatus::Failed,
                        ttl,
                        &prefix,
                        None,
                        &crawl_error_message(&e),
                        &format!("{e}\n{e:?}"),
                    )
                })?;
                return Err(e);
            }
        };

        let storage = self.db.get_storage(&uri)?;
        Ok((Listing::new(storage, partial_id, self.db.clone(), client), path))
    }

    fn crawl_into(
        &self,
        client: &dyn Client,
        storage: &Storage,
        partial_id: i64,
        prefix: &str,
    ) -> CatalogResult<usize> {
        let table = nodes_table_name(storage.id, partial_id);
        self.db.with_session(|s| {
            s.init_nodes_table(&table)?;
            let mut total = 0usize;
            let mut batch: Vec<FileMeta> = Vec::with_capacity(CRAWL_BATCH_SIZE);
            for file in client.crawl(prefix)? {
                batch.push(file?);
                if batch.len() >= CRAWL_BATCH_SIZE {
                    total += s.insert_nodes(&table, &batch)?;
                    s.update_last_inserted_at(&storage.uri)?;
                    batch.clear();
                }
            }
            if !batch.is_empty() {
                total += s.insert_nodes(&table, &batch)?;
                s.update_last_inserted_at(&storage.uri)?;
            }
            Ok(total)
        })
    }

    /// Enlist every source and expand each path into data sources. With
    /// `only_index` the crawls happen but nothing is expanded.
    pub fn enlist_sources(
        &self,
        sources: &[String],
        ttl: Option<i64>,
        update: bool,
        skip_indexing: bool,
        only_index: bool,
    ) -> CatalogResult<Option<Vec<DataSource>>> {
        let mut enlisted = Vec::new();
        for source in sources {
            let (listing, path) = self.enlist(source, ttl, update, skip_indexing)?;
            if only_index {
                continue;
            }
            for node in listing.expand_path(&path)? {
                enlisted.push(DataSource {
                    listing: listing.clone(),
                    node,
                });
            }
        }
        Ok(if only_index { None } else { Some(enlisted) })
    }

    pub fn index(&self, sources: &[String], ttl: Option<i64>, update: bool) -> CatalogResult<()> {
        self.enlist_sources(sources, ttl, update, false, true)?;
        Ok(())
    }

    /// Listing over the newest valid index of an already-indexed storage.
    pub fn listing_for(&self, storage_uri: &str, prefix: &str) -> CatalogResult<Listing> {
        let (storage, partial_id) = self.db.with_session(|s| {
            let storage = s.get_storage(storage_uri)?;
            let partial_id = s.get_valid_partial_id(storage_uri, prefix)?;
            Ok((storage, partial_id))
        })?;
        let partial_id = partial_id.ok_or_else(|| {
            CatalogError::Indexing(format!("{storage_uri} has no valid index"))
        })?;
        let client: Arc<dyn Client> = self.clients.client_for(storage_uri)?;
        Ok(Listing::new(storage, partial_id, self.db.clone(), client))
    }

    /// Forget the indexes of a storage; its next enlist crawls again.
    pub fn unlist_source(&self, storage_uri: &str) -> CatalogResult<()> {
        self.db.transaction(|s| s.mark_storage_not_indexed(storage_uri))?;
        info!(uri = %storage_uri, "storage unlisted");
        Ok(())
    }
}
