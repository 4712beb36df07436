//! Parallel chunked download of a remote dataset version's rows.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use super::protocol::RemoteService;
use crate::errors::{CatalogError, CatalogResult};
use crate::store::database::Database;

/// Chunk start offsets covering `total` rows.
pub fn chunk_offsets(total: i64, chunk_size: i64) -> Vec<i64> {
    if total <= 0 {
        return Vec::new();
    }
    let step = chunk_size.max(1);
    (0..total).step_by(step as usize).collect()
}

/// Fetches row chunks of one remote dataset version into a local row table.
pub struct RowsFetcher {
    remote: Arc<dyn RemoteService>,
    db: Database,
    workers: usize,
    chunk_size: i64,
    progress: Arc<AtomicI64>,
}

impl RowsFetcher {
    pub fn new(remote: Arc<dyn RemoteService>, db: Database, workers: usize, chunk_size: i64) -> Self {
        Self {
            remote,
            db,
            workers: workers.max(1),
            chunk_size: chunk_size.max(1),
            progress: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Rows inserted so far.
    pub fn progress(&self) -> i64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Fetch `total` rows of `name@version` into `table`.
    ///
    /// Each worker thread holds its own service and database handle. The
    /// first failing chunk stops the remaining queue and its error is
    /// returned.
    pub fn run(&self, name: &str, version: i64, total: i64, table: &str) -> CatalogResult<i64> {
        let offsets = chunk_offsets(total, self.chunk_size);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| CatalogError::Client(format!("cannot start fetch workers: {e}")))?;

        pool.install(|| {
            offsets.par_iter().try_for_each_init(
                || (self.remote.clone_service(), self.db.clone_handle()),
                |(remote, db), &offset| {
                    let rows = remote.dataset_rows_chunk(name, version, offset, self.chunk_size)?;
                    let inserted = db.transaction(|s| s.insert_dataset_rows(table, &rows))?;
                    let done = self.progress.fetch_add(inserted as i64, Ordering::Relaxed)
                        + inserted as i64;
                    debug!(dataset = %name, version, offset, rows = inserted, done, total, "fetched rows chunk");
                    Ok::<(), CatalogError>(())
                },
            )
        })?;

        let fetched = self.progress();
        info!(dataset = %name, version, rows = fetched, chunks = offsets.len(), "fetched dataset rows");
        Ok(fetched)
    }
}
