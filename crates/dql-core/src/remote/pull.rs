//! Remote Sync: download a remote dataset version and register it locally.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::fetcher::RowsFetcher;
use crate::catalog::Catalog;
use crate::errors::{CatalogError, CatalogResult};
use crate::indexer::client::Client;
use crate::models::{parse_dataset_uri, DatasetRecord, DatasetStatus, DirType};
use crate::store::database::{dataset_table_name, row_path, DatasetUpdate};

fn temp_shadow_name() -> String {
    format!("shadow_ds_{:016x}", rand::random::<u64>())
}

impl Catalog {
    /// Metadata of a dataset on the remote service.
    pub fn get_remote_dataset(&self, name: &str) -> CatalogResult<DatasetRecord> {
        self.remote()?.dataset_info(name)
    }

    /// Pull `ds://name[@vN]` (default: the remote's latest version) into the
    /// local catalog, then write its objects under `output_dir` if given.
    ///
    /// Rows land in a randomly named shadow first; only a complete download
    /// is registered, under the remote's version number. `force` overwrites
    /// files that already exist under `output_dir`.
    pub fn pull_dataset(&self, uri: &str, output_dir: Option<&Path>, force: bool) -> CatalogResult<()> {
        let (name, version) = parse_dataset_uri(uri)?;
        let remote = self.remote()?.clone();

        let local = self.db.find_dataset(&name)?;
        if local.as_ref().is_some_and(|ds| ds.shadow) {
            return Err(CatalogError::validation(format!(
                "Local shadow dataset {name} already exists"
            )));
        }

        let info = remote.dataset_info(&name)?;
        let version = match version {
            Some(v) => v,
            None => info.latest_version().ok_or_else(|| {
                CatalogError::Remote(format!("Dataset {name} has no published versions"))
            })?,
        };
        let remote_version = info.get_version(version)?.clone();

        if local.is_some_and(|ds| ds.has_version(version)) {
            info!(dataset = %name, version, "local copy exists, skipping fetch");
        } else {
            let stats = remote.dataset_stats(&name, version)?;
            let mut tmp_name = temp_shadow_name();
            while self.db.find_dataset(&tmp_name)?.is_some() {
                tmp_name = temp_shadow_name();
            }
            let sources = remote_version
                .sources
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>();
            let tmp = self.db.with_session(|s| {
                s.create_shadow_dataset(
                    &tmp_name,
                    &sources,
                    &remote_version.query_script,
                    true,
                    &remote_version.custom_column_types,
                )
            })?;
            info!(dataset = %name, version, rows = stats.num_objects, shadow = %tmp_name, "pulling dataset");

            let fetcher = RowsFetcher::new(
                remote.clone(),
                self.db.clone_handle(),
                self.config.pull.workers,
                self.config.pull.chunk_size,
            );
            let table = dataset_table_name(tmp.id, None);
            let registered = fetcher
                .run(&name, version, stats.num_objects, &table)
                .and_then(|_| {
                    self.db.with_session(|s| {
                        s.update_dataset_status(&tmp, DatasetStatus::Complete, "", "", "")?;
                        if !info.error_message.is_empty() || !info.error_stack.is_empty() {
                            s.update_dataset(
                                &tmp_name,
                                &DatasetUpdate {
                                    error_message: Some(info.error_message.clone()),
                                    error_stack: Some(info.error_stack.clone()),
                                    ..Default::default()
                                },
                            )?;
                        }
                        Ok(())
                    })?;
                    self.register_shadow_dataset(
                        &tmp_name,
                        Some(&name),
                        Some(version),
                        info.description.as_deref(),
                        Some(info.labels.as_slice()),
                        false,
                    )
                });
            if let Err(e) = registered {
                warn!(dataset = %name, version, error = %e, "pull failed, removing partial download");
                self.discard_partial_pull(&tmp_name);
                return Err(e);
            }
        }

        if let Some(dir) = output_dir {
            self.materialize_dataset(&name, version, dir, force)?;
        }
        Ok(())
    }

    /// Drop the throwaway shadow of a failed pull, if it still exists.
    fn discard_partial_pull(&self, tmp_name: &str) {
        let removed = self.db.transaction(|s| match s.find_dataset(tmp_name)? {
            Some(tmp) if tmp.shadow => s.remove_shadow_dataset(&tmp, true),
            _ => Ok(()),
        });
        if let Err(e) = removed {
            warn!(shadow = %tmp_name, error = %e, "cleanup of partial download failed");
        }
    }

    /// Write every file row of `name@version` under `output_dir`, fetching
    /// objects through the client of the row's source.
    fn materialize_dataset(
        &self,
        name: &str,
        version: i64,
        output_dir: &Path,
        force: bool,
    ) -> CatalogResult<usize> {
        let (_, table) = self.dataset_table(name, Some(version))?;
        let page = self.config.pull.chunk_size.max(1);
        let mut clients: HashMap<String, Arc<dyn Client>> = HashMap::new();
        let mut written = 0usize;
        let mut offset = 0;
        loop {
            let rows = self
                .db
                .with_session(|s| s.get_dataset_rows(&table, Some(offset), Some(page)))?;
            if rows.is_empty() {
                break;
            }
            offset += rows.len() as i64;
            for row in rows.iter().filter(|r| r.dir_type == DirType::File) {
                let rel = row_path(row);
                let dest = output_dir.join(&rel);
                if dest.exists() && !force {
                    debug!(path = %dest.display(), "keeping existing file");
                    continue;
                }
                let client = match clients.get(&row.source) {
                    Some(client) => client.clone(),
                    None => {
                        let client = self.indexer.clients().client_for(&row.source)?;
                        clients.insert(row.source.clone(), client.clone());
                        client
                    }
                };
                let data = client.fetch_object(&rel)?;
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, data)?;
                written += 1;
            }
        }
        info!(dataset = %name, version, files = written, dir = %output_dir.display(), "dataset materialized");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::CatalogConfig;
    use crate::models::{ColumnType, ColumnTypes, DatasetRow};
    use crate::test_support::{catalog_with, catalog_with_config, dataset_record, FakeRemote, MemoryBucket};

    fn remote_rows(n: usize) -> Vec<DatasetRow> {
        (0..n)
            .map(|i| {
                let mut row = DatasetRow {
                    source: "mem://remote".to_string(),
                    parent: "dir".to_string(),
                    name: format!("f{i}.txt"),
                    size: 2,
                    ..Default::default()
                };
                row.custom.insert("score".to_string(), json!(i));
                row
            })
            .collect()
    }

    fn setup(n: usize) -> (tempfile::TempDir, Catalog, FakeRemote) {
        let mut bucket = MemoryBucket::new("mem://remote");
        for i in 0..n {
            bucket = bucket.file(&format!("dir/f{i}.txt"), format!("{i:02}").as_bytes());
        }
        let remote = FakeRemote::new();
        let mut record = dataset_record("cats");
        record.sources = "mem://remote/dir mem://remote/extra".to_string();
        record.query_script = "ds".to_string();
        record.description = Some("cat pictures".to_string());
        record.labels = vec!["pets".to_string()];
        let columns: ColumnTypes = [("score".to_string(), ColumnType::Int)].into_iter().collect();
        remote.publish(record.clone(), 1, columns.clone(), remote_rows(n));
        remote.publish(record, 3, columns, remote_rows(n + 2));

        let mut config = CatalogConfig::default();
        config.pull.chunk_size = 4;
        config.pull.workers = 2;
        let (dir, catalog) = catalog_with_config(&[bucket], config);
        (dir, catalog.with_remote(Arc::new(remote.clone())), remote)
    }

    #[test]
    fn pulls_latest_version_with_remote_number() {
        let (_dir, catalog, remote) = setup(10);
        catalog.pull_dataset("ds://cats", None, false).unwrap();

        let ds = catalog.get_dataset("cats").unwrap();
        assert!(ds.registered());
        assert_eq!(ds.latest_version(), Some(3));
        let v = ds.get_version(3).unwrap();
        assert_eq!(v.query_script, "ds");
        assert_eq!(v.sources, "mem://remote/dir\nmem://remote/extra");
        assert_eq!(v.custom_column_types["score"], ColumnType::Int);
        assert_eq!(catalog.dataset_stats("cats", Some(3)).unwrap().num_objects, 12);
        assert_eq!(remote.chunk_requests(), 3);
        assert_eq!(ds.description.as_deref(), Some("cat pictures"));
        assert_eq!(ds.labels, vec!["pets".to_string()]);
        assert!(catalog.list_datasets(Some(true)).unwrap().is_empty());

        // Older versions can still be pulled afterwards.
        catalog.pull_dataset("ds://cats@v1", None, false).unwrap();
        assert_eq!(catalog.dataset_stats("cats", Some(1)).unwrap().num_objects, 10);
    }

    #[test]
    fn existing_local_version_skips_fetch() {
        let (_dir, catalog, remote) = setup(4);
        catalog.pull_dataset("ds://cats@v1", None, false).unwrap();
        let requests = remote.chunk_requests();
        catalog.pull_dataset("ds://cats@v1", None, false).unwrap();
        assert_eq!(remote.chunk_requests(), requests);
    }

    #[test]
    fn chunk_failure_leaves_nothing_behind() {
        let (_dir, catalog, remote) = setup(10);
        remote.fail_chunk_at(Some(4));
        let err = catalog.pull_dataset("ds://cats@v1", None, false).unwrap_err();
        assert!(matches!(err, CatalogError::Remote(_)));
        assert!(catalog.list_datasets(None).unwrap().is_empty());
    }

    #[test]
    fn registration_failure_leaves_nothing_behind() {
        let (_dir, catalog, remote) = setup(3);
        let mut record = dataset_record("cats");
        record.sources = "mem://remote/dir".to_string();
        remote.publish(record, 0, ColumnTypes::new(), remote_rows(3));

        let err = catalog.pull_dataset("ds://cats@v0", None, false).unwrap_err();
        assert!(matches!(err, CatalogError::Validation(_)));
        assert!(remote.chunk_requests() > 0);
        assert!(catalog.list_datasets(None).unwrap().is_empty());
    }

    #[test]
    fn local_shadow_blocks_pull() {
        let (_dir, catalog, _remote) = setup(1);
        catalog.create_shadow_dataset("cats", &[], "", true, false).unwrap();
        assert!(matches!(
            catalog.pull_dataset("ds://cats", None, false),
            Err(CatalogError::Validation(_))
        ));
    }

    #[test]
    fn materializes_objects() {
        let (dir, catalog, _remote) = setup(3);
        let out = dir.path().join("out");
        catalog.pull_dataset("ds://cats@v1", Some(&out), false).unwrap();
        assert_eq!(std::fs::read(out.join("dir/f1.txt")).unwrap(), b"01");

        std::fs::write(out.join("dir/f2.txt"), b"local").unwrap();
        catalog.pull_dataset("ds://cats@v1", Some(&out), false).unwrap();
        assert_eq!(std::fs::read(out.join("dir/f2.txt")).unwrap(), b"local");
        catalog.pull_dataset("ds://cats@v1", Some(&out), true).unwrap();
        assert_eq!(std::fs::read(out.join("dir/f2.txt")).unwrap(), b"02");
    }

    #[test]
    fn remote_info_requires_service() {
        let (_dir, catalog) = catalog_with(&[]);
        assert!(catalog.get_remote_dataset("cats").is_err());
        let (_dir, catalog, _remote) = setup(1);
        assert_eq!(catalog.get_remote_dataset("cats").unwrap().versions.len(), 2);
    }
}
