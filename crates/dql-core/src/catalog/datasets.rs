//! Dataset CRUD on top of the metastore.

use tracing::info;

use super::Catalog;
use crate::errors::{CatalogError, CatalogResult};
use crate::models::{DatasetRecord, DatasetRow, DatasetStats, DatasetStatus};
use crate::store::database::{dataset_table_name, DatasetUpdate};

impl Catalog {
    pub fn get_dataset(&self, name: &str) -> CatalogResult<DatasetRecord> {
        self.db.get_dataset(name)
    }

    /// All datasets; `Some(true)` only shadows, `Some(false)` only registered.
    pub fn list_datasets(&self, shadow_only: Option<bool>) -> CatalogResult<Vec<DatasetRecord>> {
        self.db.with_session(|s| s.list_datasets(shadow_only))
    }

    /// Resolve `name[@version]` to its record and row table. A registered
    /// dataset without a version means its latest one.
    pub(crate) fn dataset_table(
        &self,
        name: &str,
        version: Option<i64>,
    ) -> CatalogResult<(DatasetRecord, String)> {
        let dataset = self.db.get_dataset(name)?;
        if dataset.shadow {
            if version.is_some() {
                return Err(CatalogError::validation(format!(
                    "Dataset {name} is shadow and cannot have a version"
                )));
            }
            let table = dataset_table_name(dataset.id, None);
            return Ok((dataset, table));
        }
        let version = match version {
            Some(v) => dataset.get_version(v)?.version,
            None => dataset
                .latest_version()
                .ok_or_else(|| CatalogError::validation(format!("Dataset {name} has no versions")))?,
        };
        let table = dataset_table_name(dataset.id, Some(version));
        Ok((dataset, table))
    }

    pub fn ls_dataset_rows(
        &self,
        name: &str,
        version: Option<i64>,
        offset: Option<i64>,
        limit: Option<i64>,
    ) -> CatalogResult<Vec<DatasetRow>> {
        let (_, table) = self.dataset_table(name, version)?;
        self.db
            .with_session(|s| s.get_dataset_rows(&table, offset, limit))
    }

    pub fn dataset_row(
        &self,
        name: &str,
        row_id: i64,
        version: Option<i64>,
    ) -> CatalogResult<Option<DatasetRow>> {
        let (_, table) = self.dataset_table(name, version)?;
        self.db.with_session(|s| s.get_dataset_row(&table, row_id))
    }

    pub fn dataset_stats(&self, name: &str, version: Option<i64>) -> CatalogResult<DatasetStats> {
        let (_, table) = self.dataset_table(name, version)?;
        self.db.with_session(|s| {
            Ok(DatasetStats {
                num_objects: s.dataset_rows_count(&table)?,
                size: s.dataset_rows_size(&table)?,
            })
        })
    }

    /// Remove a shadow dataset, one version of a registered dataset, or with
    /// `force` every version of it.
    pub fn remove_dataset(&self, name: &str, version: Option<i64>, force: bool) -> CatalogResult<()> {
        let dataset = self.db.get_dataset(name)?;
        if dataset.shadow {
            if version.is_some() {
                return Err(CatalogError::validation(format!(
                    "Dataset {name} is shadow and cannot have a version"
                )));
            }
            self.db
                .transaction(|s| s.remove_shadow_dataset(&dataset, true))?;
            info!(dataset = %name, "shadow dataset removed");
            return Ok(());
        }

        let versions: Vec<i64> = match version {
            Some(v) => vec![dataset.get_version(v)?.version],
            None if force => dataset.versions.iter().map(|v| v.version).collect(),
            None => {
                return Err(CatalogError::validation(format!(
                    "Missing version for registered dataset {name}; use force to remove all versions"
                )))
            }
        };
        self.db.transaction(|s| {
            let mut current = dataset.clone();
            for v in &versions {
                s.remove_dataset_version(&current, *v)?;
                current.versions.retain(|dv| dv.version != *v);
            }
            Ok(())
        })?;
        info!(dataset = %name, versions = ?versions, "dataset versions removed");
        Ok(())
    }

    /// Rename a dataset or change its description/labels.
    pub fn edit_dataset(
        &self,
        name: &str,
        new_name: Option<&str>,
        description: Option<&str>,
        labels: Option<&[String]>,
    ) -> CatalogResult<DatasetRecord> {
        let target = new_name.unwrap_or(name);
        self.db.transaction(|s| {
            s.get_dataset(name)?;
            if target != name && s.find_dataset(target)?.is_some() {
                return Err(CatalogError::validation(format!(
                    "Dataset {target} already exists"
                )));
            }
            s.update_dataset(
                name,
                &DatasetUpdate {
                    name: new_name.filter(|n| *n != name).map(str::to_string),
                    description: description.map(str::to_string),
                    labels: labels.map(<[String]>::to_vec),
                    ..Default::default()
                },
            )?;
            s.get_dataset(target)
        })
    }

    pub fn update_dataset_status(
        &self,
        name: &str,
        status: DatasetStatus,
        error_message: &str,
        error_stack: &str,
        script_output: &str,
    ) -> CatalogResult<DatasetRecord> {
        self.db.with_session(|s| {
            let dataset = s.get_dataset(name)?;
            s.update_dataset_status(&dataset, status, error_message, error_stack, script_output)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{catalog_with, MemoryBucket};

    fn catalog() -> (tempfile::TempDir, Catalog) {
        let bucket = MemoryBucket::new("mem://cats")
            .file("a.jpg", b"aaa")
            .file("sub/b.jpg", b"bb");
        let (dir, catalog) = catalog_with(&[bucket]);
        catalog
            .create_shadow_dataset("cats", &["mem://cats".to_string()], "", true, true)
            .unwrap();
        (dir, catalog)
    }

    #[test]
    fn rows_and_stats() {
        let (_dir, catalog) = catalog();
        let stats = catalog.dataset_stats("cats", None).unwrap();
        assert_eq!(stats, DatasetStats { num_objects: 2, size: 5 });

        let page = catalog.ls_dataset_rows("cats", None, Some(1), Some(10)).unwrap();
        assert_eq!(page.len(), 1);
        let id = page[0].id.unwrap();
        let row = catalog.dataset_row("cats", id, None).unwrap().unwrap();
        assert_eq!(row.path(), page[0].path());
        assert!(catalog.dataset_row("cats", 999, None).unwrap().is_none());
        assert!(catalog.dataset_stats("cats", Some(1)).is_err());
    }

    #[test]
    fn registered_defaults_to_latest_version() {
        let (_dir, catalog) = catalog();
        catalog.register_shadow_dataset("cats", None, None, None, None, true).unwrap();
        assert_eq!(catalog.dataset_stats("cats", None).unwrap().num_objects, 2);
        assert!(matches!(
            catalog.ls_dataset_rows("cats", Some(4), None, None),
            Err(CatalogError::Validation(_))
        ));
        assert_eq!(catalog.list_datasets(Some(false)).unwrap().len(), 1);
        assert!(catalog.list_datasets(Some(true)).unwrap().is_empty());
    }

    #[test]
    fn remove_shadow_drops_table() {
        let (_dir, catalog) = catalog();
        let ds = catalog.get_dataset("cats").unwrap();
        catalog.remove_dataset("cats", None, false).unwrap();
        assert!(matches!(
            catalog.get_dataset("cats"),
            Err(CatalogError::DatasetNotFound(_))
        ));
        catalog
            .db()
            .with_session(|s| {
                assert!(!s.has_table(&dataset_table_name(ds.id, None))?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn remove_registered_versions() {
        let (_dir, catalog) = catalog();
        catalog.register_shadow_dataset("cats", None, None, None, None, true).unwrap();
        catalog
            .create_shadow_dataset("work", &["mem://cats".to_string()], "", true, true)
            .unwrap();
        catalog
            .register_shadow_dataset("work", Some("cats"), None, None, None, true)
            .unwrap();

        assert!(matches!(
            catalog.remove_dataset("cats", None, false),
            Err(CatalogError::Validation(_))
        ));
        catalog.remove_dataset("cats", Some(1), false).unwrap();
        assert_eq!(catalog.get_dataset("cats").unwrap().latest_version(), Some(2));

        catalog.remove_dataset("cats", None, true).unwrap();
        assert!(catalog.db().find_dataset("cats").unwrap().is_none());
    }

    #[test]
    fn edit_renames_and_labels() {
        let (_dir, catalog) = catalog();
        catalog
            .create_shadow_dataset("other", &[], "", true, false)
            .unwrap();
        assert!(catalog.edit_dataset("cats", Some("other"), None, None).is_err());

        let labels = vec!["a".to_string(), "b".to_string()];
        let ds = catalog
            .edit_dataset("cats", Some("felines"), Some("desc"), Some(&labels))
            .unwrap();
        assert_eq!(ds.name, "felines");
        assert_eq!(ds.labels, labels);
        // Row table is keyed by id, so rows survive the rename.
        assert_eq!(catalog.dataset_stats("felines", None).unwrap().num_objects, 2);
    }

    #[test]
    fn status_updates_stamp_final_fields() {
        let (_dir, catalog) = catalog();
        let ds = catalog
            .update_dataset_status("cats", DatasetStatus::Failed, "boom", "trace", "out")
            .unwrap();
        assert_eq!(ds.status, DatasetStatus::Failed);
        assert_eq!(ds.error_message, "boom");
        assert_eq!(ds.script_output, "out");
        assert!(ds.finished_at.is_some());
    }
}
