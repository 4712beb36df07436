//! Merger: folds one dataset's rows and lineage into another.

use tracing::info;

use super::Catalog;
use crate::errors::{CatalogError, CatalogResult};
use crate::models::{merge_column_types, ColumnTypes, DatasetRecord, DatasetStatus};
use crate::store::database::{dataset_table_name, DatasetUpdate};

/// Column types of a shadow dataset or one version of a registered one.
fn column_types_of(dataset: &DatasetRecord, version: Option<i64>) -> CatalogResult<ColumnTypes> {
    match version {
        Some(v) => Ok(dataset.get_version(v)?.custom_column_types.clone()),
        None => Ok(dataset.custom_column_types.clone()),
    }
}

impl Catalog {
    /// Merge `src_name[@src_version]` into `dst_name`.
    ///
    /// A shadow destination is extended in place. A registered destination
    /// gets version `dst_version` (default: next; it must be above the
    /// latest) holding the latest version's rows followed by the source rows. Column types are unioned with the
    /// destination's type winning on collision; dependency edges are unioned
    /// without duplicates.
    pub fn merge_datasets(
        &self,
        src_name: &str,
        dst_name: &str,
        src_version: Option<i64>,
        dst_version: Option<i64>,
    ) -> CatalogResult<DatasetRecord> {
        let src = self.db.get_dataset(src_name)?;
        let dst = self.db.get_dataset(dst_name)?;

        if src.shadow && src_version.is_some() {
            return Err(CatalogError::validation(format!(
                "Source dataset {src_name} is shadow and cannot have a version"
            )));
        }
        if src.registered() && src_version.is_none() {
            return Err(CatalogError::validation(format!(
                "Source dataset {src_name} is registered and must have a version"
            )));
        }
        if dst.shadow && dst_version.is_some() {
            return Err(CatalogError::validation(format!(
                "Destination dataset {dst_name} is shadow and cannot have a version"
            )));
        }
        // Registered destinations merge on top of their latest version into
        // `dst_version` (default: next).
        let target = if dst.registered() {
            let base = dst.latest_version().ok_or_else(|| {
                CatalogError::validation(format!("Dataset {dst_name} has no versions"))
            })?;
            let new_version = dst_version.unwrap_or_else(|| dst.next_version());
            if !dst.is_valid_next_version(new_version) {
                return Err(CatalogError::validation(format!(
                    "Version {new_version} must be higher than the current latest one"
                )));
            }
            Some((base, new_version))
        } else {
            None
        };
        let base_version = target.map(|(base, _)| base);

        let src_types = column_types_of(&src, src_version)?;
        let dst_types = column_types_of(&dst, base_version)?;
        let merged_types = merge_column_types(&src_types, &dst_types);
        let src_table = dataset_table_name(src.id, src_version);

        let merged = self.db.transaction(|s| {
            let src_deps = s.get_direct_dataset_dependencies(&src, src_version)?;
            let dst_deps = s.get_direct_dataset_dependencies(&dst, base_version)?;

            match target {
                None => {
                    s.copy_rows(&src_table, &dataset_table_name(dst.id, None))?;
                    s.update_dataset(
                        dst_name,
                        &DatasetUpdate {
                            custom_column_types: Some(merged_types.clone()),
                            ..Default::default()
                        },
                    )?;
                    for dep in src_deps.iter().filter(|d| !dst_deps.contains(d)) {
                        s.add_dependency(dep, dst_name, None)?;
                    }
                    s.get_dataset(dst_name)
                }
                Some((base_version, new_version)) => {
                    let base = dst.get_version(base_version)?;
                    let dst = s.create_dataset_version(
                        &dst,
                        new_version,
                        &base.sources,
                        &base.query_script,
                        &merged_types,
                        DatasetStatus::Complete,
                        true,
                    )?;
                    let new_table = dataset_table_name(dst.id, Some(new_version));
                    s.copy_rows(&dataset_table_name(dst.id, Some(base_version)), &new_table)?;
                    s.copy_rows(&src_table, &new_table)?;

                    let mut union = dst_deps.clone();
                    for dep in src_deps {
                        if !union.contains(&dep) {
                            union.push(dep);
                        }
                    }
                    for dep in &union {
                        s.add_dependency(dep, dst_name, Some(new_version))?;
                    }
                    s.get_dataset(dst_name)
                }
            }
        })?;

        info!(
            src = %src_name,
            dst = %dst_name,
            version = ?target.map(|(_, v)| v),
            "datasets merged"
        );
        Ok(merged)
    }
}
