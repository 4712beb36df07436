//! Shadow Builder: mutable working datasets populated from indexed sources.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Catalog, DATASET_INTERNAL_ERROR_MESSAGE};
use crate::errors::{CatalogError, CatalogResult};
use crate::indexer::listing::{DataSource, Listing};
use crate::models::{
    join_path, merge_column_types, ColumnTypes, DatasetRecord, DatasetStatus, Node,
    SourceDescriptor,
};
use crate::store::database::dataset_table_name;

/// Rows a source contributes, grouped by where they come from.
#[derive(Clone, Debug)]
pub enum SourceGroup {
    /// Entries of one storage index.
    Storage {
        listing: Listing,
        entries: Vec<DataSource>,
    },
    /// A whole registered dataset version.
    Dataset { name: String, version: i64 },
}

#[derive(Deserialize)]
struct IndexFileEntry {
    #[serde(rename = "data-source")]
    data_source: IndexFileSource,
    #[serde(default)]
    files: Vec<IndexFileItem>,
}

#[derive(Deserialize)]
struct IndexFileSource {
    uri: String,
}

#[derive(Deserialize)]
struct IndexFileItem {
    name: String,
}

impl Catalog {
    /// Enlist a source and group the entries it names.
    pub fn resolve_source_groups(&self, source: &SourceDescriptor) -> CatalogResult<Vec<SourceGroup>> {
        match source {
            SourceDescriptor::Cloud(uri) => {
                let (listing, path) = self.enlist(uri, None, false, false)?;
                let entries = listing
                    .expand_path(&path)?
                    .into_iter()
                    .map(|node| DataSource {
                        listing: listing.clone(),
                        node,
                    })
                    .collect();
                Ok(vec![SourceGroup::Storage { listing, entries }])
            }
            SourceDescriptor::LocalIndex(path) => self.resolve_index_file(path),
            SourceDescriptor::RegisteredDataset { name, version } => {
                let dataset = self.db.get_dataset(name)?;
                if dataset.shadow {
                    return Err(CatalogError::validation(format!(
                        "Dataset {name} is not registered"
                    )));
                }
                let version = match version {
                    Some(v) => dataset.get_version(*v)?.version,
                    None => dataset.latest_version().ok_or_else(|| {
                        CatalogError::validation(format!("Dataset {name} has no versions"))
                    })?,
                };
                Ok(vec![SourceGroup::Dataset {
                    name: name.clone(),
                    version,
                }])
            }
        }
    }

    /// Groups named by a `.edql` file: a YAML list of `data-source` entries,
    /// each optionally restricted to the `files` listed under it.
    fn resolve_index_file(&self, path: &Path) -> CatalogResult<Vec<SourceGroup>> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<IndexFileEntry> = serde_yaml::from_str(&raw)?;
        let mut groups = Vec::with_capacity(entries.len());
        for entry in entries {
            let (listing, base) = self.enlist(&entry.data_source.uri, None, false, false)?;
            let nodes: Vec<Node> = if entry.files.is_empty() {
                listing.expand_path(&base)?
            } else {
                entry
                    .files
                    .iter()
                    .map(|f| listing.resolve_path(&join_path(&base, f.name.trim_matches('/'))))
                    .collect::<CatalogResult<_>>()?
            };
            let entries = nodes
                .into_iter()
                .map(|node| DataSource {
                    listing: listing.clone(),
                    node,
                })
                .collect();
            groups.push(SourceGroup::Storage { listing, entries });
        }
        Ok(groups)
    }

    fn group_custom_columns(&self, group: &SourceGroup) -> CatalogResult<ColumnTypes> {
        match group {
            SourceGroup::Storage { listing, .. } => listing.custom_columns(),
            SourceGroup::Dataset { name, version } => Ok(self
                .db
                .get_dataset(name)?
                .get_version(*version)?
                .custom_column_types
                .clone()),
        }
    }

    /// Create (or reuse) the shadow dataset `name` and fill it from `sources`.
    ///
    /// Every source is resolved first and the row table widened to the union
    /// of their custom columns before any row is inserted. The final
    /// COMPLETE/FAILED status is written even when resolution or insertion
    /// fails; the failure is then returned.
    pub fn create_shadow_dataset(
        &self,
        name: &str,
        sources: &[String],
        query_script: &str,
        recursive: bool,
        populate: bool,
    ) -> CatalogResult<DatasetRecord> {
        let descriptors = sources
            .iter()
            .map(|s| SourceDescriptor::parse(s))
            .collect::<CatalogResult<Vec<_>>>()?;

        let dataset = self.db.with_session(|s| {
            s.create_shadow_dataset(name, sources, query_script, true, &ColumnTypes::new())
        })?;
        if !populate {
            return Ok(dataset);
        }

        let dataset = self
            .db
            .with_session(|s| s.update_dataset_status(&dataset, DatasetStatus::Pending, "", "", ""))?;
        let populated = self.populate_shadow(&dataset, &descriptors, recursive);

        let dataset = match &populated {
            Ok(rows) => {
                info!(dataset = %name, rows, "shadow dataset populated");
                self.db.with_session(|s| {
                    s.update_dataset_status(&dataset, DatasetStatus::Complete, "", "", "")
                })?
            }
            Err(e) => {
                warn!(dataset = %name, error = %e, "shadow dataset population failed");
                self.db.with_session(|s| {
                    s.update_dataset_status(
                        &dataset,
                        DatasetStatus::Failed,
                        DATASET_INTERNAL_ERROR_MESSAGE,
                        &format!("{e}\n{e:?}"),
                        "",
                    )
                })?
            }
        };
        populated?;
        Ok(dataset)
    }

    fn populate_shadow(
        &self,
        dataset: &DatasetRecord,
        descriptors: &[SourceDescriptor],
        recursive: bool,
    ) -> CatalogResult<usize> {
        let mut groups = Vec::new();
        for descriptor in descriptors {
            groups.extend(self.resolve_source_groups(descriptor)?);
        }
        let mut custom_columns = ColumnTypes::new();
        for group in &groups {
            custom_columns = merge_column_types(&custom_columns, &self.group_custom_columns(group)?);
        }
        // Reusing the shadow widens its row table and column map.
        self.db.with_session(|s| {
            s.create_shadow_dataset(&dataset.name, &[], "", true, &custom_columns)
        })?;

        let table = dataset_table_name(dataset.id, None);
        let existing = self
            .db
            .with_session(|s| s.get_direct_dataset_dependencies(dataset, None))?;
        let mut recorded: HashSet<(String, String)> = existing
            .into_iter()
            .map(|d| (d.name, d.version))
            .collect();
        let mut total = 0usize;

        for group in groups {
            match group {
                SourceGroup::Storage { listing, entries } => {
                    let mut files = Vec::new();
                    for entry in &entries {
                        files.extend(entry.files(recursive)?);
                    }
                    let storage = &listing.storage;
                    let timestamp = storage.timestamp_str();
                    let edge = (storage.uri.clone(), timestamp.clone().unwrap_or_default());
                    total += self.db.transaction(|s| {
                        let inserted = s.insert_nodes_as_rows(&table, &storage.uri, &files)?;
                        if !recorded.contains(&edge) {
                            s.add_storage_dependency(&dataset.name, None, &storage.uri, timestamp.clone())?;
                        }
                        Ok(inserted)
                    })?;
                    recorded.insert(edge);
                    debug!(dataset = %dataset.name, storage = %storage.uri, files = files.len(), "inserted source rows");
                }
                SourceGroup::Dataset { name, version } => {
                    let source = self.db.get_dataset(&name)?;
                    let src_table = dataset_table_name(source.id, Some(version));
                    let edge = (name.clone(), version.to_string());
                    total += self.db.transaction(|s| {
                        let copied = s.copy_rows(&src_table, &table)?;
                        if !recorded.contains(&edge) {
                            s.add_dataset_dependency(&dataset.name, None, &name, Some(version))?;
                        }
                        Ok(copied)
                    })?;
                    recorded.insert(edge);
                }
            }
        }
        Ok(total)
    }

    /// Duplicate a shadow dataset (rows, columns, and edges) under a new name.
    pub fn copy_shadow_dataset(&self, src_name: &str, dst_name: &str) -> CatalogResult<DatasetRecord> {
        let src = self.db.get_dataset(src_name)?;
        if !src.shadow {
            return Err(CatalogError::validation(format!(
                "Dataset {src_name} is not a shadow dataset"
            )));
        }
        if self.db.find_dataset(dst_name)?.is_some() {
            return Err(CatalogError::validation(format!(
                "Dataset {dst_name} already exists"
            )));
        }
        self.db.transaction(|s| {
            let dst = s.create_shadow_dataset(
                dst_name,
                &src.sources_list(),
                &src.query_script,
                true,
                &src.custom_column_types,
            )?;
            s.copy_rows(
                &dataset_table_name(src.id, None),
                &dataset_table_name(dst.id, None),
            )?;
            for dep in s.get_direct_dataset_dependencies(&src, None)? {
                s.add_dependency(&dep, dst_name, None)?;
            }
            s.update_dataset_status(&dst, src.status, &src.error_message, &src.error_stack, &src.script_output)
        })
    }
}
