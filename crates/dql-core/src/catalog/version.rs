//! Version Manager: promotes shadow datasets into immutable versions.

use tracing::info;

use super::Catalog;
use crate::errors::{CatalogError, CatalogResult};
use crate::models::{DatasetStatus, DatasetVersion};
use crate::store::database::{dataset_table_name, DatasetUpdate};

impl Catalog {
    /// Promote shadow `shadow_name` into a version of `registered_name`
    /// (default: the shadow's own name).
    ///
    /// When the registered dataset exists the shadow's row table is renamed
    /// into place as version `version` (default: latest + 1) and the shadow
    /// record is deleted. Otherwise the shadow record itself becomes the
    /// registered dataset, starting at `version` (default 1). Row table,
    /// metadata, and edge rewrites commit together or not at all.
    ///
    /// `validate_version = false` accepts any unused version number, which is
    /// how pulls keep the number the remote assigned.
    pub fn register_shadow_dataset(
        &self,
        shadow_name: &str,
        registered_name: Option<&str>,
        version: Option<i64>,
        description: Option<&str>,
        labels: Option<&[String]>,
        validate_version: bool,
    ) -> CatalogResult<DatasetVersion> {
        let target_name = registered_name.unwrap_or(shadow_name);

        let registered = self.db.transaction(|s| {
            let shadow = s.get_dataset(shadow_name)?;
            if !shadow.shadow {
                return Err(CatalogError::validation(format!(
                    "Dataset {shadow_name} is not a shadow dataset"
                )));
            }
            let shadow_table = dataset_table_name(shadow.id, None);

            match s.find_dataset(target_name)? {
                Some(target) if target.registered() => {
                    let version = version.unwrap_or_else(|| target.next_version());
                    if validate_version && !target.is_valid_next_version(version) {
                        return Err(CatalogError::validation(format!(
                            "Version {version} of dataset {target_name} must be higher than the current latest one"
                        )));
                    }
                    if target.has_version(version) {
                        return Err(CatalogError::validation(format!(
                            "Version {version} of dataset {target_name} already exists"
                        )));
                    }
                    let target = s.create_dataset_version(
                        &target,
                        version,
                        &shadow.sources,
                        &shadow.query_script,
                        &shadow.custom_column_types,
                        DatasetStatus::Complete,
                        false,
                    )?;
                    s.rename_table(&shadow_table, &dataset_table_name(target.id, Some(version)))?;
                    let version_id = target.get_version(version)?.id;
                    s.update_dataset_dependency_source(shadow.id, None, target.id, Some(version_id))?;
                    s.remove_shadow_dataset(&shadow, false)?;
                    if description.is_some() || labels.is_some() {
                        s.update_dataset(
                            target_name,
                            &DatasetUpdate {
                                description: description.map(str::to_string),
                                labels: labels.map(<[String]>::to_vec),
                                ..Default::default()
                            },
                        )?;
                    }
                    Ok((target_name.to_string(), version))
                }
                Some(target) if target.id != shadow.id => Err(CatalogError::validation(format!(
                    "Shadow dataset with name {target_name} already exists"
                ))),
                _ => {
                    let version = version.unwrap_or(1);
                    if version < 1 {
                        return Err(CatalogError::validation(format!(
                            "Version {version} must be a positive number"
                        )));
                    }
                    s.update_dataset(
                        shadow_name,
                        &DatasetUpdate {
                            name: Some(target_name.to_string()),
                            shadow: Some(false),
                            description: description.map(str::to_string),
                            labels: labels.map(<[String]>::to_vec),
                            sources: Some(String::new()),
                            query_script: Some(String::new()),
                            ..Default::default()
                        },
                    )?;
                    let target = s.get_dataset(target_name)?;
                    let target = s.create_dataset_version(
                        &target,
                        version,
                        &shadow.sources,
                        &shadow.query_script,
                        &shadow.custom_column_types,
                        DatasetStatus::Complete,
                        false,
                    )?;
                    s.rename_table(&shadow_table, &dataset_table_name(target.id, Some(version)))?;
                    let version_id = target.get_version(version)?.id;
                    s.update_dataset_dependency_source(shadow.id, None, target.id, Some(version_id))?;
                    Ok((target_name.to_string(), version))
                }
            }
        });

        let (name, version) = registered?;
        info!(shadow = %shadow_name, dataset = %name, version, "shadow dataset registered");
        let dataset = self.db.get_dataset(&name)?;
        Ok(dataset.get_version(version)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::models::{ColumnTypes, DependencyKind};
    use crate::test_support::{catalog_with, MemoryBucket};

    fn bucket() -> MemoryBucket {
        MemoryBucket::new("mem://cats")
            .file("a.jpg", b"a")
            .file("b.jpg", b"bb")
    }

    fn make_shadow(catalog: &Catalog, name: &str) {
        catalog
            .create_shadow_dataset(name, &["mem://cats".to_string()], "print(1)", true, true)
            .unwrap();
    }

    #[test]
    fn first_registration_converts_shadow_in_place() {
        let (_dir, catalog) = catalog_with(&[bucket()]);
        make_shadow(&catalog, "work");
        let shadow_id = catalog.get_dataset("work").unwrap().id;

        let labels = vec!["pets".to_string()];
        let v = catalog
            .register_shadow_dataset("work", Some("cats"), None, Some("all cats"), Some(&labels), true)
            .unwrap();
        assert_eq!(v.version, 1);
        assert_eq!(v.query_script, "print(1)");

        let ds = catalog.get_dataset("cats").unwrap();
        assert_eq!(ds.id, shadow_id);
        assert!(ds.registered());
        assert_eq!(ds.description.as_deref(), Some("all cats"));
        assert_eq!(ds.labels, labels);
        assert!(ds.sources.is_empty());
        assert!(ds.query_script.is_empty());
        assert!(catalog.db().find_dataset("work").unwrap().is_none());
        assert_eq!(catalog.dataset_stats("cats", Some(1)).unwrap().num_objects, 2);

        let deps = catalog.get_dataset_dependencies("cats", Some(1), false).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].kind, DependencyKind::Storage);
    }

    #[test]
    fn later_registration_renames_table_and_moves_edges() {
        let (_dir, catalog) = catalog_with(&[bucket()]);
        make_shadow(&catalog, "cats");
        catalog.register_shadow_dataset("cats", None, None, None, None, true).unwrap();
        make_shadow(&catalog, "work");
        let shadow = catalog.get_dataset("work").unwrap();

        let v = catalog
            .register_shadow_dataset("work", Some("cats"), None, None, None, true)
            .unwrap();
        assert_eq!(v.version, 2);
        assert!(catalog.db().find_dataset("work").unwrap().is_none());
        catalog
            .db()
            .with_session(|s| {
                assert!(!s.has_table(&dataset_table_name(shadow.id, None))?);
                Ok(())
            })
            .unwrap();
        assert_eq!(catalog.dataset_stats("cats", Some(2)).unwrap().num_objects, 2);
        assert_eq!(catalog.get_dataset_dependencies("cats", Some(2), false).unwrap().len(), 1);
    }

    #[test]
    fn explicit_version_must_increase() {
        let (_dir, catalog) = catalog_with(&[bucket()]);
        make_shadow(&catalog, "cats");
        catalog.register_shadow_dataset("cats", None, Some(5), None, None, true).unwrap();

        make_shadow(&catalog, "work");
        let err = catalog
            .register_shadow_dataset("work", Some("cats"), Some(3), None, None, true)
            .unwrap_err();
        assert!(matches!(err, CatalogError::Validation(_)));
        // Nothing changed.
        assert!(catalog.get_dataset("work").unwrap().shadow);
        assert_eq!(catalog.get_dataset("cats").unwrap().versions.len(), 1);

        // Without validation a lower unused number is accepted.
        let v = catalog
            .register_shadow_dataset("work", Some("cats"), Some(3), None, None, false)
            .unwrap();
        assert_eq!(v.version, 3);
        assert_eq!(catalog.get_dataset("cats").unwrap().latest_version(), Some(5));
    }

    #[test]
    fn existing_version_is_rejected_even_unvalidated() {
        let (_dir, catalog) = catalog_with(&[bucket()]);
        make_shadow(&catalog, "cats");
        catalog.register_shadow_dataset("cats", None, None, None, None, true).unwrap();
        make_shadow(&catalog, "work");
        assert!(catalog
            .register_shadow_dataset("work", Some("cats"), Some(1), None, None, false)
            .is_err());
    }

    #[test]
    fn failed_promotion_leaves_shadow_untouched() {
        let (_dir, catalog) = catalog_with(&[bucket()]);
        make_shadow(&catalog, "cats");
        catalog.register_shadow_dataset("cats", None, None, None, None, true).unwrap();
        make_shadow(&catalog, "work");
        let cats = catalog.get_dataset("cats").unwrap();

        // Occupy the table name version 2 would be renamed to.
        catalog
            .db()
            .with_session(|s| s.create_dataset_rows_table(&dataset_table_name(cats.id, Some(2)), &ColumnTypes::new()))
            .unwrap();
        assert!(catalog
            .register_shadow_dataset("work", Some("cats"), None, None, None, true)
            .is_err());

        let cats = catalog.get_dataset("cats").unwrap();
        assert_eq!(cats.latest_version(), Some(1));
        let work = catalog.get_dataset("work").unwrap();
        assert!(work.shadow);
        assert_eq!(catalog.dataset_stats("work", None).unwrap().num_objects, 2);
        assert_eq!(catalog.get_dataset_dependencies("work", None, false).unwrap().len(), 1);
    }

    #[test]
    fn registered_dataset_cannot_be_promoted() {
        let (_dir, catalog) = catalog_with(&[bucket()]);
        make_shadow(&catalog, "cats");
        catalog.register_shadow_dataset("cats", None, None, None, None, true).unwrap();
        assert!(matches!(
            catalog.register_shadow_dataset("cats", Some("other"), None, None, None, true),
            Err(CatalogError::Validation(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn promotion_succeeds_iff_version_increases(first in 1i64..20, second in 1i64..20) {
            let (_dir, catalog) = catalog_with(&[bucket()]);
            make_shadow(&catalog, "cats");
            catalog.register_shadow_dataset("cats", None, Some(first), None, None, true).unwrap();
            make_shadow(&catalog, "work");

            let result = catalog.register_shadow_dataset("work", Some("cats"), Some(second), None, None, true);
            prop_assert_eq!(result.is_ok(), second > first);
            let latest = catalog.get_dataset("cats").unwrap().latest_version();
            prop_assert_eq!(latest, Some(first.max(second)));
        }
    }
}
