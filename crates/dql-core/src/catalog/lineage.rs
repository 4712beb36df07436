//! Dataset lineage queries.

use std::collections::HashSet;

use super::Catalog;
use crate::errors::{CatalogError, CatalogResult};
use crate::models::DatasetDependency;
use crate::store::database::Session;

impl Catalog {
    /// Direct dependencies of `name[@version]`, or with `indirect` the whole
    /// upstream tree nested under each dataset edge.
    ///
    /// A registered dataset needs an explicit version. Dangling edges and
    /// storage edges are leaves. A dataset version reached twice is listed
    /// both times but only expanded on the first visit.
    pub fn get_dataset_dependencies(
        &self,
        name: &str,
        version: Option<i64>,
        indirect: bool,
    ) -> CatalogResult<Vec<DatasetDependency>> {
        self.db.with_session(|s| {
            let dataset = s.get_dataset(name)?;
            if dataset.registered() && version.is_none() {
                return Err(CatalogError::validation(format!(
                    "Dataset {name} is registered and a version is required"
                )));
            }
            let direct = s.get_direct_dataset_dependencies(&dataset, version)?;
            if !indirect {
                return Ok(direct);
            }
            let mut visited = HashSet::from([(name.to_string(), version)]);
            expand(s, direct, &mut visited)
        })
    }
}

fn expand(
    s: &Session<'_>,
    deps: Vec<DatasetDependency>,
    visited: &mut HashSet<(String, Option<i64>)>,
) -> CatalogResult<Vec<DatasetDependency>> {
    let mut out = Vec::with_capacity(deps.len());
    for mut dep in deps {
        if dep.is_dataset() && !dep.dangling {
            let key = (dep.name.clone(), dep.dataset_version());
            if visited.insert(key.clone()) {
                if let Some(dataset) = s.find_dataset(&key.0)? {
                    if key.1.map_or(true, |v| dataset.has_version(v)) {
                        let children = s.get_direct_dataset_dependencies(&dataset, key.1)?;
                        dep.dependencies = expand(s, children, visited)?;
                    }
                }
            }
        }
        out.push(dep);
    }
    Ok(out)
}
