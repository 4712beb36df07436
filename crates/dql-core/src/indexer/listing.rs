//! Read access to one partial index of a storage.

use std::sync::Arc;

use crate::errors::{CatalogError, CatalogResult};
use crate::indexer::client::{has_glob, Client, GlobPattern};
use crate::models::{split_path, ColumnTypes, DirType, Node, Storage};
use crate::store::database::{nodes_table_name, Database};

/// A storage bound to the partial index that answers lookups for it.
#[derive(Clone, Debug)]
pub struct Listing {
    pub storage: Storage,
    pub partial_id: i64,
    db: Database,
    client: Arc<dyn Client>,
}

/// One resolved entry of a source, with the listing it came from.
#[derive(Clone, Debug)]
pub struct DataSource {
    pub listing: Listing,
    pub node: Node,
}

impl DataSource {
    /// Files this entry stands for: itself, or everything below a directory
    /// when `recursive`.
    pub fn files(&self, recursive: bool) -> CatalogResult<Vec<Node>> {
        if !self.node.is_dir() {
            return Ok(vec![self.node.clone()]);
        }
        if recursive {
            self.listing.subtree_files(&self.node.path())
        } else {
            Ok(self
                .listing
                .ls(&self.node.path())?
                .into_iter()
                .filter(|n| !n.is_dir())
                .collect())
        }
    }
}

impl Listing {
    pub fn new(storage: Storage, partial_id: i64, db: Database, client: Arc<dyn Client>) -> Self {
        Self {
            storage,
            partial_id,
            db,
            client,
        }
    }

    pub fn table(&self) -> String {
        nodes_table_name(self.storage.id, self.partial_id)
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    /// Independent listing for another worker.
    pub fn clone_handle(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            partial_id: self.partial_id,
            db: self.db.clone_handle(),
            client: self.client.clone_handle(),
        }
    }

    /// Node at `path`; the empty path is the storage root.
    pub fn resolve_path(&self, path: &str) -> CatalogResult<Node> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Ok(Node {
                dir_type: DirType::Dir,
                ..Default::default()
            });
        }
        let table = self.table();
        self.db
            .with_session(|s| s.get_node(&table, path))?
            .ok_or_else(|| {
                CatalogError::Client(format!("{}/{path} not found", self.storage.uri))
            })
    }

    /// Nodes a source path names; a glob in the last component matches
    /// against the children of its parent.
    pub fn expand_path(&self, path: &str) -> CatalogResult<Vec<Node>> {
        let path = path.trim_matches('/');
        let (parent, last) = split_path(path);
        if !has_glob(&last) {
            return Ok(vec![self.resolve_path(path)?]);
        }
        let pattern = GlobPattern::new(&last)?;
        Ok(self
            .ls(&parent)?
            .into_iter()
            .filter(|n| pattern.matches(&n.name))
            .collect())
    }

    pub fn ls(&self, dir: &str) -> CatalogResult<Vec<Node>> {
        let table = self.table();
        self.db.with_session(|s| s.get_nodes_by_parent_path(&table, dir))
    }

    pub fn subtree_files(&self, dir: &str) -> CatalogResult<Vec<Node>> {
        let table = self.table();
        self.db.with_session(|s| s.get_subtree_files(&table, dir))
    }

    /// Custom columns the crawl discovered for this index.
    pub fn custom_columns(&self) -> CatalogResult<ColumnTypes> {
        let table = self.table();
        self.db.with_session(|s| {
            if s.has_table(&table)? {
                s.node_custom_columns(&table)
            } else {
                Ok(ColumnTypes::new())
            }
        })
    }
}
