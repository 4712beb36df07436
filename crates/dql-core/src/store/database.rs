//! SQLite storage layer for the catalog.
//!
//! `Database` is a cheap handle holding only the database path; every public
//! entry point opens its own connection, so cloning the handle is how
//! concurrent workers get independent access. Metadata and row-table
//! operations live on [`Session`], which borrows one connection and is handed
//! out either in autocommit mode ([`Database::with_session`]) or inside an
//! immediate transaction ([`Database::transaction`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;

use crate::errors::{CatalogError, CatalogResult};
use crate::models::{
    is_expired, join_path, now_str, now_unix, split_path, ColumnType, ColumnTypes,
    DatasetDependency, DatasetRecord, DatasetRow, DatasetStatus, DatasetVersion, DependencyKind,
    DirType, FileMeta, Node, Storage, StorageStatus, DATASET_CORE_COLUMN_NAMES,
};
use crate::store::schema::{self, quote_ident};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Columns of a storage's partial index table.
const NODE_CORE_COLUMN_NAMES: &[&str] = &[
    "id",
    "parent",
    "name",
    "dir_type",
    "size",
    "checksum",
    "last_modified",
];

/// Row table name for a shadow dataset (`version = None`) or a version.
pub fn dataset_table_name(dataset_id: i64, version: Option<i64>) -> String {
    match version {
        Some(v) => format!("ds_{dataset_id}_{v}"),
        None => format!("ds_{dataset_id}_shadow"),
    }
}

pub fn nodes_table_name(storage_id: i64, partial_id: i64) -> String {
    format!("nodes_{storage_id}_{partial_id}")
}

/// Normalise an index prefix to `dir/` form (`""` for the storage root).
fn dir_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite-backed catalog metastore and row store.
#[derive(Clone, Debug)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Resolve the path, create parent directories, and initialise the schema.
    pub fn open(db_path: impl AsRef<Path>) -> CatalogResult<Self> {
        let db_path = db_path.as_ref();
        let resolved = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()?.join(db_path)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Self { db_path: resolved };
        db.init_schema()?;
        Ok(db)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Independent handle for use on another thread.
    pub fn clone_handle(&self) -> Self {
        self.clone()
    }

    fn connect(&self) -> CatalogResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    pub fn init_schema(&self) -> CatalogResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        schema::init_schema(&conn)
    }

    /// Run `f` on a fresh autocommit connection.
    pub fn with_session<T, F>(&self, f: F) -> CatalogResult<T>
    where
        F: FnOnce(&Session<'_>) -> CatalogResult<T>,
    {
        let conn = self.connect()?;
        f(&Session { conn: &conn })
    }

    /// Run `f` inside one immediate transaction; any error rolls back every
    /// statement `f` issued, DDL included.
    pub fn transaction<T, F>(&self, f: F) -> CatalogResult<T>
    where
        F: FnOnce(&Session<'_>) -> CatalogResult<T>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&Session { conn: &tx }) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    // -- thin autocommit wrappers for the most common lookups ----------------

    pub fn get_dataset(&self, name: &str) -> CatalogResult<DatasetRecord> {
        self.with_session(|s| s.get_dataset(name))
    }

    pub fn find_dataset(&self, name: &str) -> CatalogResult<Option<DatasetRecord>> {
        self.with_session(|s| s.find_dataset(name))
    }

    pub fn get_storage(&self, uri: &str) -> CatalogResult<Storage> {
        self.with_session(|s| s.get_storage(uri))
    }
}

// ---------------------------------------------------------------------------
// Dataset update payload
// ---------------------------------------------------------------------------

/// Fields to change on a dataset row; `None` leaves a field untouched.
#[derive(Clone, Debug, Default)]
pub struct DatasetUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub labels: Option<Vec<String>>,
    pub shadow: Option<bool>,
    pub status: Option<DatasetStatus>,
    pub sources: Option<String>,
    pub query_script: Option<String>,
    pub script_output: Option<String>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub finished_at: Option<String>,
    pub custom_column_types: Option<ColumnTypes>,
}

/// Target side of a new dependency edge.
#[derive(Clone, Debug)]
pub enum DependencyTarget {
    Dataset {
        id: i64,
        name: String,
        version_id: Option<i64>,
        version: Option<i64>,
    },
    Storage {
        id: i64,
        uri: String,
        timestamp: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Catalog operations bound to one open connection.
pub struct Session<'c> {
    conn: &'c Connection,
}

impl<'c> Session<'c> {
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    // -----------------------------------------------------------------------
    // Tables
    // -----------------------------------------------------------------------

    pub fn has_table(&self, name: &str) -> CatalogResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1;",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn rename_table(&self, old_name: &str, new_name: &str) -> CatalogResult<()> {
        self.conn.execute_batch(&format!(
            "ALTER TABLE {} RENAME TO {};",
            quote_ident(old_name),
            quote_ident(new_name)
        ))?;
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> CatalogResult<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(name)))?;
        Ok(())
    }

    /// Declared non-core columns of a table, in table order.
    pub fn table_custom_columns(&self, table: &str, core: &[&str]) -> CatalogResult<ColumnTypes> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({});", quote_ident(table)))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        let mut columns = ColumnTypes::new();
        for row in rows {
            let (name, decl) = row?;
            if !core.contains(&name.as_str()) {
                columns.insert(name, ColumnType::from_sql_type(&decl));
            }
        }
        Ok(columns)
    }

    /// Add every column of `wanted` the table does not have yet.
    fn ensure_columns(&self, table: &str, core: &[&str], wanted: &ColumnTypes) -> CatalogResult<()> {
        if wanted.is_empty() {
            return Ok(());
        }
        let existing = self.table_custom_columns(table, core)?;
        for (name, ty) in wanted {
            if core.contains(&name.as_str()) || existing.contains_key(name) {
                continue;
            }
            self.conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {};",
                quote_ident(table),
                quote_ident(name),
                ty.sql_type()
            ))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Storages
    // -----------------------------------------------------------------------

    fn storage_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Storage> {
        Ok(Storage {
            id: row.get(0)?,
            uri: row.get(1)?,
            timestamp: row.get(2)?,
            expires: row.get(3)?,
            started_inserting_at: row.get(4)?,
            last_inserted_at: row.get(5)?,
            status: StorageStatus::from_i64(row.get(6)?),
            error_message: row.get(7)?,
            error_stack: row.get(8)?,
        })
    }

    const STORAGE_COLUMNS: &'static str = "id, uri, timestamp, expires, started_inserting_at, \
         last_inserted_at, status, error_message, error_stack";

    pub fn find_storage(&self, uri: &str) -> CatalogResult<Option<Storage>> {
        let sql = format!(
            "SELECT {} FROM storages WHERE uri = ?1 LIMIT 1;",
            Self::STORAGE_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![uri], Self::storage_from_row)
            .optional()?)
    }

    pub fn get_storage(&self, uri: &str) -> CatalogResult<Storage> {
        self.find_storage(uri)?
            .ok_or_else(|| CatalogError::StorageNotFound(uri.to_string()))
    }

    pub fn list_storages(&self) -> CatalogResult<Vec<Storage>> {
        let sql = format!("SELECT {} FROM storages ORDER BY id;", Self::STORAGE_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::storage_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn create_storage_if_not_registered(&self, uri: &str) -> CatalogResult<Storage> {
        self.conn.execute(
            "INSERT OR IGNORE INTO storages(uri, status) VALUES (?1, ?2);",
            params![uri, StorageStatus::Created.as_i64()],
        )?;
        self.get_storage(uri)
    }

    /// Check-and-set before a crawl. Returns the storage, whether a crawl is
    /// needed, whether another crawl is in progress, and the partial id of a
    /// still-valid index when no crawl is needed.
    ///
    /// Must run inside a transaction for the check-and-set to be atomic.
    pub fn register_storage_for_indexing(
        &self,
        uri: &str,
        force_update: bool,
        prefix: &str,
    ) -> CatalogResult<(Storage, bool, bool, Option<i64>)> {
        let storage = self.create_storage_if_not_registered(uri)?;
        if storage.status == StorageStatus::Pending {
            return Ok((storage, false, true, None));
        }
        if !force_update {
            if let Some(partial_id) = self.get_valid_partial_id(uri, prefix)? {
                return Ok((storage, false, false, Some(partial_id)));
            }
        }
        let storage = self.mark_storage_pending(storage)?;
        Ok((storage, true, false, None))
    }

    pub fn mark_storage_pending(&self, mut storage: Storage) -> CatalogResult<Storage> {
        let now = now_unix();
        self.conn.execute(
            "UPDATE storages SET status = ?1, timestamp = NULL, expires = NULL, \
                 last_inserted_at = NULL, started_inserting_at = ?2 \
             WHERE uri = ?3;",
            params![StorageStatus::Pending.as_i64(), now, storage.uri],
        )?;
        storage.status = StorageStatus::Pending;
        storage.timestamp = None;
        storage.expires = None;
        storage.last_inserted_at = None;
        storage.started_inserting_at = Some(now);
        Ok(storage)
    }

    /// Record the outcome of a crawl. Successful crawls also register the
    /// partial index so later lookups can reuse it until `ttl` elapses.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_storage_indexed(
        &self,
        uri: &str,
        status: StorageStatus,
        ttl: i64,
        prefix: &str,
        partial_id: Option<i64>,
        error_message: &str,
        error_stack: &str,
    ) -> CatalogResult<()> {
        let now = now_unix();
        if status == StorageStatus::Failed {
            self.conn.execute(
                "UPDATE storages SET status = ?1, error_message = ?2, error_stack = ?3, \
                     timestamp = NULL, expires = NULL \
                 WHERE uri = ?4;",
                params![status.as_i64(), error_message, error_stack, uri],
            )?;
            return Ok(());
        }
        let expires = now + ttl;
        self.conn.execute(
            "UPDATE storages SET status = ?1, timestamp = ?2, expires = ?3, \
                 error_message = '', error_stack = '' \
             WHERE uri = ?4;",
            params![status.as_i64(), now, expires, uri],
        )?;
        if let Some(partial_id) = partial_id {
            self.conn.execute(
                "INSERT OR REPLACE INTO storage_partials(uri, path_str, partial_id, timestamp, expires) \
                 VALUES (?1, ?2, ?3, ?4, ?5);",
                params![uri, dir_prefix(prefix), partial_id, now, expires],
            )?;
        }
        Ok(())
    }

    /// Forget every partial index of a storage and drop its node tables.
    pub fn mark_storage_not_indexed(&self, uri: &str) -> CatalogResult<()> {
        let storage = self.get_storage(uri)?;
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?1;",
        )?;
        let tables: Vec<String> = stmt
            .query_map(params![format!("nodes_{}_%", storage.id)], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        for table in tables {
            self.drop_table(&table)?;
        }
        self.conn
            .execute("DELETE FROM storage_partials WHERE uri = ?1;", params![uri])?;
        self.conn.execute(
            "UPDATE storages SET status = ?1, timestamp = NULL, expires = NULL WHERE uri = ?2;",
            params![StorageStatus::Created.as_i64(), uri],
        )?;
        Ok(())
    }

    pub fn update_last_inserted_at(&self, uri: &str) -> CatalogResult<()> {
        self.conn.execute(
            "UPDATE storages SET last_inserted_at = ?1 WHERE uri = ?2;",
            params![now_unix(), uri],
        )?;
        Ok(())
    }

    /// Mark PENDING storages with no insert activity for `stale_after_secs`
    /// as STALE. Returns the number of storages changed.
    pub fn find_stale_storages(&self, stale_after_secs: i64) -> CatalogResult<usize> {
        let cutoff = now_unix() - stale_after_secs;
        let changed = self.conn.execute(
            "UPDATE storages SET status = ?1, timestamp = NULL, expires = NULL \
             WHERE status = ?2 \
               AND COALESCE(last_inserted_at, started_inserting_at, 0) < ?3;",
            params![
                StorageStatus::Stale.as_i64(),
                StorageStatus::Pending.as_i64(),
                cutoff
            ],
        )?;
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Id generator / partial indexes
    // -----------------------------------------------------------------------

    pub fn init_id_generator(&self, key: &str) -> CatalogResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO id_generator(uri, last_id) VALUES (?1, 0);",
            params![key],
        )?;
        Ok(())
    }

    pub fn get_next_id(&self, key: &str) -> CatalogResult<i64> {
        let id = self.conn.query_row(
            "INSERT INTO id_generator(uri, last_id) VALUES (?1, 1) \
             ON CONFLICT(uri) DO UPDATE SET last_id = last_id + 1 \
             RETURNING last_id;",
            params![key],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_next_partial_id(&self, uri: &str) -> CatalogResult<i64> {
        if uri.is_empty() {
            return Err(CatalogError::validation(
                "uri for get_next_partial_id() cannot be empty",
            ));
        }
        self.get_next_id(&format!("partials:{uri}"))
    }

    /// Newest unexpired partial index whose path covers `prefix`.
    pub fn get_valid_partial_id(&self, uri: &str, prefix: &str) -> CatalogResult<Option<i64>> {
        let wanted = dir_prefix(prefix);
        let mut stmt = self.conn.prepare(
            "SELECT path_str, expires, partial_id FROM storage_partials \
             WHERE uri = ?1 ORDER BY expires DESC, partial_id DESC;",
        )?;
        let rows = stmt.query_map(params![uri], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (path_str, expires, partial_id) = row?;
            if wanted.starts_with(&path_str) && !is_expired(expires) {
                return Ok(Some(partial_id));
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Nodes (partial index tables)
    // -----------------------------------------------------------------------

    pub fn init_nodes_table(&self, table: &str) -> CatalogResult<()> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent TEXT NOT NULL,
                name TEXT NOT NULL,
                dir_type INTEGER NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                checksum TEXT NOT NULL DEFAULT '',
                last_modified TEXT NOT NULL DEFAULT '',
                UNIQUE(parent, name)
            );",
            quote_ident(table)
        ))?;
        Ok(())
    }

    /// Insert crawled files, creating directory entries for every ancestor.
    pub fn insert_nodes(&self, table: &str, files: &[FileMeta]) -> CatalogResult<usize> {
        let mut custom = ColumnTypes::new();
        for file in files {
            for (key, value) in &file.custom {
                if let Some(ty) = ColumnType::infer(value) {
                    custom.entry(key.clone()).or_insert(ty);
                }
            }
        }
        self.ensure_columns(table, NODE_CORE_COLUMN_NAMES, &custom)?;

        let dir_sql = format!(
            "INSERT OR IGNORE INTO {} (parent, name, dir_type) VALUES (?1, ?2, ?3);",
            quote_ident(table)
        );
        let mut inserted = 0usize;
        for file in files {
            let (parent, name) = split_path(&file.path);
            if name.is_empty() {
                continue;
            }
            let mut ancestor = parent.clone();
            while !ancestor.is_empty() {
                let (up, dir_name) = split_path(&ancestor);
                self.conn
                    .execute(&dir_sql, params![up, dir_name, DirType::Dir.as_i64()])?;
                ancestor = up;
            }

            let mut columns: Vec<String> = vec![
                "parent".into(),
                "name".into(),
                "dir_type".into(),
                "size".into(),
                "checksum".into(),
                "last_modified".into(),
            ];
            let mut values: Vec<SqlValue> = vec![
                SqlValue::Text(parent),
                SqlValue::Text(name),
                SqlValue::Integer(DirType::File.as_i64()),
                SqlValue::Integer(file.size),
                SqlValue::Text(file.checksum.clone()),
                SqlValue::Text(file.last_modified.clone()),
            ];
            for (key, value) in &file.custom {
                if value.is_null() {
                    continue;
                }
                columns.push(key.clone());
                values.push(json_to_sql(value));
            }
            let sql = format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({});",
                quote_ident(table),
                columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
                vec!["?"; values.len()].join(", ")
            );
            inserted += self.conn.execute(&sql, params_from_iter(values.iter()))?;
        }
        Ok(inserted)
    }

    fn nodes_select(&self, table: &str, where_sql: &str, args: &[SqlValue]) -> CatalogResult<Vec<Node>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY parent, name;",
            quote_ident(table),
            where_sql
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next()? {
            let mut node = Node::default();
            for (i, name) in names.iter().enumerate() {
                let value = row.get_ref(i)?;
                match name.as_str() {
                    "id" => node.id = row.get(i)?,
                    "parent" => node.parent = row.get(i)?,
                    "name" => node.name = row.get(i)?,
                    "dir_type" => node.dir_type = DirType::from_i64(row.get(i)?),
                    "size" => node.size = row.get(i)?,
                    "checksum" => node.checksum = row.get(i)?,
                    "last_modified" => node.last_modified = row.get(i)?,
                    _ => {
                        node.custom.insert(name.clone(), sql_to_json(value));
                    }
                }
            }
            nodes.push(node);
        }
        Ok(nodes)
    }

    pub fn get_node(&self, table: &str, path: &str) -> CatalogResult<Option<Node>> {
        let (parent, name) = split_path(path);
        let mut nodes = self.nodes_select(
            table,
            "parent = ?1 AND name = ?2",
            &[SqlValue::Text(parent), SqlValue::Text(name)],
        )?;
        Ok(nodes.pop())
    }

    pub fn get_nodes_by_parent_path(&self, table: &str, parent: &str) -> CatalogResult<Vec<Node>> {
        self.nodes_select(
            table,
            "parent = ?1",
            &[SqlValue::Text(parent.trim_matches('/').to_string())],
        )
    }

    /// Every file below `dir_path` (the whole index for `""`).
    pub fn get_subtree_files(&self, table: &str, dir_path: &str) -> CatalogResult<Vec<Node>> {
        let dir = dir_path.trim_matches('/');
        if dir.is_empty() {
            return self.nodes_select(table, "dir_type = 0", &[]);
        }
        self.nodes_select(
            table,
            "dir_type = 0 AND (parent = ?1 OR substr(parent, 1, length(?2)) = ?2)",
            &[SqlValue::Text(dir.to_string()), SqlValue::Text(format!("{dir}/"))],
        )
    }

    pub fn node_custom_columns(&self, table: &str) -> CatalogResult<ColumnTypes> {
        self.table_custom_columns(table, NODE_CORE_COLUMN_NAMES)
    }

    // -----------------------------------------------------------------------
    // Datasets
    // -----------------------------------------------------------------------

    const DATASET_COLUMNS: &'static str = "id, name, description, labels, shadow, status, \
         created_at, finished_at, error_message, error_stack, script_output, sources, \
         query_script, custom_column_types";

    fn dataset_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(DatasetRecord, Option<String>, Option<String>)> {
        let record = DatasetRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            labels: Vec::new(),
            shadow: row.get::<_, i64>(4)? != 0,
            status: DatasetStatus::from_i64(row.get(5)?),
            created_at: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            finished_at: row.get(7)?,
            error_message: row.get(8)?,
            error_stack: row.get(9)?,
            script_output: row.get(10)?,
            sources: row.get(11)?,
            query_script: row.get(12)?,
            custom_column_types: ColumnTypes::new(),
            versions: Vec::new(),
        };
        Ok((record, row.get(3)?, row.get(13)?))
    }

    fn hydrate_dataset(
        &self,
        (mut record, labels, column_types): (DatasetRecord, Option<String>, Option<String>),
    ) -> CatalogResult<DatasetRecord> {
        if let Some(labels) = labels {
            record.labels = serde_json::from_str(&labels)?;
        }
        if let Some(types) = column_types {
            record.custom_column_types = serde_json::from_str(&types)?;
        }
        record.versions = self.get_dataset_versions(record.id)?;
        Ok(record)
    }

    fn get_dataset_versions(&self, dataset_id: i64) -> CatalogResult<Vec<DatasetVersion>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, dataset_id, version, sources, query_script, custom_column_types, \
                    status, created_at \
             FROM datasets_versions WHERE dataset_id = ?1 ORDER BY version;",
        )?;
        let rows = stmt.query_map(params![dataset_id], |row| {
            Ok((
                DatasetVersion {
                    id: row.get(0)?,
                    dataset_id: row.get(1)?,
                    version: row.get(2)?,
                    sources: row.get(3)?,
                    query_script: row.get(4)?,
                    custom_column_types: ColumnTypes::new(),
                    status: DatasetStatus::from_i64(row.get(6)?),
                    created_at: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                },
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut versions = Vec::new();
        for row in rows {
            let (mut version, types) = row?;
            if let Some(types) = types {
                version.custom_column_types = serde_json::from_str(&types)?;
            }
            versions.push(version);
        }
        Ok(versions)
    }

    pub fn find_dataset(&self, name: &str) -> CatalogResult<Option<DatasetRecord>> {
        let sql = format!(
            "SELECT {} FROM datasets WHERE name = ?1 LIMIT 1;",
            Self::DATASET_COLUMNS
        );
        let raw = self
            .conn
            .query_row(&sql, params![name], Self::dataset_from_row)
            .optional()?;
        raw.map(|r| self.hydrate_dataset(r)).transpose()
    }

    pub fn get_dataset(&self, name: &str) -> CatalogResult<DatasetRecord> {
        self.find_dataset(name)?
            .ok_or_else(|| CatalogError::DatasetNotFound(name.to_string()))
    }

    pub fn list_datasets(&self, shadow_only: Option<bool>) -> CatalogResult<Vec<DatasetRecord>> {
        let (sql, args): (String, Vec<SqlValue>) = match shadow_only {
            Some(shadow) => (
                format!(
                    "SELECT {} FROM datasets WHERE shadow = ?1 ORDER BY id;",
                    Self::DATASET_COLUMNS
                ),
                vec![SqlValue::Integer(shadow as i64)],
            ),
            None => (
                format!("SELECT {} FROM datasets ORDER BY id;", Self::DATASET_COLUMNS),
                Vec::new(),
            ),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let raw: Vec<_> = stmt
            .query_map(params_from_iter(args.iter()), Self::dataset_from_row)?
            .collect::<Result<_, _>>()?;
        raw.into_iter().map(|r| self.hydrate_dataset(r)).collect()
    }

    /// Create a shadow dataset, or reuse the existing shadow of that name.
    /// The row table is created (empty) when `create_rows` is set and extended
    /// with any custom columns it is missing.
    pub fn create_shadow_dataset(
        &self,
        name: &str,
        sources: &[String],
        query_script: &str,
        create_rows: bool,
        custom_columns: &ColumnTypes,
    ) -> CatalogResult<DatasetRecord> {
        let dataset = match self.find_dataset(name)? {
            Some(existing) if existing.shadow => {
                let merged = crate::models::merge_column_types(
                    &existing.custom_column_types,
                    custom_columns,
                );
                self.update_dataset(
                    name,
                    &DatasetUpdate {
                        custom_column_types: Some(merged),
                        ..Default::default()
                    },
                )?;
                self.get_dataset(name)?
            }
            Some(_) => {
                return Err(CatalogError::validation(format!(
                    "Registered dataset with name {name} already exists"
                )))
            }
            None => {
                self.conn.execute(
                    "INSERT INTO datasets(name, shadow, status, created_at, sources, query_script, \
                         custom_column_types) \
                     VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6);",
                    params![
                        name,
                        DatasetStatus::Created.as_i64(),
                        now_str(),
                        sources.join("\n"),
                        query_script,
                        serde_json::to_string(custom_columns)?,
                    ],
                )?;
                self.get_dataset(name)?
            }
        };
        if create_rows {
            self.create_dataset_rows_table(
                &dataset_table_name(dataset.id, None),
                &dataset.custom_column_types,
            )?;
        }
        Ok(dataset)
    }

    pub fn create_dataset_rows_table(&self, table: &str, custom_columns: &ColumnTypes) -> CatalogResult<()> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                parent TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL,
                dir_type INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                checksum TEXT NOT NULL DEFAULT '',
                last_modified TEXT NOT NULL DEFAULT ''
            );",
            quote_ident(table)
        ))?;
        self.ensure_columns(table, DATASET_CORE_COLUMN_NAMES, custom_columns)
    }

    /// Insert a version row. The row table is only created when requested;
    /// promotion renames an existing table into place instead.
    #[allow(clippy::too_many_arguments)]
    pub fn create_dataset_version(
        &self,
        dataset: &DatasetRecord,
        version: i64,
        sources: &str,
        query_script: &str,
        custom_column_types: &ColumnTypes,
        status: DatasetStatus,
        create_rows_table: bool,
    ) -> CatalogResult<DatasetRecord> {
        if dataset.has_version(version) {
            return Err(CatalogError::validation(format!(
                "Dataset {} already has version {version}",
                dataset.name
            )));
        }
        self.conn.execute(
            "INSERT INTO datasets_versions(dataset_id, version, sources, query_script, \
                 custom_column_types, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                dataset.id,
                version,
                sources,
                query_script,
                serde_json::to_string(custom_column_types)?,
                status.as_i64(),
                now_str(),
            ],
        )?;
        if create_rows_table {
            self.create_dataset_rows_table(
                &dataset_table_name(dataset.id, Some(version)),
                custom_column_types,
            )?;
        }
        self.get_dataset(&dataset.name)
    }

    pub fn update_dataset(&self, name: &str, update: &DatasetUpdate) -> CatalogResult<()> {
        let mut set_clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(v) = &update.name {
            set_clauses.push("name = ?");
            values.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &update.description {
            set_clauses.push("description = ?");
            values.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &update.labels {
            set_clauses.push("labels = ?");
            values.push(SqlValue::Text(serde_json::to_string(v)?));
        }
        if let Some(v) = update.shadow {
            set_clauses.push("shadow = ?");
            values.push(SqlValue::Integer(v as i64));
        }
        if let Some(v) = update.status {
            set_clauses.push("status = ?");
            values.push(SqlValue::Integer(v.as_i64()));
        }
        if let Some(v) = &update.sources {
            set_clauses.push("sources = ?");
            values.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &update.query_script {
            set_clauses.push("query_script = ?");
            values.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &update.script_output {
            set_clauses.push("script_output = ?");
            values.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &update.error_message {
            set_clauses.push("error_message = ?");
            values.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &update.error_stack {
            set_clauses.push("error_stack = ?");
            values.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &update.finished_at {
            set_clauses.push("finished_at = ?");
            values.push(SqlValue::Text(v.clone()));
        }
        if let Some(v) = &update.custom_column_types {
            set_clauses.push("custom_column_types = ?");
            values.push(SqlValue::Text(serde_json::to_string(v)?));
        }

        if set_clauses.is_empty() {
            return Ok(());
        }
        values.push(SqlValue::Text(name.to_string()));
        let sql = format!(
            "UPDATE datasets SET {} WHERE name = ?;",
            set_clauses.join(", ")
        );
        let changed = self.conn.execute(&sql, params_from_iter(values.iter()))?;
        if changed == 0 {
            return Err(CatalogError::DatasetNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Set a dataset's status plus the fields that go with it: final states
    /// stamp `finished_at` and store `script_output` when given; FAILED
    /// stores the error message and stack.
    pub fn update_dataset_status(
        &self,
        dataset: &DatasetRecord,
        status: DatasetStatus,
        error_message: &str,
        error_stack: &str,
        script_output: &str,
    ) -> CatalogResult<DatasetRecord> {
        let mut update = DatasetUpdate {
            status: Some(status),
            ..Default::default()
        };
        if status.is_final() {
            update.finished_at = Some(now_str());
            if !script_output.is_empty() {
                update.script_output = Some(script_output.to_string());
            }
        }
        if status == DatasetStatus::Failed {
            update.error_message = Some(error_message.to_string());
            update.error_stack = Some(error_stack.to_string());
        }
        self.update_dataset(&dataset.name, &update)?;
        self.get_dataset(&dataset.name)
    }

    /// Delete a shadow dataset's metadata, its owned edges and optionally its
    /// row table.
    pub fn remove_shadow_dataset(&self, dataset: &DatasetRecord, drop_rows: bool) -> CatalogResult<()> {
        self.remove_dataset_dependencies(dataset.id, None)?;
        self.conn
            .execute("DELETE FROM datasets WHERE id = ?1;", params![dataset.id])?;
        if drop_rows {
            self.drop_table(&dataset_table_name(dataset.id, None))?;
        }
        Ok(())
    }

    /// Delete one version; deleting the last version removes the dataset.
    pub fn remove_dataset_version(&self, dataset: &DatasetRecord, version: i64) -> CatalogResult<()> {
        let Ok(dv) = dataset.get_version(version) else {
            return Ok(());
        };
        self.remove_dataset_dependencies(dataset.id, Some(dv.id))?;
        self.conn
            .execute("DELETE FROM datasets_versions WHERE id = ?1;", params![dv.id])?;
        if dataset.versions.len() == 1 {
            self.conn
                .execute("DELETE FROM datasets WHERE id = ?1;", params![dataset.id])?;
        }
        self.drop_table(&dataset_table_name(dataset.id, Some(version)))
    }

    // -----------------------------------------------------------------------
    // Dataset rows
    // -----------------------------------------------------------------------

    /// Insert rows, adding any custom columns the table does not have yet.
    pub fn insert_dataset_rows(&self, table: &str, rows: &[DatasetRow]) -> CatalogResult<usize> {
        let mut custom = ColumnTypes::new();
        for row in rows {
            for (key, value) in &row.custom {
                if let Some(ty) = ColumnType::infer(value) {
                    custom.entry(key.clone()).or_insert(ty);
                }
            }
        }
        self.ensure_columns(table, DATASET_CORE_COLUMN_NAMES, &custom)?;

        let mut inserted = 0usize;
        for row in rows {
            let mut columns: Vec<&str> = vec![
                "source",
                "parent",
                "name",
                "dir_type",
                "size",
                "checksum",
                "last_modified",
            ];
            let mut values: Vec<SqlValue> = vec![
                SqlValue::Text(row.source.clone()),
                SqlValue::Text(row.parent.clone()),
                SqlValue::Text(row.name.clone()),
                SqlValue::Integer(row.dir_type.as_i64()),
                SqlValue::Integer(row.size),
                SqlValue::Text(row.checksum.clone()),
                SqlValue::Text(row.last_modified.clone()),
            ];
            for (key, value) in &row.custom {
                if value.is_null() || DATASET_CORE_COLUMN_NAMES.contains(&key.as_str()) {
                    continue;
                }
                columns.push(key);
                values.push(json_to_sql(value));
            }
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({});",
                quote_ident(table),
                columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
                vec!["?"; values.len()].join(", ")
            );
            inserted += self.conn.execute(&sql, params_from_iter(values.iter()))?;
        }
        Ok(inserted)
    }

    /// Copy every node as a row tagged with `source`.
    pub fn insert_nodes_as_rows(&self, table: &str, source: &str, nodes: &[Node]) -> CatalogResult<usize> {
        let rows: Vec<DatasetRow> = nodes
            .iter()
            .map(|n| DatasetRow {
                id: None,
                source: source.to_string(),
                parent: n.parent.clone(),
                name: n.name.clone(),
                dir_type: n.dir_type,
                size: n.size,
                checksum: n.checksum.clone(),
                last_modified: n.last_modified.clone(),
                custom: n.custom.clone(),
            })
            .collect();
        self.insert_dataset_rows(table, &rows)
    }

    /// Append every row of `src_table` to `dst_table`, widening the
    /// destination with the source's custom columns first.
    pub fn copy_rows(&self, src_table: &str, dst_table: &str) -> CatalogResult<usize> {
        let src_custom = self.table_custom_columns(src_table, DATASET_CORE_COLUMN_NAMES)?;
        self.ensure_columns(dst_table, DATASET_CORE_COLUMN_NAMES, &src_custom)?;
        let columns: Vec<String> = DATASET_CORE_COLUMN_NAMES
            .iter()
            .filter(|c| **c != "id")
            .map(|c| c.to_string())
            .chain(src_custom.keys().cloned())
            .map(|c| quote_ident(&c))
            .collect();
        let column_list = columns.join(", ");
        let copied = self.conn.execute(
            &format!(
                "INSERT INTO {} ({column_list}) SELECT {column_list} FROM {} ORDER BY id;",
                quote_ident(dst_table),
                quote_ident(src_table)
            ),
            [],
        )?;
        Ok(copied)
    }

    pub fn get_dataset_rows(
        &self,
        table: &str,
        offset: Option<i64>,
        limit: Option<i64>,
    ) -> CatalogResult<Vec<DatasetRow>> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY id LIMIT ?1 OFFSET ?2;",
            quote_ident(table)
        );
        self.rows_select(&sql, params![limit.unwrap_or(-1), offset.unwrap_or(0)])
    }

    pub fn get_dataset_row(&self, table: &str, row_id: i64) -> CatalogResult<Option<DatasetRow>> {
        let sql = format!("SELECT * FROM {} WHERE id = ?1;", quote_ident(table));
        Ok(self.rows_select(&sql, params![row_id])?.pop())
    }

    fn rows_select(&self, sql: &str, args: impl rusqlite::Params) -> CatalogResult<Vec<DatasetRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = DatasetRow::default();
            let mut custom = IndexMap::new();
            for (i, name) in names.iter().enumerate() {
                match name.as_str() {
                    "id" => record.id = Some(row.get(i)?),
                    "source" => record.source = row.get(i)?,
                    "parent" => record.parent = row.get(i)?,
                    "name" => record.name = row.get(i)?,
                    "dir_type" => record.dir_type = DirType::from_i64(row.get(i)?),
                    "size" => record.size = row.get(i)?,
                    "checksum" => record.checksum = row.get(i)?,
                    "last_modified" => record.last_modified = row.get(i)?,
                    _ => {
                        custom.insert(name.clone(), sql_to_json(row.get_ref(i)?));
                    }
                }
            }
            record.custom = custom;
            out.push(record);
        }
        Ok(out)
    }

    pub fn dataset_rows_count(&self, table: &str) -> CatalogResult<i64> {
        Ok(self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {};", quote_ident(table)),
            [],
            |row| row.get(0),
        )?)
    }

    pub fn dataset_rows_size(&self, table: &str) -> CatalogResult<i64> {
        Ok(self.conn.query_row(
            &format!("SELECT COALESCE(SUM(size), 0) FROM {};", quote_ident(table)),
            [],
            |row| row.get(0),
        )?)
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    pub fn insert_dependency(
        &self,
        source_dataset_id: i64,
        source_version_id: Option<i64>,
        target: &DependencyTarget,
    ) -> CatalogResult<()> {
        match target {
            DependencyTarget::Dataset {
                id,
                name,
                version_id,
                version,
            } => {
                self.conn.execute(
                    "INSERT INTO datasets_dependencies(source_dataset_id, source_dataset_version_id, \
                         dataset_id, dataset_version_id, dataset_name, dataset_version, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
                    params![
                        source_dataset_id,
                        source_version_id,
                        id,
                        version_id,
                        name,
                        version,
                        now_str()
                    ],
                )?;
            }
            DependencyTarget::Storage { id, uri, timestamp } => {
                self.conn.execute(
                    "INSERT INTO datasets_dependencies(source_dataset_id, source_dataset_version_id, \
                         bucket_id, bucket_uri, bucket_version, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
                    params![
                        source_dataset_id,
                        source_version_id,
                        id,
                        uri,
                        timestamp,
                        now_str()
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn version_id(dataset: &DatasetRecord, version: Option<i64>) -> CatalogResult<Option<i64>> {
        match version {
            Some(v) => Ok(Some(dataset.get_version(v)?.id)),
            None => Ok(None),
        }
    }

    pub fn add_storage_dependency(
        &self,
        dataset_name: &str,
        dataset_version: Option<i64>,
        storage_uri: &str,
        storage_timestamp: Option<String>,
    ) -> CatalogResult<()> {
        let dataset = self.get_dataset(dataset_name)?;
        let storage = self.get_storage(storage_uri)?;
        self.insert_dependency(
            dataset.id,
            Self::version_id(&dataset, dataset_version)?,
            &DependencyTarget::Storage {
                id: storage.id,
                uri: storage.uri,
                timestamp: storage_timestamp,
            },
        )
    }

    pub fn add_dataset_dependency(
        &self,
        dataset_name: &str,
        dataset_version: Option<i64>,
        dependency_name: &str,
        dependency_version: Option<i64>,
    ) -> CatalogResult<()> {
        let dataset = self.get_dataset(dataset_name)?;
        let dependency = self.get_dataset(dependency_name)?;
        self.insert_dependency(
            dataset.id,
            Self::version_id(&dataset, dataset_version)?,
            &DependencyTarget::Dataset {
                id: dependency.id,
                name: dependency.name.clone(),
                version_id: Self::version_id(&dependency, dependency_version)?,
                version: dependency_version,
            },
        )
    }

    /// Re-create `dependency` as an edge owned by `dataset_name[@version]`.
    /// Edges whose target no longer exists keep their recorded identity.
    pub fn add_dependency(
        &self,
        dependency: &DatasetDependency,
        dataset_name: &str,
        dataset_version: Option<i64>,
    ) -> CatalogResult<()> {
        let dataset = self.get_dataset(dataset_name)?;
        let source_version_id = Self::version_id(&dataset, dataset_version)?;
        let target = match dependency.kind {
            DependencyKind::Dataset => {
                let version = dependency.dataset_version();
                match self.find_dataset(&dependency.name)? {
                    Some(dep) => DependencyTarget::Dataset {
                        id: dep.id,
                        name: dep.name.clone(),
                        version_id: version
                            .and_then(|v| dep.get_version(v).ok())
                            .map(|dv| dv.id),
                        version,
                    },
                    None => DependencyTarget::Dataset {
                        id: -1,
                        name: dependency.name.clone(),
                        version_id: None,
                        version,
                    },
                }
            }
            DependencyKind::Storage => {
                let storage = self.get_storage(&dependency.name)?;
                DependencyTarget::Storage {
                    id: storage.id,
                    uri: storage.uri,
                    timestamp: Some(dependency.version.clone()).filter(|v| !v.is_empty()),
                }
            }
        };
        self.insert_dependency(dataset.id, source_version_id, &target)
    }

    /// Move every edge owned by `old_dataset_id[@old_version_id]` onto the new
    /// owner.
    pub fn update_dataset_dependency_source(
        &self,
        old_dataset_id: i64,
        old_version_id: Option<i64>,
        new_dataset_id: i64,
        new_version_id: Option<i64>,
    ) -> CatalogResult<usize> {
        let changed = match old_version_id {
            Some(vid) => self.conn.execute(
                "UPDATE datasets_dependencies SET source_dataset_id = ?1, \
                     source_dataset_version_id = ?2 \
                 WHERE source_dataset_id = ?3 AND source_dataset_version_id = ?4;",
                params![new_dataset_id, new_version_id, old_dataset_id, vid],
            )?,
            None => self.conn.execute(
                "UPDATE datasets_dependencies SET source_dataset_id = ?1, \
                     source_dataset_version_id = ?2 \
                 WHERE source_dataset_id = ?3 AND source_dataset_version_id IS NULL;",
                params![new_dataset_id, new_version_id, old_dataset_id],
            )?,
        };
        Ok(changed)
    }

    /// Direct edges of a dataset (shadow: `version = None`) or version.
    ///
    /// An edge whose target dataset/version has been removed is returned with
    /// its recorded name and version and `dangling` set.
    pub fn get_direct_dataset_dependencies(
        &self,
        dataset: &DatasetRecord,
        version: Option<i64>,
    ) -> CatalogResult<Vec<DatasetDependency>> {
        let base = "SELECT dd.id, dd.dataset_id, d.name, dd.dataset_name, \
                dv.version, dd.dataset_version, dd.dataset_version_id, \
                dd.bucket_id, s.uri, dd.bucket_uri, dd.bucket_version, dd.created_at \
             FROM datasets_dependencies dd \
             LEFT JOIN datasets d ON dd.dataset_id = d.id \
             LEFT JOIN datasets_versions dv ON dd.dataset_version_id = dv.id \
             LEFT JOIN storages s ON dd.bucket_id = s.id \
             WHERE dd.source_dataset_id = ?1";
        let (sql, args): (String, Vec<SqlValue>) = match Self::version_id(dataset, version)? {
            Some(vid) => (
                format!("{base} AND dd.source_dataset_version_id = ?2 ORDER BY dd.id;"),
                vec![SqlValue::Integer(dataset.id), SqlValue::Integer(vid)],
            ),
            None => (
                format!("{base} AND dd.source_dataset_version_id IS NULL ORDER BY dd.id;"),
                vec![SqlValue::Integer(dataset.id)],
            ),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            let id: i64 = row.get(0)?;
            let dataset_id: Option<i64> = row.get(1)?;
            let live_name: Option<String> = row.get(2)?;
            let recorded_name: Option<String> = row.get(3)?;
            let live_version: Option<i64> = row.get(4)?;
            let recorded_version: Option<i64> = row.get(5)?;
            let version_id: Option<i64> = row.get(6)?;
            let bucket_id: Option<i64> = row.get(7)?;
            let live_uri: Option<String> = row.get(8)?;
            let recorded_uri: Option<String> = row.get(9)?;
            let bucket_version: Option<String> = row.get(10)?;
            let created_at: Option<String> = row.get(11)?;

            if dataset_id.is_some() || bucket_id.is_none() {
                let target_gone = live_name.is_none()
                    || (recorded_version.is_some() && (version_id.is_none() || live_version.is_none()));
                Ok(DatasetDependency {
                    id,
                    kind: DependencyKind::Dataset,
                    name: live_name.or(recorded_name).unwrap_or_default(),
                    version: live_version
                        .or(recorded_version)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    created_at: created_at.unwrap_or_default(),
                    dangling: target_gone,
                    dependencies: Vec::new(),
                })
            } else {
                Ok(DatasetDependency {
                    id,
                    kind: DependencyKind::Storage,
                    dangling: live_uri.is_none(),
                    name: live_uri.or(recorded_uri).unwrap_or_default(),
                    version: bucket_version.unwrap_or_default(),
                    created_at: created_at.unwrap_or_default(),
                    dependencies: Vec::new(),
                })
            }
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Remove the edges owned by a dataset (or one of its versions).
    pub fn remove_dataset_dependencies(&self, dataset_id: i64, version_id: Option<i64>) -> CatalogResult<()> {
        match version_id {
            Some(vid) => self.conn.execute(
                "DELETE FROM datasets_dependencies \
                 WHERE source_dataset_id = ?1 AND source_dataset_version_id = ?2;",
                params![dataset_id, vid],
            )?,
            None => self.conn.execute(
                "DELETE FROM datasets_dependencies \
                 WHERE source_dataset_id = ?1 AND source_dataset_version_id IS NULL;",
                params![dataset_id],
            )?,
        };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Value conversion
// ---------------------------------------------------------------------------

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::from(b.to_vec()),
    }
}

/// Path of a dataset row relative to its storage root.
pub fn row_path(row: &DatasetRow) -> String {
    join_path(&row.parent, &row.name)
}
