//! SQLite schema of the catalog metastore.

use rusqlite::{Connection, OptionalExtension};

use crate::errors::{CatalogError, CatalogResult};

/// Layout version stamped into `catalog_meta`. A catalog stamped with a
/// newer version is refused rather than read with the wrong layout.
pub const SCHEMA_VERSION: i32 = 1;

/// Metastore tables and indexes. Row tables (`ds_*`) and node tables
/// (`nodes_*`) are created on demand by the store.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS storages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uri TEXT NOT NULL UNIQUE,
        timestamp INTEGER,
        expires INTEGER,
        started_inserting_at INTEGER,
        last_inserted_at INTEGER,
        status INTEGER NOT NULL DEFAULT 1,
        error_message TEXT NOT NULL DEFAULT '',
        error_stack TEXT NOT NULL DEFAULT ''
    );",
    "CREATE TABLE IF NOT EXISTS storage_partials (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uri TEXT NOT NULL,
        path_str TEXT NOT NULL,
        partial_id INTEGER NOT NULL,
        timestamp INTEGER,
        expires INTEGER,
        UNIQUE(uri, path_str, partial_id)
    );",
    "CREATE TABLE IF NOT EXISTS id_generator (
        uri TEXT PRIMARY KEY,
        last_id INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS datasets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        labels TEXT,
        shadow INTEGER NOT NULL,
        status INTEGER NOT NULL DEFAULT 1,
        created_at TEXT,
        finished_at TEXT,
        error_message TEXT NOT NULL DEFAULT '',
        error_stack TEXT NOT NULL DEFAULT '',
        script_output TEXT NOT NULL DEFAULT '',
        sources TEXT NOT NULL DEFAULT '',
        query_script TEXT NOT NULL DEFAULT '',
        custom_column_types TEXT
    );",
    "CREATE TABLE IF NOT EXISTS datasets_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        dataset_id INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
        version INTEGER NOT NULL,
        sources TEXT NOT NULL DEFAULT '',
        query_script TEXT NOT NULL DEFAULT '',
        custom_column_types TEXT,
        status INTEGER NOT NULL DEFAULT 4,
        created_at TEXT,
        UNIQUE(dataset_id, version)
    );",
    // Targets are not foreign keys: the target's name and version are kept
    // on the edge so it outlives the dataset it points at.
    "CREATE TABLE IF NOT EXISTS datasets_dependencies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_dataset_id INTEGER NOT NULL,
        source_dataset_version_id INTEGER,
        dataset_id INTEGER,
        dataset_version_id INTEGER,
        dataset_name TEXT,
        dataset_version INTEGER,
        bucket_id INTEGER,
        bucket_uri TEXT,
        bucket_version TEXT,
        created_at TEXT
    );",
    "CREATE INDEX IF NOT EXISTS idx_partials_uri ON storage_partials(uri, path_str);",
    "CREATE INDEX IF NOT EXISTS idx_datasets_shadow ON datasets(shadow);",
    "CREATE INDEX IF NOT EXISTS idx_versions_dataset ON datasets_versions(dataset_id, version);",
    "CREATE INDEX IF NOT EXISTS idx_storages_status ON storages(status);",
    "CREATE INDEX IF NOT EXISTS idx_deps_source \
     ON datasets_dependencies(source_dataset_id, source_dataset_version_id);",
    "CREATE INDEX IF NOT EXISTS idx_deps_target ON datasets_dependencies(dataset_id, dataset_version_id);",
];

/// Create missing metastore tables and check the layout stamp.
pub fn init_schema(conn: &Connection) -> CatalogResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS catalog_meta (
            key TEXT PRIMARY KEY,
            value TEXT
        );",
    )?;
    if let Some(found) = schema_version(conn)? {
        if found > SCHEMA_VERSION {
            return Err(CatalogError::validation(format!(
                "Catalog schema version {found} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
    }
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    conn.execute(
        "INSERT INTO catalog_meta(key, value) VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Layout version the catalog was stamped with, if any.
pub fn schema_version(conn: &Connection) -> CatalogResult<Option<i32>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM catalog_meta WHERE key = 'schema_version';",
            [],
            |row| row.get(0),
        )
        .optional()?;
    value
        .map(|v| {
            v.parse::<i32>()
                .map_err(|_| CatalogError::validation(format!("Corrupt catalog schema version: {v}")))
        })
        .transpose()
}

/// Quote an identifier for interpolation into DDL/DML.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
