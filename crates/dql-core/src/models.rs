//! Shared typed models used across indexing, storage, catalog, and remote layers.

use std::fmt;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::errors::{CatalogError, CatalogResult};

pub const DATASET_PREFIX: &str = "ds://";
pub const DATASET_FILE_SUFFIX: &str = ".edql";

/// Root URI of one indexed source (e.g. `s3://bucket`, `file:///data`).
pub type StorageUri = String;

/// Ordered custom-column name to type map.
pub type ColumnTypes = IndexMap<String, ColumnType>;

/// Names of the columns every dataset row table carries.
pub const DATASET_CORE_COLUMN_NAMES: &[&str] = &[
    "id",
    "source",
    "parent",
    "name",
    "dir_type",
    "size",
    "checksum",
    "last_modified",
];

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Current UTC time as RFC 3339 text.
pub fn now_str() -> String {
    format_unix(now_unix())
}

pub fn format_unix(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Index status of a storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageStatus {
    Created,
    Pending,
    Failed,
    Complete,
    Partial,
    Stale,
}

impl StorageStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            StorageStatus::Created => 1,
            StorageStatus::Pending => 2,
            StorageStatus::Failed => 3,
            StorageStatus::Complete => 4,
            StorageStatus::Partial => 5,
            StorageStatus::Stale => 6,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            2 => StorageStatus::Pending,
            3 => StorageStatus::Failed,
            4 => StorageStatus::Complete,
            5 => StorageStatus::Partial,
            6 => StorageStatus::Stale,
            _ => StorageStatus::Created,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetStatus {
    Created,
    Pending,
    Failed,
    Complete,
}

impl DatasetStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            DatasetStatus::Created => 1,
            DatasetStatus::Pending => 2,
            DatasetStatus::Failed => 3,
            DatasetStatus::Complete => 4,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            2 => DatasetStatus::Pending,
            3 => DatasetStatus::Failed,
            4 => DatasetStatus::Complete,
            _ => DatasetStatus::Created,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, DatasetStatus::Complete | DatasetStatus::Failed)
    }
}

impl Default for DatasetStatus {
    fn default() -> Self {
        DatasetStatus::Created
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// One indexed source root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Storage {
    pub id: i64,
    pub uri: StorageUri,
    pub timestamp: Option<i64>,
    pub expires: Option<i64>,
    pub started_inserting_at: Option<i64>,
    pub last_inserted_at: Option<i64>,
    pub status: StorageStatus,
    pub error_message: String,
    pub error_stack: String,
}

impl Storage {
    pub fn is_expired(&self) -> bool {
        is_expired(self.expires)
    }

    /// Index timestamp used to tag dependency edges for staleness checks.
    pub fn timestamp_str(&self) -> Option<String> {
        self.timestamp.map(format_unix)
    }

    pub fn expires_to_local(&self) -> String {
        self.expires.map(format_unix).unwrap_or_default()
    }
}

pub fn is_expired(expires: Option<i64>) -> bool {
    match expires {
        Some(ts) => ts <= now_unix(),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// Column types
// ---------------------------------------------------------------------------

/// Type of a custom dataset column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    String,
    Bool,
    Json,
    Bytes,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Int | ColumnType::Bool => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::String | ColumnType::Json => "TEXT",
            ColumnType::Bytes => "BLOB",
        }
    }

    /// Infer a column type from a sample value; `None` for JSON null.
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::Int),
            Value::Number(_) => Some(ColumnType::Float),
            Value::String(_) => Some(ColumnType::String),
            Value::Array(_) | Value::Object(_) => Some(ColumnType::Json),
        }
    }

    pub fn from_sql_type(sql: &str) -> Self {
        match sql.to_ascii_uppercase().as_str() {
            "INTEGER" => ColumnType::Int,
            "REAL" => ColumnType::Float,
            "BLOB" => ColumnType::Bytes,
            _ => ColumnType::String,
        }
    }
}

/// Union two column maps; on key collision the value from `dst` wins.
pub fn merge_column_types(src: &ColumnTypes, dst: &ColumnTypes) -> ColumnTypes {
    let mut merged = src.clone();
    for (name, ty) in dst {
        merged.insert(name.clone(), *ty);
    }
    merged
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

/// One immutable snapshot of a registered dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetVersion {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub dataset_id: i64,
    pub version: i64,
    #[serde(default)]
    pub sources: String,
    #[serde(default)]
    pub query_script: String,
    #[serde(default)]
    pub custom_column_types: ColumnTypes,
    #[serde(default)]
    pub status: DatasetStatus,
    #[serde(default)]
    pub created_at: String,
}

/// A named dataset, shadow or registered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub shadow: bool,
    #[serde(default)]
    pub status: DatasetStatus,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub error_stack: String,
    #[serde(default)]
    pub script_output: String,
    #[serde(default)]
    pub sources: String,
    #[serde(default)]
    pub query_script: String,
    #[serde(default)]
    pub custom_column_types: ColumnTypes,
    #[serde(default)]
    pub versions: Vec<DatasetVersion>,
}

impl DatasetRecord {
    pub fn registered(&self) -> bool {
        !self.shadow
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.versions.iter().map(|v| v.version).max()
    }

    pub fn next_version(&self) -> i64 {
        self.latest_version().unwrap_or(0) + 1
    }

    /// A new version must be strictly greater than every existing one.
    pub fn is_valid_next_version(&self, version: i64) -> bool {
        match self.latest_version() {
            Some(latest) => version > latest,
            None => version > 0,
        }
    }

    pub fn has_version(&self, version: i64) -> bool {
        self.versions.iter().any(|v| v.version == version)
    }

    pub fn get_version(&self, version: i64) -> CatalogResult<&DatasetVersion> {
        self.versions
            .iter()
            .find(|v| v.version == version)
            .ok_or_else(|| {
                CatalogError::validation(format!(
                    "Dataset {} doesn't have version {version}",
                    self.name
                ))
            })
    }

    pub fn sources_list(&self) -> Vec<String> {
        self.sources.split_whitespace().map(str::to_string).collect()
    }
}

/// Row count and total byte size of a dataset or version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub num_objects: i64,
    pub size: i64,
}

// ---------------------------------------------------------------------------
// Rows and nodes
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirType {
    File,
    Dir,
}

impl DirType {
    pub fn as_i64(self) -> i64 {
        match self {
            DirType::File => 0,
            DirType::Dir => 1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        if value == 1 {
            DirType::Dir
        } else {
            DirType::File
        }
    }
}

impl Default for DirType {
    fn default() -> Self {
        DirType::File
    }
}

/// One crawled object as reported by a client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileMeta {
    /// Path relative to the storage root, `/`-separated.
    pub path: String,
    pub size: i64,
    pub checksum: String,
    pub last_modified: String,
    pub custom: IndexMap<String, Value>,
}

/// One entry of a storage's partial index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    pub id: i64,
    pub parent: String,
    pub name: String,
    pub dir_type: DirType,
    pub size: i64,
    pub checksum: String,
    pub last_modified: String,
    pub custom: IndexMap<String, Value>,
}

impl Node {
    pub fn path(&self) -> String {
        join_path(&self.parent, &self.name)
    }

    pub fn is_dir(&self) -> bool {
        self.dir_type == DirType::Dir
    }
}

/// One cataloged item inside a dataset row table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    #[serde(default)]
    pub id: Option<i64>,
    pub source: String,
    #[serde(default)]
    pub parent: String,
    pub name: String,
    #[serde(default)]
    pub dir_type: DirType,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub last_modified: String,
    #[serde(flatten)]
    pub custom: IndexMap<String, Value>,
}

impl DatasetRow {
    pub fn path(&self) -> String {
        join_path(&self.parent, &self.name)
    }
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Split `a/b/c` into (`a/b`, `c`).
pub fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (String::new(), trimmed.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Dataset,
    Storage,
}

/// A lineage edge: the owning dataset/version was derived from a storage or
/// another dataset version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetDependency {
    pub id: i64,
    pub kind: DependencyKind,
    /// Dataset name or storage URI.
    pub name: String,
    /// Dataset version number, or the storage index timestamp.
    pub version: String,
    pub created_at: String,
    /// The target was deleted after the edge was recorded.
    #[serde(default)]
    pub dangling: bool,
    #[serde(default)]
    pub dependencies: Vec<DatasetDependency>,
}

impl DatasetDependency {
    pub fn is_dataset(&self) -> bool {
        self.kind == DependencyKind::Dataset
    }

    pub fn dataset_version(&self) -> Option<i64> {
        if self.is_dataset() {
            self.version.parse().ok()
        } else {
            None
        }
    }
}

/// Identity of an edge target; row ids and nested lineage are ignored.
impl PartialEq for DatasetDependency {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name && self.version == other.version
    }
}

impl Eq for DatasetDependency {}

impl std::hash::Hash for DatasetDependency {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.name.hash(state);
        self.version.hash(state);
    }
}

// ---------------------------------------------------------------------------
// Dataset URIs and source descriptors
// ---------------------------------------------------------------------------

static DATASET_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ds://(?P<name>[^@/\s]+)(?:@v?(?P<version>\d+))?$").expect("valid regex")
});

/// Parse `ds://name[@v<version>]`.
pub fn parse_dataset_uri(uri: &str) -> CatalogResult<(String, Option<i64>)> {
    let caps = DATASET_URI_RE
        .captures(uri.trim())
        .ok_or_else(|| CatalogError::validation(format!("Invalid dataset uri: {uri}")))?;
    let name = caps["name"].to_string();
    let version = match caps.name("version") {
        Some(v) => Some(
            v.as_str()
                .parse::<i64>()
                .map_err(|_| CatalogError::validation(format!("Invalid dataset uri: {uri}")))?,
        ),
        None => None,
    };
    Ok((name, version))
}

pub fn create_dataset_uri(name: &str, version: Option<i64>) -> String {
    match version {
        Some(v) => format!("{DATASET_PREFIX}{name}@v{v}"),
        None => format!("{DATASET_PREFIX}{name}"),
    }
}

/// What a user-supplied source string refers to, decided once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// A storage URI or local path, crawled through a client.
    Cloud(String),
    /// A `.edql` index file naming objects inside storages.
    LocalIndex(std::path::PathBuf),
    RegisteredDataset { name: String, version: Option<i64> },
}

impl SourceDescriptor {
    pub fn parse(source: &str) -> CatalogResult<Self> {
        if source.starts_with(DATASET_PREFIX) {
            let (name, version) = parse_dataset_uri(source)?;
            return Ok(SourceDescriptor::RegisteredDataset { name, version });
        }
        let path = std::path::Path::new(source);
        if source.ends_with(DATASET_FILE_SUFFIX) && path.is_file() {
            return Ok(SourceDescriptor::LocalIndex(path.to_path_buf()));
        }
        Ok(SourceDescriptor::Cloud(source.to_string()))
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Cloud(uri) => write!(f, "{uri}"),
            SourceDescriptor::LocalIndex(path) => write!(f, "{}", path.display()),
            SourceDescriptor::RegisteredDataset { name, version } => {
                write!(f, "{}", create_dataset_uri(name, *version))
            }
        }
    }
}
