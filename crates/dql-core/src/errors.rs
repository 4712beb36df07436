//! Error types for the dataset catalog.

/// Top-level error enum for the catalog engine.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Another indexer currently owns the storage. Callers may wait and retry.
    #[error("Pending indexing operation: uri={0}")]
    PendingIndexing(String),

    #[error("{0}")]
    Validation(String),

    #[error("Error from server: {0}")]
    Remote(String),

    #[error("Storage {0} not found.")]
    StorageNotFound(String),

    #[error("Dataset {0} not found.")]
    DatasetNotFound(String),

    #[error("Indexing error: {0}")]
    Indexing(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Query script failed to compile, reason: {0}")]
    QueryScriptCompile(String),

    #[error("{message}")]
    QueryScriptRun {
        message: String,
        return_code: Option<i32>,
        output: String,
    },

    #[error("Query script was canceled by user")]
    QueryScriptCancel { return_code: i32, output: String },

    #[error("No dataset found after running Query script")]
    QueryScriptDatasetNotFound { output: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CatalogError {
    /// Whether the operation may succeed if simply retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CatalogError::PendingIndexing(_))
    }

    /// Captured subprocess output for query-script failures.
    pub fn output(&self) -> Option<&str> {
        match self {
            CatalogError::QueryScriptRun { output, .. }
            | CatalogError::QueryScriptCancel { output, .. }
            | CatalogError::QueryScriptDatasetNotFound { output } => Some(output),
            _ => None,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        CatalogError::Validation(msg.into())
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;
