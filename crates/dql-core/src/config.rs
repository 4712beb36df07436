//! Catalog configuration: TOML file plus `DQL_*` environment overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::CatalogResult;

/// Default index time-to-live (4 hours).
pub const TTL_INT: i64 = 4 * 60 * 60;
pub const MAX_THREADS_DATASET_ROWS_FETCHER: usize = 4;
pub const DATASET_ROWS_CHUNK_SIZE: i64 = 10_000;
pub const DEFAULT_RESULT_HOOK: &str = "dql.query.dataset";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    pub username: String,
    pub token: String,
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            token: String::new(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PullConfig {
    pub workers: usize,
    pub chunk_size: i64,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            workers: MAX_THREADS_DATASET_ROWS_FETCHER,
            chunk_size: DATASET_ROWS_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueryConfig {
    /// Executable the compiled script is handed to as `<interpreter> -c <script>`.
    pub interpreter: String,
    /// Module the compiled script imports `return_ds` from.
    pub result_hook: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            result_hook: DEFAULT_RESULT_HOOK.to_string(),
        }
    }
}

/// Top-level catalog configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CatalogConfig {
    pub db_path: PathBuf,
    pub ttl_secs: i64,
    pub remote: RemoteConfig,
    pub pull: PullConfig,
    pub query: QueryConfig,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".dql/db"),
            ttl_secs: TTL_INT,
            remote: RemoteConfig::default(),
            pull: PullConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl CatalogConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read a TOML config file, then apply environment overrides.
    pub fn load(path: &Path) -> CatalogResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> CatalogResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("DQL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse("DQL_TTL") {
            self.ttl_secs = v;
        }
        if let Some(v) = env_string("DQL_STUDIO_URL") {
            self.remote.url = v;
        }
        if let Some(v) = env_string("DQL_STUDIO_USERNAME") {
            self.remote.username = v;
        }
        if let Some(v) = env_string("DQL_STUDIO_TOKEN") {
            self.remote.token = v;
        }
        if let Some(v) = env_parse::<usize>("DQL_PULL_WORKERS") {
            self.pull.workers = v.max(1);
        }
        if let Some(v) = env_string("DQL_PYTHON") {
            self.query.interpreter = v;
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(val) => {
            let v = val.trim();
            if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            }
        }
        Err(_) => None,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}
