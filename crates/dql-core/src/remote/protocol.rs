//! Remote dataset service protocol.
//!
//! Every response shares an `{ok, message, data}` envelope; a response with
//! `ok = false` becomes [`CatalogError::Remote`] carrying the server message.

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RemoteConfig;
use crate::errors::{CatalogError, CatalogResult};
use crate::models::{DatasetRecord, DatasetRow, DatasetStats};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    /// Unwrap the payload or raise the server's message.
    pub fn into_result(self) -> CatalogResult<T> {
        if !self.ok {
            return Err(CatalogError::Remote(self.message));
        }
        self.data
            .ok_or_else(|| CatalogError::Remote("response carried no data".to_string()))
    }
}

/// Operations the catalog needs from a remote dataset service.
pub trait RemoteService: Send + Sync {
    /// Dataset metadata including every published version.
    fn dataset_info(&self, name: &str) -> CatalogResult<DatasetRecord>;

    fn dataset_stats(&self, name: &str, version: i64) -> CatalogResult<DatasetStats>;

    /// Rows `[offset, offset + limit)` of a dataset version.
    fn dataset_rows_chunk(
        &self,
        name: &str,
        version: i64,
        offset: i64,
        limit: i64,
    ) -> CatalogResult<Vec<DatasetRow>>;

    /// Independent handle for a concurrent worker.
    fn clone_service(&self) -> Arc<dyn RemoteService>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// JSON-over-HTTP client for the remote dataset service.
#[derive(Clone, Debug)]
pub struct StudioClient {
    http: HttpClient,
    base_url: String,
    username: String,
    token: String,
}

impl StudioClient {
    pub fn new(config: &RemoteConfig) -> CatalogResult<Self> {
        if config.url.trim().is_empty() {
            return Err(CatalogError::validation("remote url is not configured"));
        }
        let http = HttpClient::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            token: config.token.clone(),
        })
    }

    fn get<T: DeserializeOwned>(&self, route: &str, query: &[(&str, String)]) -> CatalogResult<T> {
        let url = format!("{}/api/{route}", self.base_url);
        debug!(url = %url, "remote request");
        let mut request = self.http.get(&url).query(query);
        if !self.username.is_empty() {
            request = request.query(&[("team_name", self.username.as_str())]);
        }
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("token {}", self.token));
        }
        let response = request.send()?;
        let status = response.status();
        let envelope: Envelope<T> = match response.json() {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(CatalogError::Remote(format!(
                    "{route} failed with HTTP {}",
                    status.as_u16()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        envelope.into_result()
    }
}

impl RemoteService for StudioClient {
    fn dataset_info(&self, name: &str) -> CatalogResult<DatasetRecord> {
        self.get("dataset-info", &[("dataset_name", name.to_string())])
    }

    fn dataset_stats(&self, name: &str, version: i64) -> CatalogResult<DatasetStats> {
        self.get(
            "dataset-stats",
            &[
                ("dataset_name", name.to_string()),
                ("dataset_version", version.to_string()),
            ],
        )
    }

    fn dataset_rows_chunk(
        &self,
        name: &str,
        version: i64,
        offset: i64,
        limit: i64,
    ) -> CatalogResult<Vec<DatasetRow>> {
        self.get(
            "dataset-rows-chunk",
            &[
                ("dataset_name", name.to_string()),
                ("dataset_version", version.to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ],
        )
    }

    fn clone_service(&self) -> Arc<dyn RemoteService> {
        Arc::new(self.clone())
    }
}
