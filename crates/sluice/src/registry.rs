//! Schema registry client
//!
//! Resolves per-table schema descriptors by model version. Fetched
//! descriptors are cached in memory and persisted into the tracker so a
//! restart can serve the last-known schema while the API is unreachable.
//!
//! Transient upstream failures (connection reset, 408, 429, 5xx) are
//! retried with exponential backoff and jitter; everything else is
//! terminal.

use crate::error::{Result, SluiceError};
use crate::retry::{retry_result, RetryConfig};
use crate::schema::{Schema, SchemaMap};
use crate::tracker::Tracker;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lookup interface the consumer and drivers depend on.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Descriptor for `table` at the version referenced by an event.
    async fn get_schema(&self, table: &str, model_version: &str) -> Result<Schema>;

    /// Latest descriptor for every table.
    async fn get_latest_schema_map(&self) -> Result<SchemaMap>;
}

#[derive(Debug, Deserialize)]
struct SchemaEnvelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<Schema>,
}

#[derive(Debug, Deserialize)]
struct SchemaMapEnvelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<SchemaMap>,
}

/// HTTP-backed registry client.
pub struct ApiRegistry {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cache: RwLock<HashMap<String, Schema>>,
    tracker: Arc<Tracker>,
    retry: RetryConfig,
    data_dir: PathBuf,
}

impl ApiRegistry {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        tracker: Arc<Tracker>,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SluiceError::registry(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            cache: RwLock::new(HashMap::new()),
            tracker,
            retry: RetryConfig::default(),
            data_dir: data_dir.into(),
        })
    }

    fn cache_key(table: &str, model_version: &str) -> String {
        format!("{table}-{model_version}")
    }

    fn tracker_key(table: &str, model_version: &str) -> String {
        format!("schema.{table}.{model_version}")
    }

    /// Transient statuses per the retry policy.
    fn status_is_retryable(status: StatusCode) -> bool {
        status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
    }

    fn request_error(err: reqwest::Error) -> SluiceError {
        // reqwest surfaces resets and timeouts as connect/timeout errors
        if err.is_timeout() || err.is_connect() {
            SluiceError::Transient(err.to_string())
        } else {
            SluiceError::registry(err.to_string())
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        retry_result(&self.retry, || async {
            let mut req = self.client.get(url);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            let resp = req.send().await.map_err(Self::request_error)?;
            let status = resp.status();
            if !status.is_success() {
                let msg = format!("GET {url}: unexpected status {status}");
                return if Self::status_is_retryable(status) {
                    Err(SluiceError::Transient(msg))
                } else {
                    Err(SluiceError::registry(msg))
                };
            }
            resp.json::<T>().await.map_err(Self::request_error)
        })
        .await
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Write `schema.json` and `tables.json` snapshots into the data dir.
    fn write_snapshots(&self, map: &SchemaMap) {
        let tables: Vec<&String> = {
            let mut t: Vec<&String> = map.keys().collect();
            t.sort();
            t
        };
        for (name, bytes) in [
            ("schema.json", serde_json::to_vec_pretty(map)),
            ("tables.json", serde_json::to_vec_pretty(&tables)),
        ] {
            match bytes {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(self.snapshot_path(name), bytes) {
                        warn!(file = name, error = %e, "failed writing registry snapshot");
                    }
                }
                Err(e) => warn!(file = name, error = %e, "failed encoding registry snapshot"),
            }
        }
    }
}

#[async_trait]
impl SchemaRegistry for ApiRegistry {
    async fn get_schema(&self, table: &str, model_version: &str) -> Result<Schema> {
        let key = Self::cache_key(table, model_version);
        if let Some(schema) = self.cache.read().get(&key) {
            return Ok(schema.clone());
        }

        let url = format!("{}/v3/schema/{table}/{model_version}", self.base_url);
        let fetched = self.get_json::<SchemaEnvelope>(&url).await;

        let schema = match fetched {
            Ok(envelope) => {
                if !envelope.success {
                    return Err(SluiceError::SchemaNotFound {
                        table: table.to_string(),
                        model_version: model_version.to_string(),
                    });
                }
                envelope.data.ok_or_else(|| {
                    SluiceError::registry(envelope.message.unwrap_or_else(|| {
                        format!("empty schema response for {table}/{model_version}")
                    }))
                })?
            }
            Err(err) => {
                // serve the last-known descriptor when the API is down
                let cached = self
                    .tracker
                    .get_json::<Schema>(&Self::tracker_key(table, model_version))?;
                match cached {
                    Some(schema) => {
                        warn!(table, model_version, error = %err,
                            "registry unreachable, using tracker-cached schema");
                        schema
                    }
                    None => return Err(err),
                }
            }
        };

        if let Err(e) = self
            .tracker
            .set_json(&Self::tracker_key(table, model_version), &schema)
        {
            warn!(table, model_version, error = %e, "failed persisting schema to tracker");
        }
        debug!(table, model_version, "resolved schema");
        self.cache.write().insert(key, schema.clone());
        Ok(schema)
    }

    async fn get_latest_schema_map(&self) -> Result<SchemaMap> {
        let url = format!("{}/v3/schema", self.base_url);
        let envelope = self.get_json::<SchemaMapEnvelope>(&url).await?;
        if !envelope.success {
            return Err(SluiceError::registry(
                envelope
                    .message
                    .unwrap_or_else(|| "schema map request failed".to_string()),
            ));
        }
        let map = envelope.data.unwrap_or_default();
        self.write_snapshots(&map);
        Ok(map)
    }
}
