use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::{normalize_base_url, FleetConfig};
use crate::models::PendingSyncItem;
use crate::offline::{RemoteRecord, RemoteSource, SyncItemError};

/// REST collaborator: backfill collections and the remote side of offline sync.
#[derive(Debug, Clone)]
pub struct FleetApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl FleetApiClient {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", key))
                    .map_err(|e| anyhow!("Invalid API key header: {}", e))?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self { base_url, http })
    }

    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        Self::new(&config.api_url, config.api_key.as_deref())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ===== BACKFILL =====

    pub async fn get_vehicles(&self) -> Result<Vec<Value>> {
        self.get_collection("vehicles").await
    }

    pub async fn get_geofences(&self) -> Result<Vec<Value>> {
        self.get_collection("geofences").await
    }

    pub async fn get_alerts(&self) -> Result<Vec<Value>> {
        self.get_collection("alerts").await
    }

    /// Items come back unvalidated; callers run them through the processor.
    async fn get_collection(&self, collection: &str) -> Result<Vec<Value>> {
        let url = format!("{}/{}", self.base_url, collection);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(url = %url, status = %status, "Fetched backfill collection");
        if !status.is_success() {
            return Err(anyhow!("GET {} failed with {}: {}", url, status, body));
        }
        parse_collection(&body)
    }

    fn record_url(&self, item: &PendingSyncItem) -> Result<String, SyncItemError> {
        let id = item.record_id().ok_or_else(|| {
            SyncItemError::Recoverable(format!("item {} payload has no id", item.id))
        })?;
        Ok(format!("{}/{}/{}", self.base_url, item.kind.collection(), id))
    }
}

#[async_trait]
impl RemoteSource for FleetApiClient {
    async fn fetch(&self, item: &PendingSyncItem) -> Result<Option<RemoteRecord>, SyncItemError> {
        let url = self.record_url(item)?;
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncItemError::Unrecoverable(format!("GET {}: {}", url, e)))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .map_err(|e| SyncItemError::Unrecoverable(format!("GET {}: {}", url, e)))?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let value: Value = serde_json::from_str(&body).map_err(|e| {
            SyncItemError::Recoverable(format!("GET {} returned invalid JSON: {}", url, e))
        })?;
        Ok(Some(remote_record_from_value(value)))
    }

    async fn push(&self, item: &PendingSyncItem) -> Result<(), SyncItemError> {
        let url = self.record_url(item)?;
        let response = self
            .http
            .put(&url)
            .json(&item.payload)
            .send()
            .await
            .map_err(|e| SyncItemError::Unrecoverable(format!("PUT {}: {}", url, e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn delete(&self, item: &PendingSyncItem) -> Result<(), SyncItemError> {
        let url = self.record_url(item)?;
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| SyncItemError::Unrecoverable(format!("DELETE {}: {}", url, e)))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// Parses a JSON array body, surfacing the server's error message otherwise.
pub fn parse_collection(body: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => {
            if let Some(error) = other.get("error") {
                Err(anyhow!("API error: {}", error))
            } else if let Some(message) = other.get("message") {
                Err(anyhow!("API message: {}", message))
            } else {
                Err(anyhow!("API returned unexpected format: {}", body))
            }
        }
        Err(_) => Err(anyhow!("Failed to parse API response as JSON: {}", body)),
    }
}

/// Auth failures and server errors end the sync pass; anything else is
/// specific to the item.
pub fn classify_status(status: StatusCode, body: &str) -> SyncItemError {
    let message = format!("remote returned {}: {}", status, body);
    if status.is_server_error()
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
    {
        SyncItemError::Unrecoverable(message)
    } else {
        SyncItemError::Recoverable(message)
    }
}

pub fn remote_record_from_value(payload: Value) -> RemoteRecord {
    let updated_at = ["updatedAt", "lastUpdate", "createdAt", "timestamp"]
        .iter()
        .find_map(|field| {
            payload
                .get(*field)
                .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
        });
    let version = payload.get("version").and_then(Value::as_u64);
    RemoteRecord {
        payload,
        updated_at,
        version,
    }
}
