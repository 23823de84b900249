//! Remote bucket backend over plain HTTP.
//!
//! Talks to an S3-compatible gateway: objects live at
//! `{endpoint}/{bucket}/{key}` and listing uses `?list-type=2&prefix=`.
//! Authentication is an optional bearer token; request signing is left to
//! the gateway.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{Backend, StoredObject};
use crate::error::{StoreError, StoreResult};
use crate::key::{ArtifactKind, StorageKey};

/// Remote bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Gateway base URL, e.g. `https://bucket.example.net`
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Bearer token (optional for public read buckets)
    pub token: Option<String>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl BucketConfig {
    /// Create config for a specific endpoint and bucket
    pub fn new(endpoint: &str, bucket: &str) -> Self {
        BucketConfig {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            token: None,
            request_timeout_secs: 30,
        }
    }

    /// Read `SWARMGRAD_BUCKET_ENDPOINT`, `SWARMGRAD_BUCKET` and
    /// `SWARMGRAD_BUCKET_TOKEN`.
    pub fn from_env() -> StoreResult<Self> {
        let endpoint = std::env::var("SWARMGRAD_BUCKET_ENDPOINT")
            .map_err(|_| StoreError::NotConfigured("SWARMGRAD_BUCKET_ENDPOINT is not set".into()))?;
        let bucket = std::env::var("SWARMGRAD_BUCKET")
            .map_err(|_| StoreError::NotConfigured("SWARMGRAD_BUCKET is not set".into()))?;
        let mut config = Self::new(&endpoint, &bucket);
        config.token = std::env::var("SWARMGRAD_BUCKET_TOKEN").ok();
        Ok(config)
    }

    /// Set authentication token
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    fn object_url(&self, key: &StorageKey) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn list_url(&self, kind: ArtifactKind) -> String {
        format!(
            "{}/{}?list-type=2&prefix={}",
            self.endpoint,
            self.bucket,
            StorageKey::kind_prefix(kind)
        )
    }
}

/// Backend storing artifacts in a remote bucket.
pub struct RemoteBackend {
    config: BucketConfig,
    http_client: reqwest::Client,
}

impl RemoteBackend {
    pub fn new(config: BucketConfig) -> StoreResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("swarmgrad-store/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn from_env() -> StoreResult<Self> {
        Self::new(BucketConfig::from_env()?)
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }
}

/// Parse an HTTP `Last-Modified` header value.
fn parse_last_modified(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

static LIST_KEY: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"<Key>([^<]+)</Key>").ok());
static NEXT_TOKEN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"<NextContinuationToken>([^<]+)</NextContinuationToken>").ok());

/// One ListObjectsV2 response.
#[derive(Debug, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    /// Set while the listing is truncated.
    next_token: Option<String>,
}

fn parse_list_page(body: &str) -> ListPage {
    let keys = match LIST_KEY.as_ref() {
        Some(re) => re
            .captures_iter(body)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect(),
        None => Vec::new(),
    };
    let truncated = body.contains("<IsTruncated>true</IsTruncated>");
    let next_token = NEXT_TOKEN
        .as_ref()
        .filter(|_| truncated)
        .and_then(|re| re.captures(body))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    ListPage { keys, next_token }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn put(&self, key: &StorageKey, bytes: &[u8]) -> StoreResult<()> {
        let url = self.config.object_url(key);
        debug!(%url, len = bytes.len(), "uploading object");
        let response = self
            .authorize(self.http_client.put(&url))
            .body(bytes.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::RemoteStatus {
                status: response.status().as_u16(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, key: &StorageKey) -> StoreResult<Option<StoredObject>> {
        let url = self.config.object_url(key);
        let response = self.authorize(self.http_client.get(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(StoreError::RemoteStatus {
                    status: status.as_u16(),
                    key: key.to_string(),
                })
            }
            _ => {}
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_last_modified);
        if last_modified.is_none() {
            warn!(key = %key, "remote object has no usable Last-Modified header");
        }
        let bytes = response.bytes().await?.to_vec();
        Ok(Some(StoredObject {
            bytes,
            last_modified,
        }))
    }

    async fn delete(&self, key: &StorageKey) -> StoreResult<()> {
        let url = self.config.object_url(key);
        let response = self.authorize(self.http_client.delete(&url)).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(StoreError::RemoteStatus {
                status: status.as_u16(),
                key: key.to_string(),
            })
        }
    }

    async fn list(&self, role_id: &str, kind: ArtifactKind) -> StoreResult<Vec<StorageKey>> {
        let url = self.config.list_url(kind);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self.http_client.get(&url);
            if let Some(t) = &token {
                request = request.query(&[("continuation-token", t.as_str())]);
            }
            let response = self.authorize(request).send().await?;
            if !response.status().is_success() {
                return Err(StoreError::RemoteStatus {
                    status: response.status().as_u16(),
                    key: StorageKey::kind_prefix(kind),
                });
            }
            let page = parse_list_page(&response.text().await?);
            keys.extend(
                page.keys
                    .into_iter()
                    .filter_map(|k| k.parse::<StorageKey>().ok())
                    .filter(|k| k.kind == kind && k.role_id == role_id),
            );
            match page.next_token {
                Some(next) if token.as_deref() == Some(next.as_str()) => {
                    warn!(prefix = %StorageKey::kind_prefix(kind), "listing repeated its continuation token");
                    break;
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(keys)
    }
}
