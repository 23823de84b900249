//! `ObjectStore`: the publish/fetch/cleanup contract on top of a [`Backend`].
//!
//! - `publish` writes under the canonical key with bounded retry, then spawns
//!   retention cleanup for the `(role_id, kind)` series in the background.
//! - `fetch` never surfaces transport errors: they are logged and reported
//!   as [`FetchOutcome::Absent`]. Window gating applies only when both a
//!   [`TimeWindow`] is supplied and the backend reports a publish time.
//! - `cleanup` keeps the newest `retain_n` windows (oldest removed first).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::StoreResult;
use crate::key::{ArtifactKind, StorageKey};
use crate::retry::{retry, RetryPolicy};
use crate::window::{TimeWindow, WindowPosition};

/// Metadata of one successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub role_id: String,
    pub window: u64,
    pub kind: ArtifactKind,
    pub version: String,
    pub payload_len: usize,
    /// Hex-encoded SHA-256 of the payload.
    pub digest: String,
    pub timestamp: DateTime<Utc>,
}

impl PublishRecord {
    pub fn key(&self) -> StorageKey {
        StorageKey::new(self.kind, self.window, &self.role_id, &self.version)
    }
}

/// Result of a gated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(Vec<u8>),
    /// Published before `time_min`.
    TooEarly,
    /// Published after `time_max`.
    TooLate,
    /// Missing, unreadable, or the backend failed.
    Absent,
}

impl FetchOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, FetchOutcome::Found(_))
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            FetchOutcome::Found(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Found(_) => "found",
            FetchOutcome::TooEarly => "too_early",
            FetchOutcome::TooLate => "too_late",
            FetchOutcome::Absent => "absent",
        }
    }
}

/// Result of a retention pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionResult {
    pub removed_count: usize,
    pub remaining_count: usize,
    pub removed_keys: Vec<String>,
}

/// Status marker some writers store in place of a payload.
#[derive(Deserialize)]
struct StatusMarker {
    #[serde(rename = "__status")]
    status: String,
}

/// Marker bodies are tiny; anything larger is a real payload.
const MARKER_MAX_LEN: usize = 64;

fn status_marker(bytes: &[u8]) -> Option<FetchOutcome> {
    if bytes.len() > MARKER_MAX_LEN {
        return None;
    }
    let marker: StatusMarker = serde_json::from_slice(bytes).ok()?;
    match marker.status.as_str() {
        "TOO_EARLY" => Some(FetchOutcome::TooEarly),
        "TOO_LATE" => Some(FetchOutcome::TooLate),
        _ => None,
    }
}

/// Window-keyed artifact store.
pub struct ObjectStore {
    backend: Arc<dyn Backend>,
    version: String,
    retention_count: usize,
    retention_overrides: HashMap<ArtifactKind, usize>,
    retry: RetryPolicy,
    cleanup_tasks: Mutex<JoinSet<()>>,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn Backend>, version: impl Into<String>, retention_count: usize) -> Self {
        Self {
            backend,
            version: version.into(),
            retention_count,
            retention_overrides: HashMap::new(),
            retry: RetryPolicy::default(),
            cleanup_tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Keep a different number of windows for one kind (e.g. checkpoints).
    pub fn with_retention(mut self, kind: ArtifactKind, retain_n: usize) -> Self {
        self.retention_overrides.insert(kind, retain_n);
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn retention_for(&self, kind: ArtifactKind) -> usize {
        self.retention_overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.retention_count)
    }

    fn key(&self, role_id: &str, window: u64, kind: ArtifactKind) -> StorageKey {
        StorageKey::new(kind, window, role_id, &self.version)
    }

    /// Write `payload` for `(role_id, window, kind)` and schedule retention.
    pub async fn publish(
        &self,
        role_id: &str,
        window: u64,
        kind: ArtifactKind,
        payload: &[u8],
    ) -> StoreResult<PublishRecord> {
        let key = self.key(role_id, window, kind);
        let operation = format!("put {key}");
        retry(&self.retry, &operation, || self.backend.put(&key, payload)).await?;

        let record = PublishRecord {
            role_id: role_id.to_string(),
            window,
            kind,
            version: self.version.clone(),
            payload_len: payload.len(),
            digest: hex::encode(Sha256::digest(payload)),
            timestamp: Utc::now(),
        };
        debug!(key = %key, backend = self.backend.name(), len = payload.len(), "published");

        let backend = Arc::clone(&self.backend);
        let role = role_id.to_string();
        let retain_n = self.retention_for(kind);
        let mut tasks = self.cleanup_tasks.lock().await;
        // Reap finished cleanups so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(e) = run_cleanup(backend.as_ref(), &role, kind, retain_n).await {
                warn!(role = %role, kind = %kind, error = %e, "retention cleanup failed");
            }
        });

        Ok(record)
    }

    /// Read `(role_id, window, kind)`, gated by `time_window` when given.
    pub async fn fetch(
        &self,
        role_id: &str,
        window: u64,
        kind: ArtifactKind,
        time_window: Option<&TimeWindow>,
    ) -> FetchOutcome {
        let key = self.key(role_id, window, kind);
        let operation = format!("get {key}");
        let object = match retry(&self.retry, &operation, || self.backend.get(&key)).await {
            Ok(Some(object)) => object,
            Ok(None) => return FetchOutcome::Absent,
            Err(e) => {
                warn!(key = %key, error = %e, "fetch failed; treating as absent");
                return FetchOutcome::Absent;
            }
        };

        if let Some(sentinel) = status_marker(&object.bytes) {
            debug!(key = %key, outcome = sentinel.label(), "status marker");
            return sentinel;
        }

        if let (Some(tw), Some(published_at)) = (time_window, object.last_modified) {
            match tw.classify(published_at) {
                WindowPosition::TooEarly => return FetchOutcome::TooEarly,
                WindowPosition::TooLate => return FetchOutcome::TooLate,
                WindowPosition::Inside => {}
            }
        }

        FetchOutcome::Found(object.bytes)
    }

    /// Delete all but the newest `retain_n` windows of `(role_id, kind)`.
    pub async fn cleanup(
        &self,
        role_id: &str,
        kind: ArtifactKind,
        retain_n: usize,
    ) -> StoreResult<RetentionResult> {
        run_cleanup(self.backend.as_ref(), role_id, kind, retain_n).await
    }

    /// Windows stored for `(role_id, kind)` at this store's version, ascending.
    pub async fn list_windows(&self, role_id: &str, kind: ArtifactKind) -> StoreResult<Vec<u64>> {
        let mut windows: Vec<u64> = self
            .backend
            .list(role_id, kind)
            .await?
            .into_iter()
            .filter(|k| k.in_series(role_id, kind, &self.version))
            .map(|k| k.window)
            .collect();
        windows.sort_unstable();
        windows.dedup();
        Ok(windows)
    }

    pub async fn latest_window(&self, role_id: &str, kind: ArtifactKind) -> StoreResult<Option<u64>> {
        Ok(self.list_windows(role_id, kind).await?.last().copied())
    }

    /// Wait for every scheduled retention pass to finish.
    pub async fn settle(&self) {
        let mut tasks = self.cleanup_tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "retention task panicked");
            }
        }
    }
}

/// Oldest-first retention over every version of the series.
async fn run_cleanup(
    backend: &dyn Backend,
    role_id: &str,
    kind: ArtifactKind,
    retain_n: usize,
) -> StoreResult<RetentionResult> {
    let mut keys = backend.list(role_id, kind).await?;
    // Oldest window first, then version for deterministic tie-breaking.
    keys.sort_by(|a, b| a.window.cmp(&b.window).then_with(|| a.version.cmp(&b.version)));

    let total = keys.len();
    let to_remove = total.saturating_sub(retain_n);
    let mut removed_keys = Vec::with_capacity(to_remove);
    for key in keys.into_iter().take(to_remove) {
        backend.delete(&key).await?;
        removed_keys.push(key.to_string());
    }

    if !removed_keys.is_empty() {
        debug!(role = role_id, kind = %kind, removed = removed_keys.len(), "retention pass");
    }

    Ok(RetentionResult {
        removed_count: removed_keys.len(),
        remaining_count: total - removed_keys.len(),
        removed_keys,
    })
}
