//! Backend trait shared by the local, remote and in-memory stores.
//!
//! Backends are dumb blob stores addressed by [`StorageKey`]. Window gating,
//! retries and retention live one layer up in [`crate::ObjectStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::key::{ArtifactKind, StorageKey};

/// Bytes read back from a backend.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    /// Server-side publish time, when the backend exposes one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Key/value blob backend.
///
/// Guarantees:
/// - `put` overwrites an existing object under the same key.
/// - `get` returns `Ok(None)` for a missing key; errors are transport failures.
/// - `delete` of a missing key is a no-op.
/// - `list` returns every key of `kind` published by `role_id`, any version.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short label used in logs (`"local"`, `"remote"`, `"memory"`).
    fn name(&self) -> &'static str;

    async fn put(&self, key: &StorageKey, bytes: &[u8]) -> StoreResult<()>;

    async fn get(&self, key: &StorageKey) -> StoreResult<Option<StoredObject>>;

    async fn delete(&self, key: &StorageKey) -> StoreResult<()>;

    async fn list(&self, role_id: &str, kind: ArtifactKind) -> StoreResult<Vec<StorageKey>>;
}
