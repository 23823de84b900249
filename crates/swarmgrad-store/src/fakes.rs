//! In-memory fake backend (testing only)
//!
//! `MemoryBackend` satisfies the [`Backend`] contract without touching disk or
//! network. The publish clock is settable so tests can place artifacts
//! exactly on window boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::backend::{Backend, StoredObject};
use crate::error::{StoreError, StoreResult};
use crate::key::{ArtifactKind, StorageKey};

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    published_at: Option<DateTime<Utc>>,
}

/// In-memory backend backed by a `HashMap<key, entry>`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Entry>>,
    /// Timestamp stamped on the next puts. `None` means wall clock.
    clock: Mutex<Option<DateTime<Utc>>>,
    /// When set, objects are stored without a publish timestamp.
    hide_timestamps: AtomicBool,
    /// When set, every call fails with a transient error.
    failing: AtomicBool,
    /// Added to every read.
    read_delay: Mutex<Option<Duration>>,
    get_calls: AtomicU64,
    put_calls: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the publish timestamp for subsequent puts.
    pub fn set_time(&self, at: Option<DateTime<Utc>>) {
        *self.clock.lock().unwrap() = at;
    }

    /// Store subsequent puts without a publish timestamp.
    pub fn hide_timestamps(&self, hide: bool) {
        self.hide_timestamps.store(hide, Ordering::SeqCst);
    }

    /// Make every call fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stall every subsequent `get` by `delay`.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock().unwrap() = delay;
    }

    /// Insert raw bytes under `key` with an explicit publish time.
    pub fn insert_raw(&self, key: &StorageKey, bytes: Vec<u8>, published_at: Option<DateTime<Utc>>) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            Entry {
                bytes,
                published_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.objects.lock().unwrap().contains_key(&key.to_string())
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::SeqCst)
    }

    fn check_failing(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Remote("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &StorageKey, bytes: &[u8]) -> StoreResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        let published_at = if self.hide_timestamps.load(Ordering::SeqCst) {
            None
        } else {
            Some(self.clock.lock().unwrap().unwrap_or_else(Utc::now))
        };
        self.insert_raw(key, bytes.to_vec(), published_at);
        Ok(())
    }

    async fn get(&self, key: &StorageKey) -> StoreResult<Option<StoredObject>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_failing()?;
        let objects = self.objects.lock().unwrap();
        Ok(objects.get(&key.to_string()).map(|e| StoredObject {
            bytes: e.bytes.clone(),
            last_modified: e.published_at,
        }))
    }

    async fn delete(&self, key: &StorageKey) -> StoreResult<()> {
        self.check_failing()?;
        self.objects.lock().unwrap().remove(&key.to_string());
        Ok(())
    }

    async fn list(&self, role_id: &str, kind: ArtifactKind) -> StoreResult<Vec<StorageKey>> {
        self.check_failing()?;
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .keys()
            .filter_map(|k| k.parse::<StorageKey>().ok())
            .filter(|k| k.kind == kind && k.role_id == role_id)
            .collect())
    }
}
