use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::{Backend, StoredObject};
use crate::error::StoreResult;
use crate::key::{ArtifactKind, StorageKey};

/// Filesystem backend with role-scoped, window-sharded directories.
///
/// Layout: `<root>/<role_id>/<window>/<kind>-<window>-<role_id>-v<version>`
///
/// All mutations take a single process-wide lock; reads do not.
pub struct LocalBackend {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalBackend {
    /// Create a backend rooted at `root`. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn window_dir(&self, key: &StorageKey) -> PathBuf {
        self.root.join(&key.role_id).join(key.window.to_string())
    }

    fn object_path(&self, key: &StorageKey) -> PathBuf {
        self.window_dir(key).join(key.to_string())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &StorageKey, bytes: &[u8]) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let dir = self.window_dir(key);
        fs::create_dir_all(&dir)?;

        // Atomic write: temp file in the same directory, then rename over the key.
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(self.object_path(key)).map_err(|e| e.error)?;
        Ok(())
    }

    async fn get(&self, key: &StorageKey) -> StoreResult<Option<StoredObject>> {
        let path = self.object_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let last_modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(Some(StoredObject {
            bytes,
            last_modified,
        }))
    }

    async fn delete(&self, key: &StorageKey) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let path = self.object_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        // Drop the window directory once it is empty.
        let dir = self.window_dir(key);
        if fs::read_dir(&dir)?.next().is_none() {
            fs::remove_dir(&dir)?;
            debug!(dir = %dir.display(), "removed empty window directory");
        }
        Ok(())
    }

    async fn list(&self, role_id: &str, kind: ArtifactKind) -> StoreResult<Vec<StorageKey>> {
        let role_dir = self.root.join(role_id);
        let window_dirs = match fs::read_dir(&role_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for window_dir in window_dirs {
            let window_dir = window_dir?;
            if !window_dir.file_type()?.is_dir() {
                continue;
            }
            // A concurrent delete may have pruned the directory since.
            let files = match fs::read_dir(window_dir.path()) {
                Ok(files) => files,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for file in files {
                let file = file?;
                let name = file.file_name();
                let Some(name) = name.to_str() else { continue };
                // Temp files and foreign files simply fail to parse.
                if let Ok(key) = name.parse::<StorageKey>() {
                    if key.kind == kind && key.role_id == role_id {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }
}
