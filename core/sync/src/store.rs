//! Durable snapshots for the rule cache and the delivery queue.
//!
//! Snapshots are JSON files replaced atomically (write to a temporary file,
//! then rename), so a crash mid-write leaves the previous snapshot intact.
//! A [`StateDirLock`] keeps a state directory to one engine at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use edgesync_common::{CachedRules, Error, QueueItem, Result};

/// Storage for the last known-good rule update.
#[async_trait]
pub trait RuleCache: Send + Sync {
    /// Load the cached update, if any.
    async fn load(&self) -> Result<Option<CachedRules>>;

    /// Replace the cached update.
    async fn save(&self, rules: &CachedRules) -> Result<()>;
}

/// In-memory rule cache, for tests and ephemeral agents.
#[derive(Default)]
pub struct MemoryRuleCache {
    rules: RwLock<Option<CachedRules>>,
}

impl MemoryRuleCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleCache for MemoryRuleCache {
    async fn load(&self) -> Result<Option<CachedRules>> {
        Ok(self.rules.read().clone())
    }

    async fn save(&self, rules: &CachedRules) -> Result<()> {
        *self.rules.write() = Some(rules.clone());
        Ok(())
    }
}

/// Rule cache stored as a JSON file.
pub struct FileRuleCache {
    path: PathBuf,
}

impl FileRuleCache {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RuleCache for FileRuleCache {
    async fn load(&self) -> Result<Option<CachedRules>> {
        read_json(&self.path).await
    }

    async fn save(&self, rules: &CachedRules) -> Result<()> {
        write_json_atomic(&self.path, rules).await
    }
}

/// On-disk form of the delivery queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub saved_at: DateTime<Utc>,
    pub items: Vec<QueueItem>,
}

/// Queue snapshot stored as a JSON file.
///
/// Clones share one writer lock, so saves through any clone land on disk in
/// the order they were taken.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
    writer: Arc<Mutex<()>>,
}

impl QueueStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved items. A missing file is an empty queue.
    pub async fn load(&self) -> Result<Vec<QueueItem>> {
        let snapshot: Option<QueueSnapshot> = read_json(&self.path).await?;
        Ok(snapshot.map(|s| s.items).unwrap_or_default())
    }

    /// Replace the saved items.
    pub async fn save(&self, items: Vec<QueueItem>) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.write(items).await
    }

    /// Replace the saved items with the output of `export`.
    ///
    /// `export` runs under the writer lock, so a later call can never be
    /// overwritten by an earlier, staler snapshot.
    pub async fn save_with<F, Fut>(&self, export: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Vec<QueueItem>>,
    {
        let _writer = self.writer.lock().await;
        let items = export().await;
        self.write(items).await
    }

    async fn write(&self, items: Vec<QueueItem>) -> Result<()> {
        let snapshot = QueueSnapshot {
            saved_at: Utc::now(),
            items,
        };
        write_json_atomic(&self.path, &snapshot).await
    }
}

/// Lock file name inside a state directory.
pub const LOCK_FILE: &str = "edgesync.lock";

/// Exclusive advisory lock on a state directory, released on drop.
#[derive(Debug)]
pub struct StateDirLock {
    path: PathBuf,
    _file: File,
}

impl StateDirLock {
    /// Lock `dir`, creating it if needed.
    ///
    /// # Errors
    /// - `Error::StateLocked` if another engine holds the directory
    /// - `Error::Persistence` if the directory or lock file cannot be created
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Persistence(format!("Cannot create {}: {}", dir.display(), e)))?;

        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Persistence(format!("Cannot open {}: {}", path.display(), e)))?;

        if file.try_lock_exclusive().is_err() {
            return Err(Error::StateLocked(dir.display().to_string()));
        }

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| Error::Serialization(format!("Corrupt snapshot {}: {}", path.display(), e)))
}

async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::Persistence(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }
    }

    // Unique per write so overlapping writers never share a temporary file.
    let tmp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    if let Err(e) = fs::write(&tmp_path, json).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(Error::Persistence(format!(
            "Cannot write {}: {}",
            tmp_path.display(),
            e
        )));
    }
    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(Error::Persistence(format!(
            "Cannot replace {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}
