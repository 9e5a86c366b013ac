use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::fs::{File, OpenOptions};
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use super::error::StorageError;
use crate::constants::{FILE_POOL_CAPACITY, FILE_POOL_TTL};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    path: PathBuf,
    write: bool,
}

/// An open file held by the pool.
///
/// The `Arc` count is the handle refcount: the pool keeps one reference,
/// every in-flight operation holds another, and eviction only closes the
/// underlying descriptor once the last clone drops.
pub struct PooledFile {
    pub file: TokioMutex<File>,
    last_used: parking_lot::Mutex<Instant>,
    write: bool,
}

impl PooledFile {
    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(*self.last_used.lock())
    }
}

/// Bounded LRU of open file handles, shared by every torrent.
///
/// Keys are `(path, writable)`; a read-only handle is replaced when a
/// writable one is requested for the same path. Handles idle beyond the
/// TTL, or beyond the capacity bound, are closed.
pub struct FilePool {
    handles: DashMap<PoolKey, Arc<PooledFile>>,
    capacity: usize,
    ttl: Duration,
}

impl FilePool {
    pub fn new() -> Self {
        Self::with_limits(FILE_POOL_CAPACITY, FILE_POOL_TTL)
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            handles: DashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Opens `path` (read-write + create when `write`), reusing a pooled
    /// handle when one exists. Missing parent directories are created for
    /// writable opens.
    pub async fn open(&self, path: &Path, write: bool) -> Result<Arc<PooledFile>, StorageError> {
        let key = PoolKey {
            path: path.to_path_buf(),
            write,
        };

        if let Some(handle) = self.handles.get(&key) {
            handle.touch();
            return Ok(handle.clone());
        }

        // A writable request supersedes a pooled read-only handle.
        if write {
            self.handles.remove(&PoolKey {
                path: path.to_path_buf(),
                write: false,
            });
        }

        let file = if write {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)
                .await?
        } else {
            File::open(path).await?
        };

        let handle = Arc::new(PooledFile {
            file: TokioMutex::new(file),
            last_used: parking_lot::Mutex::new(Instant::now()),
            write,
        });

        // A racing open for the same key may have inserted first; keep
        // whichever handle is pooled and let the loser live unpooled.
        let pooled = self
            .handles
            .entry(key)
            .or_insert_with(|| handle.clone())
            .clone();

        self.evict();
        Ok(pooled)
    }

    /// Drops every pooled handle for paths under `base`. Used when a
    /// torrent is removed or its data is moved.
    pub fn purge(&self, base: &Path) {
        self.handles.retain(|key, _| !key.path.starts_with(base));
    }

    /// Flushes and drops every writable handle.
    pub async fn sync_all(&self) {
        let keys: Vec<PoolKey> = self
            .handles
            .iter()
            .filter(|entry| entry.value().write)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                let file = handle.file.lock().await;
                let _ = file.sync_data().await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Closes idle handles, then least-recently-used handles while over
    /// capacity.
    fn evict(&self) {
        let now = Instant::now();

        let expired: Vec<PoolKey> = self
            .handles
            .iter()
            .filter(|entry| entry.value().idle_for(now) > self.ttl)
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            debug!(path = %key.path.display(), "closing expired file handle");
            self.handles.remove(&key);
        }

        while self.handles.len() > self.capacity {
            let oldest = self
                .handles
                .iter()
                .max_by_key(|entry| entry.value().idle_for(now))
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.handles.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for FilePool {
    fn default() -> Self {
        Self::new()
    }
}
