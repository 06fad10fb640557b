use anyhow::{Context, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// Filesystem-backed store for thumbnail derivatives. The cache has no
/// index: the derivative's path encodes its identity, and freshness is
/// decided by comparing file modification times.
#[derive(Clone)]
pub struct CacheStore {
    thumb_dir: PathBuf,
}

/// Result of a cache probe: the file's bytes plus the mtime used for
/// `Last-Modified` and staleness decisions.
#[derive(Debug)]
pub struct CachedFile {
    pub bytes: Vec<u8>,
    pub modified: SystemTime,
}

impl CacheStore {
    pub fn new(thumb_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(thumb_dir)
            .with_context(|| format!("create thumbnail directory {:?}", thumb_dir))?;
        Ok(Self {
            thumb_dir: thumb_dir.to_path_buf(),
        })
    }

    pub fn thumb_dir(&self) -> &Path {
        &self.thumb_dir
    }

    /// Reads a cache entry together with its mtime. `None` when absent or
    /// unreadable; a vanished entry is indistinguishable from a miss.
    pub async fn load(&self, path: &Path) -> Option<CachedFile> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        let modified = metadata.modified().ok()?;
        let bytes = tokio::fs::read(path).await.ok()?;
        Some(CachedFile { bytes, modified })
    }

    /// Writes a derivative so that concurrent readers observe either the
    /// whole file or nothing: the bytes land in a temporary sibling which is
    /// then renamed over the destination.
    pub async fn store(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("thumb");
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let temp_path = parent.join(format!(".{file_name}.tmp-{nonce}"));
        if let Err(err) = tokio::fs::write(&temp_path, bytes).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        if let Err(err) = tokio::fs::rename(&temp_path, path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

pub async fn modified_time(path: &Path) -> Option<SystemTime> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    metadata.modified().ok()
}

/// Collapses concurrent generations of the same cache entry: the first
/// request for a key becomes the leader, later ones wait for it to finish
/// and then re-probe the cache before generating themselves.
#[derive(Clone)]
pub struct GenerationSingleflight {
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl GenerationSingleflight {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn acquire(&self, key: &str) -> SingleflightPermit {
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(entry) => SingleflightPermit {
                key: key.to_string(),
                notify: entry.get().clone(),
                is_leader: false,
                inner: self.inner.clone(),
            },
            Entry::Vacant(entry) => {
                let notify = Arc::new(Notify::new());
                entry.insert(notify.clone());
                SingleflightPermit {
                    key: key.to_string(),
                    notify,
                    is_leader: true,
                    inner: self.inner.clone(),
                }
            }
        }
    }
}

pub struct SingleflightPermit {
    key: String,
    notify: Arc<Notify>,
    is_leader: bool,
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl SingleflightPermit {
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Waits for the leader to finish. Returns false on timeout, in which
    /// case the caller proceeds to generate on its own.
    pub async fn wait_for_leader(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

impl Drop for SingleflightPermit {
    fn drop(&mut self) {
        if !self.is_leader {
            return;
        }
        if let Some((_, notify)) = self.inner.remove(&self.key) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn store_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        let path = dir.path().join("nested/a.jpg@s=10x20;q=80.webp");

        assert!(store.load(&path).await.is_none());
        store.store(&path, b"thumbnail bytes").await.unwrap();
        let cached = store.load(&path).await.unwrap();
        assert_eq!(cached.bytes, b"thumbnail bytes");
        // no temporary files left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn store_overwrites_existing_entry() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        let path = dir.path().join("a.png@s=10x20.png");
        store.store(&path, b"old").await.unwrap();
        store.store(&path, b"new").await.unwrap();
        assert_eq!(store.load(&path).await.unwrap().bytes, b"new");
    }

    #[tokio::test]
    async fn singleflight_elects_one_leader() {
        let singleflight = GenerationSingleflight::new();
        let leader = singleflight.acquire("a.jpg@s=10x20;q=80.webp");
        assert!(leader.is_leader());
        let waiter = singleflight.acquire("a.jpg@s=10x20;q=80.webp");
        assert!(!waiter.is_leader());
        let other = singleflight.acquire("b.jpg@s=10x20;q=80.webp");
        assert!(other.is_leader());

        let handle =
            tokio::spawn(async move { waiter.wait_for_leader(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(leader);
        assert!(handle.await.unwrap());
        // key is released once the leader is dropped
        let next = singleflight.acquire("a.jpg@s=10x20;q=80.webp");
        assert!(next.is_leader());
    }

    #[tokio::test]
    async fn singleflight_wait_times_out_without_leader_release() {
        let singleflight = GenerationSingleflight::new();
        let _leader = singleflight.acquire("key");
        let waiter = singleflight.acquire("key");
        assert!(!waiter.wait_for_leader(Duration::from_millis(20)).await);
    }
}
