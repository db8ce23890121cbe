//! Single-flight opener for the destination storage.
//!
//! [`CachedStorage`] wraps a backend and remembers the outcome of the first
//! open issued for every path. Concurrent openers of the same path all wait
//! on that one attempt and receive its result, so the backend sees at most
//! one `open` per path until the entry is invalidated or evicted.
//!
//! Locking is two-level: one mutex guards the entry map for
//! insert-if-absent, and each entry carries its own `RwLock`, held
//! exclusively by the background opener and shared by every waiter once
//! the result is recorded.
//!
//! The backend must not be mutated behind the cache's back while it is in
//! use; the cache can not notice such changes.

use crate::fs::{FileStat, FsError, ObjectRef, OpenFlags, Result, Storage};
use crate::path::{Path, PathKey};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("'{0}' has not been opened")]
    NotOpened(Path),

    #[error("open of '{0}' is still in progress")]
    InProgress(Path),

    #[error(transparent)]
    Open(#[from] FsError),
}

/// Capacity knobs. `keep_open == 0` keeps every entry; the other two
/// caches are disabled at `0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// Completed open entries kept, least recently used evicted first.
    pub keep_open: usize,
    /// Content digests kept for checksum comparisons.
    pub cache_data: usize,
    /// `stat` results kept.
    pub cache_metadata: usize,
}

/// Recorded outcome of an open. `None` only if the opener died before
/// finishing.
type Slot = Arc<RwLock<Option<Result<ObjectRef>>>>;

pub struct CachedStorage<B> {
    backend: Arc<B>,
    config: CacheConfig,
    entries: Mutex<Lru<Slot>>,
    metadata: Mutex<Lru<FileStat>>,
    digests: Mutex<Lru<blake3::Hash>>,
}

impl<B: Storage + 'static> CachedStorage<B> {
    pub fn new(backend: Arc<B>, config: CacheConfig) -> Self {
        Self {
            backend,
            entries: Mutex::new(Lru::new(config.keep_open)),
            metadata: Mutex::new(Lru::new(config.cache_metadata)),
            digests: Mutex::new(Lru::new(config.cache_data)),
            config,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Start opening `path` unless an attempt (finished or not) already
    /// exists. Returns immediately.
    ///
    /// Must be called within a tokio runtime.
    pub fn open_in_background(&self, path: &Path, flags: OpenFlags, default_mode: u32) {
        self.begin_open(path, flags, default_mode);
    }

    /// The recorded result for `path`, without waiting.
    pub fn open_cached(&self, path: &Path) -> std::result::Result<ObjectRef, CacheError> {
        let slot = lock(&self.entries)
            .peek(&path.key())
            .cloned()
            .ok_or_else(|| CacheError::NotOpened(path.clone()))?;
        let outcome = slot
            .try_read()
            .map_err(|_| CacheError::InProgress(path.clone()))?;
        match &*outcome {
            Some(Ok(object)) => Ok(Arc::clone(object)),
            Some(Err(err)) => Err(CacheError::Open(err.clone())),
            None => Err(CacheError::Open(FsError::Aborted)),
        }
    }

    /// Forget everything cached for `path` and beneath it.
    pub fn invalidate(&self, path: &Path) {
        let dropped = lock(&self.entries).remove_under(path);
        lock(&self.metadata).remove_under(path);
        lock(&self.digests).remove_under(path);
        if dropped > 0 {
            trace!(%path, dropped, "invalidated cached opens");
        }
    }

    pub fn cached_digest(&self, path: &Path) -> Option<blake3::Hash> {
        lock(&self.digests).get(&path.key()).copied()
    }

    pub fn record_digest(&self, path: &Path, digest: blake3::Hash) {
        if self.config.cache_data > 0 {
            lock(&self.digests).put(path, digest);
        }
    }

    /// Number of open entries currently held.
    pub fn open_entries(&self) -> usize {
        lock(&self.entries).len()
    }

    fn begin_open(&self, path: &Path, flags: OpenFlags, default_mode: u32) -> Slot {
        let key = path.key();
        let mut entries = lock(&self.entries);
        if let Some(slot) = entries.get(&key) {
            return Arc::clone(slot);
        }

        let slot: Slot = Arc::new(RwLock::new(None));
        let mut guard = Arc::clone(&slot)
            .try_write_owned()
            .expect("fresh entry lock is uncontended");
        entries.insert(path, Arc::clone(&slot));
        // In-flight entries are write-locked and therefore never evicted.
        entries.shrink(|slot| slot.try_read().is_ok());
        drop(entries);

        let backend = Arc::clone(&self.backend);
        let path = path.clone();
        tokio::spawn(async move {
            let outcome = backend.open(&path, flags, default_mode).await;
            match &outcome {
                Ok(_) => trace!(%path, "destination opened"),
                Err(err) => debug!(%path, error = %err, "destination open failed"),
            }
            *guard = Some(outcome);
        });
        slot
    }

    fn forget_metadata(&self, path: &Path) {
        let mut metadata = lock(&self.metadata);
        metadata.remove(&path.key());
        if let Some(parent) = path.parent() {
            metadata.remove(&parent.key());
        }
    }

    fn forget_subtree(&self, path: &Path) {
        self.invalidate(path);
        if let Some(parent) = path.parent() {
            lock(&self.metadata).remove(&parent.key());
        }
    }
}

#[async_trait]
impl<B: Storage + 'static> Storage for CachedStorage<B> {
    /// Single-flight open: joins any existing attempt for `path`.
    async fn open(&self, path: &Path, flags: OpenFlags, default_mode: u32) -> Result<ObjectRef> {
        let slot = self.begin_open(path, flags, default_mode);
        let outcome = slot.read().await;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(FsError::Aborted),
        }
    }

    async fn stat(&self, path: &Path, no_follow: bool) -> Result<FileStat> {
        let cacheable = no_follow && self.config.cache_metadata > 0;
        if cacheable {
            let cached = lock(&self.metadata).get(&path.key()).cloned();
            if let Some(stat) = cached {
                return Ok(stat);
            }
        }
        let stat = self.backend.stat(path, no_follow).await?;
        if cacheable {
            lock(&self.metadata).put(path, stat.clone());
        }
        Ok(stat)
    }

    async fn mkdir(&self, path: &Path, mode: u32, recursive: bool) -> Result<()> {
        let result = self.backend.mkdir(path, mode, recursive).await;
        self.forget_metadata(path);
        result
    }

    async fn symlink(&self, path: &Path, target: &Path) -> Result<()> {
        let result = self.backend.symlink(path, target).await;
        self.forget_subtree(path);
        result
    }

    async fn readlink(&self, path: &Path) -> Result<Path> {
        self.backend.readlink(path).await
    }

    async fn remove(&self, path: &Path, recursive: bool) -> Result<()> {
        let result = self.backend.remove(path, recursive).await;
        self.forget_subtree(path);
        result
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let result = self.backend.rename(from, to).await;
        self.forget_subtree(from);
        self.forget_subtree(to);
        result
    }

    async fn link(&self, existing: &Path, new: &Path) -> Result<()> {
        let result = self.backend.link(existing, new).await;
        self.forget_metadata(existing);
        self.forget_subtree(new);
        result
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let result = self.backend.chmod(path, mode).await;
        self.forget_metadata(path);
        result
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32, no_follow: bool) -> Result<()> {
        let result = self.backend.chown(path, uid, gid, no_follow).await;
        self.forget_metadata(path);
        result
    }

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let result = self.backend.chtimes(path, atime, mtime).await;
        self.forget_metadata(path);
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Count-bounded map with least-recently-used eviction.
///
/// A capacity of `0` means unbounded.
struct Lru<V> {
    capacity: usize,
    clock: u64,
    items: HashMap<PathKey, LruItem<V>>,
    recency: BTreeMap<u64, PathKey>,
}

struct LruItem<V> {
    value: V,
    path: Path,
    stamp: u64,
}

impl<V> Lru<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: 0,
            items: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    /// Look up without refreshing recency.
    fn peek(&self, key: &PathKey) -> Option<&V> {
        self.items.get(key).map(|item| &item.value)
    }

    fn get(&mut self, key: &PathKey) -> Option<&V> {
        let stamp = self.tick();
        let item = self.items.get_mut(key)?;
        self.recency.remove(&item.stamp);
        item.stamp = stamp;
        self.recency.insert(stamp, key.clone());
        Some(&item.value)
    }

    fn insert(&mut self, path: &Path, value: V) {
        let key = path.key();
        let stamp = self.tick();
        let item = LruItem {
            value,
            path: path.clone(),
            stamp,
        };
        if let Some(old) = self.items.insert(key.clone(), item) {
            self.recency.remove(&old.stamp);
        }
        self.recency.insert(stamp, key);
    }

    /// Insert, then evict down to capacity.
    fn put(&mut self, path: &Path, value: V) {
        self.insert(path, value);
        self.shrink(|_| true);
    }

    fn remove(&mut self, key: &PathKey) -> Option<V> {
        let item = self.items.remove(key)?;
        self.recency.remove(&item.stamp);
        Some(item.value)
    }

    /// Drop `prefix` and every entry beneath it. Returns how many went.
    fn remove_under(&mut self, prefix: &Path) -> usize {
        let doomed: Vec<PathKey> = self
            .items
            .iter()
            .filter(|(_, item)| item.path.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    /// Evict the least recently used evictable entries until within
    /// capacity.
    fn shrink(&mut self, evictable: impl Fn(&V) -> bool) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() > self.capacity {
            let victim = self
                .recency
                .values()
                .find(|key| self.items.get(*key).is_some_and(|item| evictable(&item.value)))
                .cloned();
            let Some(victim) = victim else {
                break;
            };
            self.remove(&victim);
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
