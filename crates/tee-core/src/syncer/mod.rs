//! One-way replication from a source storage to a cached destination.
//!
//! The [`Syncer`] turns change notifications into debounced tasks, warms the
//! destination cache as soon as a path is queued, and copies each path once
//! its task expires. A single [`CancellationToken`] stops everything in
//! order: ingest first, then the task store, then the drain loop.

mod config;
mod copier;
mod heap;
mod store;
mod task;

pub use config::{ConfigError, SyncerConfig};
pub use copier::{CopyOutcome, SyncStats, SyncStatsSnapshot};
pub use store::{OBSERVATION_BUFFER, StoreClosed, TaskStore};
pub use task::{AggregationWindow, Task};

use crate::cache::CachedStorage;
use crate::event::{ChangeEvent, Watcher};
use crate::fs::{FileKind, FsError, OpenFlags, Storage};
use crate::path::Path;
use crate::walk::{self, ErrorHandler, ShouldDescend, WalkError};
use copier::Copier;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("syncer is shut down")]
    Closed,

    #[error("cannot read source '{path}': {source}")]
    Source { path: Path, source: FsError },

    #[error(transparent)]
    Walk(#[from] WalkError),
}

impl SyncError {
    fn into_walk_error(self, path: &Path) -> WalkError {
        match self {
            Self::Closed => WalkError::Callback {
                path: path.clone(),
                source: FsError::Aborted,
            },
            Self::Source { path, source } => WalkError::Callback { path, source },
            Self::Walk(err) => err,
        }
    }
}

pub struct Syncer<S, D> {
    shared: Arc<Shared<S, D>>,
    cancel: CancellationToken,
    /// Drain loop.
    tracker: TaskTracker,
    /// Ingest loops, stopped before the task store closes.
    ingest: TaskTracker,
}

struct Shared<S, D> {
    src: Arc<S>,
    dst: Arc<CachedStorage<D>>,
    store: TaskStore,
    copier: Copier<S, D>,
    stats: SyncStats,
}

impl<S, D> Syncer<S, D>
where
    S: Storage + 'static,
    D: Storage + 'static,
{
    /// Start the task store and the drain loop. Everything stops once
    /// `cancel` fires; [`wait`](Self::wait) then joins the loops.
    pub fn new(
        src: Arc<S>,
        dst: Arc<CachedStorage<D>>,
        config: SyncerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let window = config.window();
        let (store, expired) = TaskStore::spawn_until(window, cancel.child_token());

        let shared = Arc::new(Shared {
            copier: Copier::new(
                Arc::clone(&src),
                Arc::clone(&dst),
                config.enable_checksums,
                config.mirror_deletions,
            ),
            src,
            dst,
            store,
            stats: SyncStats::default(),
        });

        let tracker = TaskTracker::new();
        tracker.spawn(drain(Arc::clone(&shared), expired, cancel.clone()));
        tracker.close();

        info!(
            aggregation_min = ?window.min,
            aggregation_max = ?window.max,
            checksums = config.enable_checksums,
            mirror_deletions = config.mirror_deletions,
            "syncer started"
        );

        Ok(Self {
            shared,
            cancel,
            tracker,
            ingest: TaskTracker::new(),
        })
    }

    /// Schedule `path` for sync as if it had just changed.
    pub async fn queue(&self, path: &Path) -> Result<(), SyncError> {
        self.shared.queue(path).await
    }

    /// Queue `root` and everything beneath it.
    pub async fn queue_recursive(
        &self,
        root: &Path,
        should_descend: Option<&ShouldDescend>,
        on_error: Option<&ErrorHandler>,
    ) -> Result<(), SyncError> {
        self.shared
            .queue_recursive(root, should_descend, on_error)
            .await
    }

    /// Consume change events until the stream ends or the syncer is
    /// cancelled. New directories are handed to `watcher` before their
    /// contents are queued.
    pub fn ingest<W>(&self, mut events: mpsc::Receiver<ChangeEvent>, watcher: Arc<W>)
    where
        W: Watcher + ?Sized + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        self.ingest.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let path = event.path.clone();
                if let Err(err) = shared.handle_event(&*watcher, event).await {
                    warn!(%path, error = %err, "failed to handle change event");
                }
            }
            debug!("ingest loop stopped");
        });
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn destination(&self) -> &Arc<CachedStorage<D>> {
        &self.shared.dst
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for cancellation, then stop ingest, close the task store and
    /// let the drain loop finish.
    ///
    /// # Panics
    /// Re-raises a panic of the scheduling loop.
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
        self.ingest.close();
        self.ingest.wait().await;
        self.shared.store.close().await;
        self.tracker.wait().await;
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.wait().await;
        info!(stats = ?self.stats(), "syncer stopped");
    }
}

impl<S, D> Shared<S, D>
where
    S: Storage + 'static,
    D: Storage + 'static,
{
    async fn queue(&self, path: &Path) -> Result<(), SyncError> {
        if self.store.is_closed() {
            return Err(SyncError::Closed);
        }
        let now = Instant::now();
        self.warm_up(path).await?;
        self.store
            .add_or_refresh(path, now)
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Start opening the destination of a regular file ahead of its copy.
    async fn warm_up(&self, path: &Path) -> Result<(), SyncError> {
        let source = match self
            .src
            .open(path, OpenFlags::READ | OpenFlags::NO_FOLLOW, 0)
            .await
        {
            Ok(source) => source,
            Err(err) if err.is_not_found() => {
                debug!(%path, "source vanished, skipping warm-up");
                return Ok(());
            }
            Err(source) => {
                return Err(SyncError::Source {
                    path: path.clone(),
                    source,
                });
            }
        };

        let stat = source.stat();
        if stat.kind != FileKind::File {
            debug!(%path, kind = ?stat.kind, "not a regular file, skipping warm-up");
            return Ok(());
        }
        self.dst
            .open_in_background(path, copier::destination_flags(), stat.mode);
        Ok(())
    }

    async fn queue_recursive(
        self: &Arc<Self>,
        root: &Path,
        should_descend: Option<&ShouldDescend>,
        on_error: Option<&ErrorHandler>,
    ) -> Result<(), SyncError> {
        walk::walk(
            self.src.as_ref(),
            root,
            |entry| {
                let shared = Arc::clone(self);
                async move {
                    shared
                        .queue(&entry.path)
                        .await
                        .map_err(|err| err.into_walk_error(&entry.path))
                }
            },
            should_descend,
            on_error,
        )
        .await?;
        Ok(())
    }

    async fn handle_event<W>(self: &Arc<Self>, watcher: &W, event: ChangeEvent) -> Result<(), SyncError>
    where
        W: Watcher + ?Sized,
    {
        debug!(path = %event.path, kind = ?event.kind, "change event");
        let stat = match self.src.stat(&event.path, true).await {
            Ok(stat) => stat,
            // Gone already; the copier decides what a deletion means.
            Err(err) if err.is_not_found() => return self.queue(&event.path).await,
            Err(source) => {
                return Err(SyncError::Source {
                    path: event.path,
                    source,
                });
            }
        };

        if !stat.is_dir() {
            return self.queue(&event.path).await;
        }
        watcher
            .watch(&event.path)
            .await
            .or_else(walk::skip_vanished)?;
        self.queue_recursive(&event.path, None, Some(&walk::skip_vanished))
            .await
    }

    async fn dispatch(&self, task: Task) {
        let path = task.path();
        match self.copier.sync_path(path).await {
            Ok(outcome) => {
                debug!(%path, ?outcome, waited = ?task.last_event().elapsed(), "synced");
                self.stats.record(outcome);
            }
            Err(err) => {
                warn!(%path, error = %err, "sync failed");
                self.stats.record_failure();
            }
        }
    }
}

async fn drain<S, D>(
    shared: Arc<Shared<S, D>>,
    mut expired: mpsc::UnboundedReceiver<Task>,
    cancel: CancellationToken,
) where
    S: Storage + 'static,
    D: Storage + 'static,
{
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = expired.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        shared.dispatch(task).await;
    }
    debug!("drain loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheError};
    use crate::event::ChangeKind;
    use crate::fs::InMemoryFs;
    use std::future::Future;
    use std::sync::Mutex;
    use std::time::Duration;
    use async_trait::async_trait;

    fn p(segments: &[&str]) -> Path {
        Path::new(segments.iter().copied())
    }

    fn fast_config() -> SyncerConfig {
        SyncerConfig {
            aggregation_min: Duration::from_millis(10),
            aggregation_max: Duration::from_millis(50),
            ..Default::default()
        }
    }

    struct Harness {
        src: InMemoryFs,
        dst: InMemoryFs,
        syncer: Syncer<InMemoryFs, InMemoryFs>,
    }

    fn harness(config: SyncerConfig) -> Harness {
        let src = InMemoryFs::new();
        let dst = InMemoryFs::new();
        let cache = CachedStorage::new(Arc::new(dst.clone()), CacheConfig::default());
        let syncer = Syncer::new(
            Arc::new(src.clone()),
            Arc::new(cache),
            config,
            CancellationToken::new(),
        )
        .unwrap();
        Harness { src, dst, syncer }
    }

    /// Poll `condition` until it holds or five seconds pass.
    async fn eventually<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition().await {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[derive(Default)]
    struct RecordingWatcher {
        watched: Mutex<Vec<Path>>,
    }

    #[async_trait]
    impl Watcher for RecordingWatcher {
        async fn watch(&self, path: &Path) -> Result<(), WalkError> {
            self.watched.lock().unwrap().push(path.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rejects_inverted_window() {
        let config = SyncerConfig {
            aggregation_min: Duration::from_secs(2),
            aggregation_max: Duration::from_secs(1),
            ..Default::default()
        };
        let cache = CachedStorage::new(Arc::new(InMemoryFs::new()), CacheConfig::default());
        let result = Syncer::new(
            Arc::new(InMemoryFs::new()),
            Arc::new(cache),
            config,
            CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvertedAggregationWindow { .. })
        ));
    }

    #[tokio::test]
    async fn test_initial_sync_copies_tree() {
        let h = harness(fast_config());
        h.src.write_file(&p(&["docs", "a.md"]), b"alpha");
        h.src.write_file(&p(&["docs", "nested", "b.md"]), b"beta");
        h.src.write_file(&p(&["top.txt"]), b"top");

        h.syncer
            .queue_recursive(&Path::root(), None, Some(&walk::skip_vanished))
            .await
            .unwrap();

        let dst = h.dst.clone();
        eventually(|| {
            let dst = dst.clone();
            async move {
                dst.file_content(&p(&["docs", "nested", "b.md"])).as_deref() == Some(&b"beta"[..])
                    && dst.file_content(&p(&["docs", "a.md"])).as_deref() == Some(&b"alpha"[..])
                    && dst.file_content(&p(&["top.txt"])).as_deref() == Some(&b"top"[..])
            }
        })
        .await;

        h.syncer.shutdown().await;
        assert_eq!(h.syncer.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_queue_warms_destination_cache() {
        let h = harness(SyncerConfig {
            aggregation_min: Duration::from_secs(60),
            aggregation_max: Duration::from_secs(60),
            ..Default::default()
        });
        h.src.write_file(&p(&["f.txt"]), b"x");

        h.syncer.queue(&p(&["f.txt"])).await.unwrap();

        let cache = Arc::clone(h.syncer.destination());
        eventually(|| {
            let cache = Arc::clone(&cache);
            async move { cache.open_cached(&p(&["f.txt"])).is_ok() }
        })
        .await;
        // Opened (and created) long before the copy is due.
        assert_eq!(h.dst.file_content(&p(&["f.txt"])).unwrap(), b"");

        // Directories and vanished paths are not pre-opened.
        h.src.mkdir(&p(&["dir"]), 0o755, false).await.unwrap();
        h.syncer.queue(&p(&["dir"])).await.unwrap();
        h.syncer.queue(&p(&["missing"])).await.unwrap();
        assert!(matches!(
            h.syncer.destination().open_cached(&p(&["dir"])),
            Err(CacheError::NotOpened(_))
        ));
        assert!(matches!(
            h.syncer.destination().open_cached(&p(&["missing"])),
            Err(CacheError::NotOpened(_))
        ));

        h.syncer.shutdown().await;
    }

    #[tokio::test]
    async fn test_rapid_changes_copy_final_content() {
        let h = harness(fast_config());
        for n in 0..20 {
            h.src
                .write_file(&p(&["log.txt"]), format!("line {n}").as_bytes());
            h.syncer.queue(&p(&["log.txt"])).await.unwrap();
        }

        let dst = h.dst.clone();
        eventually(|| {
            let dst = dst.clone();
            async move { dst.file_content(&p(&["log.txt"])).as_deref() == Some(&b"line 19"[..]) }
        })
        .await;
        h.syncer.shutdown().await;
        assert!(h.syncer.stats().copied >= 1);
    }

    #[tokio::test]
    async fn test_mirrored_deletion() {
        let h = harness(SyncerConfig {
            mirror_deletions: true,
            ..fast_config()
        });
        h.dst.write_file(&p(&["old", "f.txt"]), b"stale");

        h.syncer.queue(&p(&["old"])).await.unwrap();

        let dst = h.dst.clone();
        eventually(|| {
            let dst = dst.clone();
            async move { !dst.exists(&p(&["old"])) }
        })
        .await;
        h.syncer.shutdown().await;
        assert_eq!(h.syncer.stats().removed, 1);
    }

    #[tokio::test]
    async fn test_ingest_watches_new_directories() {
        let h = harness(fast_config());
        let watcher = Arc::new(RecordingWatcher::default());
        let (events, rx) = mpsc::channel(16);
        h.syncer.ingest(rx, Arc::clone(&watcher));

        h.src.write_file(&p(&["new", "inner", "f.txt"]), b"fresh");
        h.src.write_file(&p(&["single.txt"]), b"one");
        events
            .send(ChangeEvent::new(p(&["new"]), ChangeKind::CREATE))
            .await
            .unwrap();
        events
            .send(ChangeEvent::new(p(&["single.txt"]), ChangeKind::WRITE))
            .await
            .unwrap();

        let dst = h.dst.clone();
        eventually(|| {
            let dst = dst.clone();
            async move {
                dst.file_content(&p(&["new", "inner", "f.txt"])).as_deref() == Some(&b"fresh"[..])
                    && dst.exists(&p(&["single.txt"]))
            }
        })
        .await;
        assert_eq!(*watcher.watched.lock().unwrap(), vec![p(&["new"])]);

        h.syncer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let h = harness(SyncerConfig {
            aggregation_min: Duration::from_secs(60),
            aggregation_max: Duration::from_secs(60),
            ..Default::default()
        });
        let (_events, rx) = mpsc::channel(16);
        h.syncer.ingest(rx, Arc::new(RecordingWatcher::default()));
        h.src.write_file(&p(&["f.txt"]), b"x");
        h.syncer.queue(&p(&["f.txt"])).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), h.syncer.shutdown())
            .await
            .expect("shutdown hung");

        assert!(matches!(
            h.syncer.queue(&p(&["f.txt"])).await,
            Err(SyncError::Closed)
        ));
        // The pending task was dropped, not copied.
        assert_eq!(h.syncer.stats().copied, 0);
    }

    #[tokio::test]
    async fn test_cancel_alone_rejects_new_paths() {
        let h = harness(fast_config());
        h.src.write_file(&p(&["f.txt"]), b"x");

        h.syncer.cancel_token().cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            h.syncer.queue(&p(&["f.txt"])).await,
            Err(SyncError::Closed)
        ));
        // Nothing was warmed up or copied after cancellation.
        assert_eq!(h.syncer.destination().open_entries(), 0);
        assert!(!h.dst.exists(&p(&["f.txt"])));

        tokio::time::timeout(Duration::from_secs(5), h.syncer.wait())
            .await
            .expect("wait hung after cancel");
    }
}
