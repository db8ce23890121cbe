//! File watcher marking source directories one by one.
//!
//! Uses notify with non-recursive watches so that new directories can be
//! marked (and their existing contents queued) as they appear.

use crate::native_fs::NativeFs;
use anyhow::Result;
use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tee_core::event::{ChangeEvent, ChangeKind, Watcher};
use tee_core::fs::{FileKind, FsError};
use tee_core::path::Path;
use tee_core::walk::{self, ErrorHandler, ShouldDescend, WalkEntry, WalkError};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Capacity of the event channel. The notify thread waits when it is full.
pub const EVENT_BUFFER: usize = 65536;

/// Kinds that say something about a path's content or existence.
const RELEVANT: ChangeKind = ChangeKind::empty()
    .union(ChangeKind::CREATE)
    .union(ChangeKind::UPDATE)
    .union(ChangeKind::DELETE)
    .union(ChangeKind::WRITE)
    .union(ChangeKind::CLOSE_WRITE)
    .union(ChangeKind::ATTRIB)
    .union(ChangeKind::MOVE);

type Marked = Arc<Mutex<HashSet<Path>>>;

/// Watches a [`NativeFs`] tree and reports changes relative to its root.
pub struct FileWatcher {
    source: Arc<NativeFs>,
    root: PathBuf,
    watcher: Mutex<RecommendedWatcher>,
    marked: Marked,
    should_watch: Option<Box<ShouldDescend>>,
    on_error: Box<ErrorHandler>,
}

impl FileWatcher {
    /// Create a watcher for `source`. Nothing is marked until
    /// [`watch`](Watcher::watch) is called.
    pub fn new(source: Arc<NativeFs>) -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        // Canonicalize so event paths (always real paths) strip cleanly.
        let root = source
            .base_path()
            .canonicalize()
            .unwrap_or_else(|_| source.base_path().to_path_buf());

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let marked: Marked = Arc::default();

        let callback_root = root.clone();
        let callback_marked = Arc::clone(&marked);
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for change in translate(&event, &callback_root) {
                        if change.kind.intersects(ChangeKind::DELETE | ChangeKind::MOVE) {
                            forget(&callback_marked, &change.path);
                        }
                        trace!(path = %change.path, kind = ?change.kind, "raw change");
                        // Blocks rather than drops when the consumer lags.
                        if event_tx.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            }
        })?;

        let file_watcher = Self {
            source,
            root,
            watcher: Mutex::new(watcher),
            marked,
            should_watch: None,
            on_error: Box::new(default_error_handler),
        };
        Ok((file_watcher, event_rx))
    }

    /// Only mark directories accepted by `predicate`.
    pub fn with_should_watch(mut self, predicate: Box<ShouldDescend>) -> Self {
        self.should_watch = Some(predicate);
        self
    }

    /// Replace the default error handler.
    pub fn with_error_handler(mut self, handler: Box<ErrorHandler>) -> Self {
        self.on_error = handler;
        self
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn is_marked(&self, path: &Path) -> bool {
        self.marked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }

    fn mark(&self, path: &Path) -> Result<(), WalkError> {
        if self.is_marked(path) {
            return Ok(());
        }
        // The notify callback takes `marked` too; never hold it across
        // `watch`, which waits on the notify thread.
        let local = if path.is_root() {
            self.root.clone()
        } else {
            self.root.join(path.to_local())
        };
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watch(&local, RecursiveMode::NonRecursive)
            .map_err(|err| WalkError::WatchMark {
                path: path.clone(),
                source: notify_to_fs_error(path, err),
            })?;
        self.marked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.clone());
        debug!(%path, "watching directory");
        Ok(())
    }

    fn accepts(&self, entry: &WalkEntry) -> bool {
        entry.kind == FileKind::Directory
            && self.should_watch.as_ref().is_none_or(|should| should(entry))
    }
}

#[async_trait]
impl Watcher for FileWatcher {
    async fn watch(&self, path: &Path) -> Result<(), WalkError> {
        let this = self;
        walk::walk(
            this.source.as_ref(),
            path,
            move |entry| async move {
                if !this.accepts(&entry) {
                    return Ok(());
                }
                match this.mark(&entry.path) {
                    Ok(()) => Ok(()),
                    Err(err) => (this.on_error)(err),
                }
            },
            this.should_watch.as_deref(),
            Some(this.on_error.as_ref()),
        )
        .await
    }
}

/// Skip entries that vanished while being marked, propagate the rest.
pub fn default_error_handler(err: WalkError) -> Result<(), WalkError> {
    match walk::skip_vanished(err) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(error = %err, "watch error");
            Err(err)
        }
    }
}

fn forget(marked: &Marked, path: &Path) {
    marked
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .retain(|dir| !dir.starts_with(path));
}

fn notify_to_fs_error(path: &Path, err: notify::Error) -> FsError {
    match err.kind {
        notify::ErrorKind::PathNotFound => FsError::NotFound(path.clone()),
        notify::ErrorKind::Io(io) => FsError::from_io(path, io),
        _ => FsError::Io {
            path: path.clone(),
            message: err.to_string(),
        },
    }
}

fn change_kind(kind: &EventKind) -> ChangeKind {
    match kind {
        EventKind::Create(_) => ChangeKind::CREATE,
        EventKind::Remove(_) => ChangeKind::DELETE,
        EventKind::Modify(ModifyKind::Data(_)) => ChangeKind::UPDATE | ChangeKind::WRITE,
        EventKind::Modify(ModifyKind::Metadata(_)) => ChangeKind::UPDATE | ChangeKind::ATTRIB,
        EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::MOVE,
        EventKind::Modify(_) => ChangeKind::UPDATE,
        EventKind::Access(AccessKind::Open(_)) => ChangeKind::OPEN,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => ChangeKind::CLOSE_WRITE,
        EventKind::Access(_) => ChangeKind::empty(),
        EventKind::Any | EventKind::Other => ChangeKind::UPDATE,
    }
}

/// Turn a notify event into change events relative to `root`. Pure access
/// notifications (our own reads) are dropped.
fn translate(event: &Event, root: &std::path::Path) -> Vec<ChangeEvent> {
    let kind = change_kind(&event.kind);
    if !kind.intersects(RELEVANT) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter_map(|path| path.strip_prefix(root).ok())
        .map(|relative| ChangeEvent::new(Path::from_local(relative), kind))
        .collect()
}
