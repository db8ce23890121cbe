//! Depth-first traversal of a storage tree.

use crate::fs::{FileEntry, FileKind, FsError, ObjectRef, OpenFlags, Storage};
use crate::path::Path;
use std::future::Future;
use thiserror::Error;

/// Errors met while traversing (or marking) a tree.
///
/// Each carries the offending path so an [`ErrorHandler`] can decide whether
/// to continue or abort.
#[derive(Debug, Clone, Error)]
pub enum WalkError {
    #[error("cannot open '{path}': {source}")]
    Open { path: Path, source: FsError },

    #[error("'{path}' is not a directory")]
    NotDirectory { path: Path },

    #[error("unable to get children of '{path}': {source}")]
    ReadDir { path: Path, source: FsError },

    #[error("got error from callback on '{path}': {source}")]
    Callback { path: Path, source: FsError },

    #[error("unable to mark '{path}' to be watched: {source}")]
    WatchMark { path: Path, source: FsError },
}

impl WalkError {
    pub fn path(&self) -> &Path {
        match self {
            Self::Open { path, .. }
            | Self::NotDirectory { path }
            | Self::ReadDir { path, .. }
            | Self::Callback { path, .. }
            | Self::WatchMark { path, .. } => path,
        }
    }

    /// True when the underlying cause is a path that no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Open { source, .. }
            | Self::ReadDir { source, .. }
            | Self::Callback { source, .. }
            | Self::WatchMark { source, .. } => source.is_not_found(),
            Self::NotDirectory { .. } => false,
        }
    }
}

/// Decides per error: `Ok(())` suppresses it and the walk continues,
/// `Err` aborts the walk with that error.
pub type ErrorHandler = dyn Fn(WalkError) -> Result<(), WalkError> + Send + Sync;

/// Decides whether to descend into a directory entry.
pub type ShouldDescend = dyn Fn(&WalkEntry) -> bool + Send + Sync;

/// Error handler for trees that change while being walked: entries that
/// vanished or turned into non-directories are skipped, everything else
/// aborts.
pub fn skip_vanished(err: WalkError) -> Result<(), WalkError> {
    match &err {
        WalkError::NotDirectory { .. } => Ok(()),
        WalkError::Open { .. } | WalkError::WatchMark { .. } if err.is_not_found() => Ok(()),
        _ => Err(err),
    }
}

/// An entry reported by [`walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Full path of the entry (relative to the storage root)
    pub path: Path,
    /// Entry name, `"."` for the walk root
    pub name: String,
    pub kind: FileKind,
}

/// Walk `root` depth-first, calling `callback` for every entry (the root
/// first, named `"."`) before descending into it.
///
/// Symlinks are never followed. Traversal failures go through `on_error`;
/// without a handler they abort the walk. Errors returned by `callback`
/// always abort.
pub async fn walk<S, F, Fut>(
    storage: &S,
    root: &Path,
    mut callback: F,
    should_descend: Option<&ShouldDescend>,
    on_error: Option<&ErrorHandler>,
) -> Result<(), WalkError>
where
    S: Storage + ?Sized,
    F: FnMut(WalkEntry) -> Fut,
    Fut: Future<Output = Result<(), WalkError>>,
{
    let handle = |err: WalkError| match on_error {
        Some(handler) => handler(err),
        None => Err(err),
    };

    let root_dir = match open_dir(storage, root).await {
        Ok(dir) => dir,
        Err(err) => return handle(err),
    };

    callback(WalkEntry {
        path: root.clone(),
        name: ".".to_string(),
        kind: FileKind::Directory,
    })
    .await?;

    let mut stack: Vec<(Path, std::vec::IntoIter<FileEntry>)> = Vec::new();
    match list(&root_dir).await {
        Ok(children) => stack.push((root.clone(), children.into_iter())),
        Err(err) => return handle(err),
    }

    while let Some((dir, children)) = stack.last_mut() {
        let Some(child) = children.next() else {
            stack.pop();
            continue;
        };

        let entry = WalkEntry {
            path: dir.join(child.name.clone()),
            name: child.name,
            kind: child.kind,
        };
        let descend = entry.kind == FileKind::Directory
            && should_descend.is_none_or(|should| should(&entry));
        let path = entry.path.clone();

        callback(entry).await?;

        if !descend {
            continue;
        }

        let children = match open_dir(storage, &path).await {
            Ok(dir) => list(&dir).await,
            Err(err) => Err(err),
        };
        match children {
            Ok(children) => stack.push((path, children.into_iter())),
            Err(err) => handle(err)?,
        }
    }

    Ok(())
}

async fn open_dir<S: Storage + ?Sized>(storage: &S, path: &Path) -> Result<ObjectRef, WalkError> {
    let obj = storage
        .open(path, OpenFlags::WALK_DEFAULTS, 0)
        .await
        .map_err(|source| WalkError::Open {
            path: path.clone(),
            source,
        })?;
    if !obj.stat().is_dir() {
        return Err(WalkError::NotDirectory { path: path.clone() });
    }
    Ok(obj)
}

async fn list(dir: &ObjectRef) -> Result<Vec<FileEntry>, WalkError> {
    let mut children = dir.read_dir().await.map_err(|source| WalkError::ReadDir {
        path: dir.path().clone(),
        source,
    })?;
    // Stable order regardless of backend.
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}
