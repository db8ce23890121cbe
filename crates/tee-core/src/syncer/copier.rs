//! Brings one destination path in line with the source.

use crate::cache::CachedStorage;
use crate::fs::{FileKind, FileStat, ObjectRef, OpenFlags, Result, Storage};
use crate::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Mode for parent directories created ahead of their own sync.
const PARENT_DIR_MODE: u32 = 0o755;

/// Flags every destination file is opened with, warm-up included.
pub(crate) fn destination_flags() -> OpenFlags {
    OpenFlags::READ_WRITE | OpenFlags::CREATE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Destination was written or created.
    Copied,
    /// Nothing to do (identical content, vanished source, unsupported kind).
    Skipped,
    /// Destination was removed to mirror a deletion.
    Removed,
}

/// Running totals of sync outcomes.
#[derive(Debug, Default)]
pub struct SyncStats {
    copied: AtomicU64,
    skipped: AtomicU64,
    removed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub copied: u64,
    pub skipped: u64,
    pub removed: u64,
    pub failed: u64,
}

impl SyncStats {
    pub fn record(&self, outcome: CopyOutcome) {
        let counter = match outcome {
            CopyOutcome::Copied => &self.copied,
            CopyOutcome::Skipped => &self.skipped,
            CopyOutcome::Removed => &self.removed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            copied: self.copied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Copier<S, D> {
    src: Arc<S>,
    dst: Arc<CachedStorage<D>>,
    checksums: bool,
    mirror_deletions: bool,
}

impl<S: Storage, D: Storage + 'static> Copier<S, D> {
    pub fn new(
        src: Arc<S>,
        dst: Arc<CachedStorage<D>>,
        checksums: bool,
        mirror_deletions: bool,
    ) -> Self {
        Self {
            src,
            dst,
            checksums,
            mirror_deletions,
        }
    }

    pub async fn sync_path(&self, path: &Path) -> Result<CopyOutcome> {
        let stat = match self.src.stat(path, true).await {
            Ok(stat) => stat,
            Err(err) if err.is_not_found() => return self.sync_deletion(path).await,
            Err(err) => return Err(err),
        };

        match stat.kind {
            FileKind::Directory => self.sync_directory(path, &stat).await,
            FileKind::Symlink => self.sync_symlink(path).await,
            FileKind::File => self.sync_file(path, &stat).await,
            FileKind::Other => {
                debug!(%path, "unsupported file type, skipping");
                Ok(CopyOutcome::Skipped)
            }
        }
    }

    async fn sync_deletion(&self, path: &Path) -> Result<CopyOutcome> {
        if !self.mirror_deletions || path.is_root() {
            debug!(%path, "source vanished, leaving destination as is");
            return Ok(CopyOutcome::Skipped);
        }
        match self.dst.remove(path, true).await {
            Ok(()) => Ok(CopyOutcome::Removed),
            Err(err) if err.is_not_found() => Ok(CopyOutcome::Skipped),
            Err(err) => Err(err),
        }
    }

    async fn sync_directory(&self, path: &Path, stat: &FileStat) -> Result<CopyOutcome> {
        self.clear_conflicting(path, FileKind::Directory).await?;
        self.dst.mkdir(path, stat.mode, true).await?;
        self.dst.chmod(path, stat.mode).await?;
        Ok(CopyOutcome::Copied)
    }

    async fn sync_symlink(&self, path: &Path) -> Result<CopyOutcome> {
        let target = self.src.readlink(path).await?;
        match self.dst.stat(path, true).await {
            Ok(existing) if existing.kind == FileKind::Symlink => {
                if self.dst.readlink(path).await? == target {
                    return Ok(CopyOutcome::Skipped);
                }
                self.dst.remove(path, false).await?;
            }
            Ok(_) => self.dst.remove(path, true).await?,
            Err(err) if err.is_not_found() => self.create_parent(path).await?,
            Err(err) => return Err(err),
        }
        self.dst.symlink(path, &target).await?;
        Ok(CopyOutcome::Copied)
    }

    async fn sync_file(&self, path: &Path, stat: &FileStat) -> Result<CopyOutcome> {
        let source = match self.src.open(path, OpenFlags::READ | OpenFlags::NO_FOLLOW, 0).await {
            Ok(source) => source,
            Err(err) if err.is_not_found() => return self.sync_deletion(path).await,
            Err(err) => return Err(err),
        };
        let content = source.read_to_end().await?;

        self.clear_conflicting(path, FileKind::File).await?;
        let dest = self.open_destination(path, stat.mode).await?;

        let outcome = if self.checksums {
            let digest = blake3::hash(&content);
            let current = match self.dst.cached_digest(path) {
                Some(current) => current,
                None => blake3::hash(&dest.read_to_end().await?),
            };
            let outcome = if current == digest {
                debug!(%path, "content unchanged, syncing attributes only");
                CopyOutcome::Skipped
            } else {
                dest.overwrite(&content).await?;
                CopyOutcome::Copied
            };
            self.dst.record_digest(path, digest);
            outcome
        } else {
            dest.overwrite(&content).await?;
            CopyOutcome::Copied
        };

        // Mode and times follow the source even when content matched.
        self.dst.chmod(path, stat.mode).await?;
        self.dst.chtimes(path, stat.mtime, stat.mtime).await?;
        Ok(outcome)
    }

    /// Open through the cache, creating missing parents once.
    async fn open_destination(&self, path: &Path, mode: u32) -> Result<ObjectRef> {
        match self.dst.open(path, destination_flags(), mode).await {
            Err(err) if err.is_not_found() => {
                self.create_parent(path).await?;
                self.dst.invalidate(path);
                self.dst.open(path, destination_flags(), mode).await
            }
            other => other,
        }
    }

    async fn create_parent(&self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) if !parent.is_root() => {
                self.dst.mkdir(&parent, PARENT_DIR_MODE, true).await
            }
            _ => Ok(()),
        }
    }

    /// Remove whatever sits at `path` in the destination if it is not of
    /// `kind`.
    async fn clear_conflicting(&self, path: &Path, kind: FileKind) -> Result<()> {
        match self.dst.stat(path, true).await {
            Ok(existing) if existing.kind != kind && !path.is_root() => {
                debug!(%path, from = ?existing.kind, to = ?kind, "replacing destination entry");
                self.dst.remove(path, true).await
            }
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}
