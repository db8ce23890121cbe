//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use filetime::FileTime;
use std::fs::{Metadata, Permissions};
use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tee_core::fs::{FileEntry, FileKind, FileStat, FsError, Object, ObjectRef, OpenFlags, Result, Storage};
use tee_core::path::Path;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Storage rooted at a local directory.
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &std::path::Path {
        &self.base_path
    }

    fn full_path(&self, path: &Path) -> PathBuf {
        if path.is_root() {
            self.base_path.clone()
        } else {
            self.base_path.join(path.to_local())
        }
    }

    async fn metadata(&self, path: &Path, no_follow: bool) -> Result<Metadata> {
        let full_path = self.full_path(path);
        let metadata = if no_follow {
            fs::symlink_metadata(&full_path).await
        } else {
            fs::metadata(&full_path).await
        };
        metadata.map_err(|e| FsError::from_io(path, e))
    }
}

fn kind_of(file_type: std::fs::FileType) -> FileKind {
    if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    }
}

fn to_stat(metadata: &Metadata) -> FileStat {
    let kind = kind_of(metadata.file_type());
    FileStat {
        kind,
        size: if kind == FileKind::Directory { 0 } else { metadata.len() },
        mode: metadata.mode() & 0o7777,
        mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
    }
}

/// An opened local object. Regular files keep their descriptor; other kinds
/// are addressed by path.
#[derive(Debug)]
struct NativeObject {
    path: Path,
    full_path: PathBuf,
    stat: FileStat,
    file: Option<Mutex<fs::File>>,
}

#[async_trait]
impl Object for NativeObject {
    fn path(&self) -> &Path {
        &self.path
    }

    fn stat(&self) -> &FileStat {
        &self.stat
    }

    async fn read_dir(&self) -> Result<Vec<FileEntry>> {
        let io_err = |e| FsError::from_io(&self.path, e);
        let mut dir = fs::read_dir(&self.full_path).await.map_err(io_err)?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let file_type = entry.file_type().await.map_err(io_err)?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: kind_of(file_type),
            });
        }
        Ok(entries)
    }

    async fn read_to_end(&self) -> Result<Vec<u8>> {
        let io_err = |e| FsError::from_io(&self.path, e);
        match &self.file {
            Some(file) => {
                let mut file = file.lock().await;
                file.seek(SeekFrom::Start(0)).await.map_err(io_err)?;
                let mut content = Vec::new();
                file.read_to_end(&mut content).await.map_err(io_err)?;
                Ok(content)
            }
            None if self.stat.is_dir() => Err(FsError::IsDirectory(self.path.clone())),
            None => fs::read(&self.full_path).await.map_err(io_err),
        }
    }

    async fn overwrite(&self, content: &[u8]) -> Result<()> {
        let io_err = |e| FsError::from_io(&self.path, e);
        let Some(file) = &self.file else {
            return Err(FsError::NotImplemented);
        };
        let mut file = file.lock().await;
        file.set_len(0).await.map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).await.map_err(io_err)?;
        file.write_all(content).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)
    }
}

#[async_trait]
impl Storage for NativeFs {
    async fn open(&self, path: &Path, flags: OpenFlags, default_mode: u32) -> Result<ObjectRef> {
        let full_path = self.full_path(path);
        let existing = match self.metadata(path, flags.contains(OpenFlags::NO_FOLLOW)).await {
            Ok(metadata) => Some(metadata),
            Err(err) if err.is_not_found() && flags.contains(OpenFlags::CREATE) => None,
            Err(err) => return Err(err),
        };

        if let Some(metadata) = &existing {
            let stat = to_stat(metadata);
            if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                return Err(FsError::AlreadyExists(path.clone()));
            }
            if stat.is_dir() && flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND) {
                return Err(FsError::IsDirectory(path.clone()));
            }
            if stat.kind != FileKind::File || flags.contains(OpenFlags::PATH) {
                return Ok(std::sync::Arc::new(NativeObject {
                    path: path.clone(),
                    full_path,
                    stat,
                    file: None,
                }));
            }
        }

        let writable = flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND);
        let file = fs::OpenOptions::new()
            .read(flags.contains(OpenFlags::READ) || !writable)
            .write(flags.contains(OpenFlags::WRITE))
            .append(flags.contains(OpenFlags::APPEND))
            .create(flags.contains(OpenFlags::CREATE) && writable)
            .create_new(flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) && writable)
            .truncate(flags.contains(OpenFlags::TRUNC) && writable)
            .mode(default_mode & 0o7777)
            .open(&full_path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        let metadata = file.metadata().await.map_err(|e| FsError::from_io(path, e))?;

        Ok(std::sync::Arc::new(NativeObject {
            path: path.clone(),
            full_path,
            stat: to_stat(&metadata),
            file: Some(Mutex::new(file)),
        }))
    }

    async fn stat(&self, path: &Path, no_follow: bool) -> Result<FileStat> {
        Ok(to_stat(&self.metadata(path, no_follow).await?))
    }

    async fn mkdir(&self, path: &Path, mode: u32, recursive: bool) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(recursive)
            .mode(mode & 0o7777)
            .create(self.full_path(path))
            .await
            .map_err(|e| FsError::from_io(path, e))
    }

    async fn symlink(&self, path: &Path, target: &Path) -> Result<()> {
        fs::symlink(target.to_local(), self.full_path(path))
            .await
            .map_err(|e| FsError::from_io(path, e))
    }

    async fn readlink(&self, path: &Path) -> Result<Path> {
        let target = fs::read_link(self.full_path(path))
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        Ok(Path::from_local(&target))
    }

    async fn remove(&self, path: &Path, recursive: bool) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = self.metadata(path, true).await?;
        let result = if !metadata.is_dir() {
            fs::remove_file(&full_path).await
        } else if recursive {
            fs::remove_dir_all(&full_path).await
        } else {
            fs::remove_dir(&full_path).await
        };
        result.map_err(|e| FsError::from_io(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(self.full_path(from), self.full_path(to))
            .await
            .map_err(|e| FsError::from_io(from, e))
    }

    async fn link(&self, existing: &Path, new: &Path) -> Result<()> {
        fs::hard_link(self.full_path(existing), self.full_path(new))
            .await
            .map_err(|e| FsError::from_io(new, e))
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(self.full_path(path), Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(|e| FsError::from_io(path, e))
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32, no_follow: bool) -> Result<()> {
        let full_path = self.full_path(path);
        blocking(path, move || {
            if no_follow {
                std::os::unix::fs::lchown(&full_path, Some(uid), Some(gid))
            } else {
                std::os::unix::fs::chown(&full_path, Some(uid), Some(gid))
            }
        })
        .await
    }

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let full_path = self.full_path(path);
        blocking(path, move || {
            filetime::set_file_times(
                &full_path,
                FileTime::from_system_time(atime),
                FileTime::from_system_time(mtime),
            )
        })
        .await
    }
}

/// Run a blocking syscall off the async workers.
async fn blocking<F>(path: &Path, op: F) -> Result<()>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => result.map_err(|e| FsError::from_io(path, e)),
        Err(_) => Err(FsError::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p(segments: &[&str]) -> Path {
        Path::new(segments.iter().copied())
    }

    fn rw_create() -> OpenFlags {
        OpenFlags::READ_WRITE | OpenFlags::CREATE
    }

    #[tokio::test]
    async fn test_native_fs_basic_operations() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let fs = NativeFs::new(temp_dir.path().to_path_buf());

        fs.mkdir(&p(&["a", "b"]), 0o755, true).await.unwrap();
        let file = fs.open(&p(&["a", "b", "f.txt"]), rw_create(), 0o640).await.unwrap();
        file.overwrite(b"a longer first version").await.unwrap();
        file.overwrite(b"short").await.unwrap();
        assert_eq!(file.read_to_end().await.unwrap(), b"short");
        assert_eq!(
            std::fs::read(temp_dir.path().join("a/b/f.txt")).unwrap(),
            b"short"
        );

        let stat = fs.stat(&p(&["a", "b", "f.txt"]), true).await.unwrap();
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.size, 5);

        let dir = fs.open(&p(&["a"]), OpenFlags::WALK_DEFAULTS, 0).await.unwrap();
        let entries = dir.read_dir().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir());

        fs.remove(&p(&["a"]), true).await.unwrap();
        assert!(fs.stat(&p(&["a"]), true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_native_fs_open_errors() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let fs = NativeFs::new(temp_dir.path().to_path_buf());

        let err = fs.open(&p(&["missing", "f.txt"]), rw_create(), 0o644).await.unwrap_err();
        assert!(err.is_not_found());

        fs.mkdir(&p(&["dir"]), 0o755, false).await.unwrap();
        let err = fs.open(&p(&["dir"]), rw_create(), 0o644).await.unwrap_err();
        assert!(matches!(err, FsError::IsDirectory(_)));
    }

    #[tokio::test]
    async fn test_native_fs_symlinks_and_metadata() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let fs = NativeFs::new(temp_dir.path().to_path_buf());

        let file = fs.open(&p(&["target.txt"]), rw_create(), 0o644).await.unwrap();
        file.overwrite(b"data").await.unwrap();
        fs.symlink(&p(&["link"]), &p(&["target.txt"])).await.unwrap();

        assert_eq!(fs.readlink(&p(&["link"])).await.unwrap(), p(&["target.txt"]));
        assert_eq!(fs.stat(&p(&["link"]), true).await.unwrap().kind, FileKind::Symlink);
        assert_eq!(fs.stat(&p(&["link"]), false).await.unwrap().kind, FileKind::File);

        let link = fs
            .open(&p(&["link"]), OpenFlags::READ | OpenFlags::NO_FOLLOW, 0)
            .await
            .unwrap();
        assert_eq!(link.stat().kind, FileKind::Symlink);

        fs.chmod(&p(&["target.txt"]), 0o600).await.unwrap();
        let mtime = UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        fs.chtimes(&p(&["target.txt"]), mtime, mtime).await.unwrap();
        let stat = fs.stat(&p(&["target.txt"]), true).await.unwrap();
        assert_eq!(stat.mode, 0o600);
        assert_eq!(stat.mtime, mtime);
    }
}
