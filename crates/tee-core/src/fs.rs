//! Storage trait abstraction over a tree of files.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `CachedStorage` (in `cache`) - Single-flight destination opener wrapping another storage
//! - `NativeFs` (in tee-daemon) - Local filesystem
//!
//! Every operation takes a [`Path`] relative to the storage root.

use crate::path::Path;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FsError {
    #[error("Not found: {0}")]
    NotFound(Path),

    #[error("Already exists: {0}")]
    AlreadyExists(Path),

    #[error("Is a directory: {0}")]
    IsDirectory(Path),

    #[error("Not a directory: {0}")]
    NotDirectory(Path),

    #[error("Aborted")]
    Aborted,

    #[error("Not implemented")]
    NotImplemented,

    #[error("IO error on {path}: {message}")]
    Io { path: Path, message: String },
}

impl FsError {
    /// Classify an OS error for `path`.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.clone()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.clone()),
            io::ErrorKind::IsADirectory => Self::IsDirectory(path.clone()),
            io::ErrorKind::NotADirectory => Self::NotDirectory(path.clone()),
            _ => Self::Io {
                path: path.clone(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Flags accepted by [`Storage::open`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(u16);

impl OpenFlags {
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const APPEND: Self = Self(1 << 2);
    pub const CREATE: Self = Self(1 << 3);
    pub const EXCL: Self = Self(1 << 4);
    pub const TRUNC: Self = Self(1 << 5);
    pub const NO_FOLLOW: Self = Self(1 << 6);
    pub const NO_ATIME: Self = Self(1 << 7);
    /// Open only a descriptor of the path, without access to contents.
    pub const PATH: Self = Self(1 << 8);

    pub const READ_WRITE: Self = Self(Self::READ.0 | Self::WRITE.0);
    /// What a tree walk opens directories with.
    pub const WALK_DEFAULTS: Self = Self(Self::READ.0 | Self::NO_FOLLOW.0 | Self::NO_ATIME.0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(OpenFlags, &str); 9] = [
            (OpenFlags::READ, "READ"),
            (OpenFlags::WRITE, "WRITE"),
            (OpenFlags::APPEND, "APPEND"),
            (OpenFlags::CREATE, "CREATE"),
            (OpenFlags::EXCL, "EXCL"),
            (OpenFlags::TRUNC, "TRUNC"),
            (OpenFlags::NO_FOLLOW, "NO_FOLLOW"),
            (OpenFlags::NO_ATIME, "NO_ATIME"),
            (OpenFlags::PATH, "PATH"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "OpenFlags({})", names.join(" | "))
    }
}

/// Kind of object a path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    /// Sockets, pipes, devices
    Other,
}

/// File metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Permission bits (e.g. `0o644`)
    pub mode: u32,
    /// Last modification time
    pub mtime: SystemTime,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    pub kind: FileKind,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// An opened object of a storage.
#[async_trait]
pub trait Object: Send + Sync + fmt::Debug {
    /// Path the object was opened at.
    fn path(&self) -> &Path;

    /// Metadata captured when the object was opened.
    fn stat(&self) -> &FileStat;

    /// List children (directories only)
    async fn read_dir(&self) -> Result<Vec<FileEntry>>;

    /// Read the whole content (regular files only)
    async fn read_to_end(&self) -> Result<Vec<u8>>;

    /// Replace the whole content (regular files only)
    async fn overwrite(&self, content: &[u8]) -> Result<()>;
}

/// Shared handle to an opened object.
pub type ObjectRef = Arc<dyn Object>;

/// Storage backend abstraction.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open (and with `CREATE`, create) the object at `path`.
    async fn open(&self, path: &Path, flags: OpenFlags, default_mode: u32) -> Result<ObjectRef>;

    /// Get metadata. With `no_follow`, a symlink describes itself.
    async fn stat(&self, path: &Path, no_follow: bool) -> Result<FileStat>;

    async fn mkdir(&self, path: &Path, mode: u32, recursive: bool) -> Result<()>;

    /// Create a symlink at `path` pointing at `target`.
    async fn symlink(&self, path: &Path, target: &Path) -> Result<()>;

    async fn readlink(&self, path: &Path) -> Result<Path>;

    async fn remove(&self, path: &Path, recursive: bool) -> Result<()>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Create a hard link `new` for `existing`.
    async fn link(&self, existing: &Path, new: &Path) -> Result<()>;

    async fn chmod(&self, path: &Path, mode: u32) -> Result<()>;

    async fn chown(&self, path: &Path, uid: u32, gid: u32, no_follow: bool) -> Result<()>;

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Node {
    File { content: Vec<u8>, mode: u32, mtime: SystemTime },
    Directory { mode: u32, mtime: SystemTime },
    Symlink { target: Path, mtime: SystemTime },
}

impl Node {
    fn stat(&self) -> FileStat {
        match self {
            Node::File { content, mode, mtime } => FileStat {
                kind: FileKind::File,
                size: content.len() as u64,
                mode: *mode,
                mtime: *mtime,
            },
            Node::Directory { mode, mtime } => FileStat {
                kind: FileKind::Directory,
                size: 0,
                mode: *mode,
                mtime: *mtime,
            },
            Node::Symlink { target, mtime } => FileStat {
                kind: FileKind::Symlink,
                size: target.to_string().len() as u64,
                mode: 0o777,
                mtime: *mtime,
            },
        }
    }
}

type Nodes = Arc<RwLock<BTreeMap<Path, Node>>>;

/// Symlink hops followed before giving up.
const MAX_SYMLINK_HOPS: usize = 8;

/// In-memory storage for testing
#[derive(Clone)]
pub struct InMemoryFs {
    nodes: Nodes,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            Path::root(),
            Node::Directory {
                mode: 0o755,
                mtime: SystemTime::now(),
            },
        ); // Root directory
        Self {
            nodes: Arc::new(RwLock::new(nodes)),
        }
    }

    /// Write a file, creating parent directories. Test setup helper.
    pub fn write_file(&self, path: &Path, content: &[u8]) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let mut ancestor = Path::root();
        for segment in path.segments().iter().take(path.len().saturating_sub(1)) {
            ancestor = ancestor.join(segment.clone());
            nodes.entry(ancestor.clone()).or_insert(Node::Directory {
                mode: 0o755,
                mtime: SystemTime::now(),
            });
        }
        nodes.insert(
            path.clone(),
            Node::File {
                content: content.to_vec(),
                mode: 0o644,
                mtime: SystemTime::now(),
            },
        );
    }

    /// Content of a regular file, if present. Test assertion helper.
    pub fn file_content(&self, path: &Path) -> Option<Vec<u8>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        match nodes.get(path) {
            Some(Node::File { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.contains_key(path)
    }

    /// Follow symlinks until a non-link node (or a missing path) is reached.
    fn resolve(nodes: &BTreeMap<Path, Node>, path: &Path) -> Result<Path> {
        let mut current = path.clone();
        for _ in 0..MAX_SYMLINK_HOPS {
            match nodes.get(&current) {
                Some(Node::Symlink { target, .. }) => {
                    let base = current.parent().unwrap_or_default();
                    current = normalize(&base.concat(target));
                }
                _ => return Ok(current),
            }
        }
        Err(FsError::Io {
            path: path.clone(),
            message: "too many levels of symbolic links".into(),
        })
    }

    fn check_parent(nodes: &BTreeMap<Path, Node>, path: &Path) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Err(FsError::AlreadyExists(path.clone()));
        };
        match nodes.get(&parent) {
            Some(Node::Directory { .. }) => Ok(()),
            Some(_) => Err(FsError::NotDirectory(parent)),
            None => Err(FsError::NotFound(parent)),
        }
    }

    fn children<'a>(
        nodes: &'a BTreeMap<Path, Node>,
        dir: &'a Path,
    ) -> impl Iterator<Item = (&'a Path, &'a Node)> + 'a {
        nodes
            .range(dir.clone()..)
            .skip_while(move |(p, _)| *p == dir)
            .take_while(move |(p, _)| p.starts_with(dir))
            .filter(move |(p, _)| p.len() == dir.len() + 1)
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse `..` segments.
fn normalize(path: &Path) -> Path {
    let mut segments: Vec<String> = Vec::new();
    for segment in path.segments() {
        if segment == ".." {
            segments.pop();
        } else if segment != "." {
            segments.push(segment.clone());
        }
    }
    Path::new(segments)
}

#[derive(Debug)]
struct MemObject {
    nodes: Nodes,
    path: Path,
    stat: FileStat,
}

#[async_trait]
impl Object for MemObject {
    fn path(&self) -> &Path {
        &self.path
    }

    fn stat(&self) -> &FileStat {
        &self.stat
    }

    async fn read_dir(&self) -> Result<Vec<FileEntry>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        match nodes.get(&self.path) {
            Some(Node::Directory { .. }) => {}
            Some(_) => return Err(FsError::NotDirectory(self.path.clone())),
            None => return Err(FsError::NotFound(self.path.clone())),
        }
        Ok(InMemoryFs::children(&nodes, &self.path)
            .map(|(p, node)| FileEntry {
                name: p.name().unwrap_or_default().to_string(),
                kind: node.stat().kind,
            })
            .collect())
    }

    async fn read_to_end(&self) -> Result<Vec<u8>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        match nodes.get(&self.path) {
            Some(Node::File { content, .. }) => Ok(content.clone()),
            Some(Node::Directory { .. }) => Err(FsError::IsDirectory(self.path.clone())),
            Some(Node::Symlink { .. }) => Err(FsError::NotImplemented),
            None => Err(FsError::NotFound(self.path.clone())),
        }
    }

    async fn overwrite(&self, data: &[u8]) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        match nodes.get_mut(&self.path) {
            Some(Node::File { content, mtime, .. }) => {
                *content = data.to_vec();
                *mtime = SystemTime::now();
                Ok(())
            }
            Some(Node::Directory { .. }) => Err(FsError::IsDirectory(self.path.clone())),
            Some(Node::Symlink { .. }) => Err(FsError::NotImplemented),
            None => Err(FsError::NotFound(self.path.clone())),
        }
    }
}

#[async_trait]
impl Storage for InMemoryFs {
    async fn open(&self, path: &Path, flags: OpenFlags, default_mode: u32) -> Result<ObjectRef> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let resolved = if flags.contains(OpenFlags::NO_FOLLOW) {
            path.clone()
        } else {
            Self::resolve(&nodes, path)?
        };

        match nodes.get_mut(&resolved) {
            Some(_) if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) => {
                return Err(FsError::AlreadyExists(path.clone()));
            }
            Some(Node::Directory { .. }) if flags.intersects(OpenFlags::WRITE) => {
                return Err(FsError::IsDirectory(path.clone()));
            }
            Some(Node::File { content, .. }) if flags.contains(OpenFlags::TRUNC) => {
                content.clear();
            }
            Some(_) => {}
            None if flags.contains(OpenFlags::CREATE) => {
                Self::check_parent(&nodes, &resolved)?;
                nodes.insert(
                    resolved.clone(),
                    Node::File {
                        content: Vec::new(),
                        mode: default_mode & 0o7777,
                        mtime: SystemTime::now(),
                    },
                );
            }
            None => return Err(FsError::NotFound(path.clone())),
        }

        let stat = nodes
            .get(&resolved)
            .map(Node::stat)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        Ok(Arc::new(MemObject {
            nodes: Arc::clone(&self.nodes),
            path: resolved,
            stat,
        }))
    }

    async fn stat(&self, path: &Path, no_follow: bool) -> Result<FileStat> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let resolved = if no_follow {
            path.clone()
        } else {
            Self::resolve(&nodes, path)?
        };
        nodes
            .get(&resolved)
            .map(Node::stat)
            .ok_or_else(|| FsError::NotFound(path.clone()))
    }

    async fn mkdir(&self, path: &Path, mode: u32, recursive: bool) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if recursive {
            let mut ancestor = Path::root();
            for segment in path.segments() {
                ancestor = ancestor.join(segment.clone());
                match nodes.get(&ancestor) {
                    Some(Node::Directory { .. }) => {}
                    Some(_) => return Err(FsError::NotDirectory(ancestor)),
                    None => {
                        nodes.insert(
                            ancestor.clone(),
                            Node::Directory {
                                mode: mode & 0o7777,
                                mtime: SystemTime::now(),
                            },
                        );
                    }
                }
            }
            return Ok(());
        }

        if nodes.contains_key(path) {
            return Err(FsError::AlreadyExists(path.clone()));
        }
        Self::check_parent(&nodes, path)?;
        nodes.insert(
            path.clone(),
            Node::Directory {
                mode: mode & 0o7777,
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn symlink(&self, path: &Path, target: &Path) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if nodes.contains_key(path) {
            return Err(FsError::AlreadyExists(path.clone()));
        }
        Self::check_parent(&nodes, path)?;
        nodes.insert(
            path.clone(),
            Node::Symlink {
                target: target.clone(),
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn readlink(&self, path: &Path) -> Result<Path> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        match nodes.get(path) {
            Some(Node::Symlink { target, .. }) => Ok(target.clone()),
            Some(_) => Err(FsError::Io {
                path: path.clone(),
                message: "not a symlink".into(),
            }),
            None => Err(FsError::NotFound(path.clone())),
        }
    }

    async fn remove(&self, path: &Path, recursive: bool) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let Some(node) = nodes.get(path) else {
            return Err(FsError::NotFound(path.clone()));
        };
        if matches!(node, Node::Directory { .. }) {
            let has_children = Self::children(&nodes, path).next().is_some();
            if has_children && !recursive {
                return Err(FsError::Io {
                    path: path.clone(),
                    message: "directory not empty".into(),
                });
            }
            nodes.retain(|p, _| !p.starts_with(path));
        } else {
            nodes.remove(path);
        }
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if !nodes.contains_key(from) {
            return Err(FsError::NotFound(from.clone()));
        }
        Self::check_parent(&nodes, to)?;
        let moved: Vec<Path> = nodes
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        nodes.retain(|p, _| !p.starts_with(to));
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let suffix = Path::new(old.segments()[from.len()..].iter().cloned());
                nodes.insert(to.concat(&suffix), node);
            }
        }
        Ok(())
    }

    async fn link(&self, existing: &Path, new: &Path) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let node = match nodes.get(existing) {
            Some(Node::Directory { .. }) => return Err(FsError::IsDirectory(existing.clone())),
            Some(node) => node.clone(),
            None => return Err(FsError::NotFound(existing.clone())),
        };
        if nodes.contains_key(new) {
            return Err(FsError::AlreadyExists(new.clone()));
        }
        Self::check_parent(&nodes, new)?;
        // Content is copied rather than shared; enough for tests.
        nodes.insert(new.clone(), node);
        Ok(())
    }

    async fn chmod(&self, path: &Path, new_mode: u32) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let resolved = Self::resolve(&nodes, path)?;
        match nodes.get_mut(&resolved) {
            Some(Node::File { mode, .. }) | Some(Node::Directory { mode, .. }) => {
                *mode = new_mode & 0o7777;
                Ok(())
            }
            Some(Node::Symlink { .. }) => Ok(()),
            None => Err(FsError::NotFound(path.clone())),
        }
    }

    async fn chown(&self, path: &Path, _uid: u32, _gid: u32, _no_follow: bool) -> Result<()> {
        if self.exists(path) {
            Ok(())
        } else {
            Err(FsError::NotFound(path.clone()))
        }
    }

    async fn chtimes(&self, path: &Path, _atime: SystemTime, new_mtime: SystemTime) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let resolved = Self::resolve(&nodes, path)?;
        match nodes.get_mut(&resolved) {
            Some(Node::File { mtime, .. })
            | Some(Node::Directory { mtime, .. })
            | Some(Node::Symlink { mtime, .. }) => {
                *mtime = new_mtime;
                Ok(())
            }
            None => Err(FsError::NotFound(path.clone())),
        }
    }
}

// Implement Storage for Arc<T> where T: Storage
// This allows sharing one backend between a syncer and test assertions
#[async_trait]
impl<T: Storage + ?Sized> Storage for Arc<T> {
    async fn open(&self, path: &Path, flags: OpenFlags, default_mode: u32) -> Result<ObjectRef> {
        (**self).open(path, flags, default_mode).await
    }

    async fn stat(&self, path: &Path, no_follow: bool) -> Result<FileStat> {
        (**self).stat(path, no_follow).await
    }

    async fn mkdir(&self, path: &Path, mode: u32, recursive: bool) -> Result<()> {
        (**self).mkdir(path, mode, recursive).await
    }

    async fn symlink(&self, path: &Path, target: &Path) -> Result<()> {
        (**self).symlink(path, target).await
    }

    async fn readlink(&self, path: &Path) -> Result<Path> {
        (**self).readlink(path).await
    }

    async fn remove(&self, path: &Path, recursive: bool) -> Result<()> {
        (**self).remove(path, recursive).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        (**self).rename(from, to).await
    }

    async fn link(&self, existing: &Path, new: &Path) -> Result<()> {
        (**self).link(existing, new).await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        (**self).chmod(path, mode).await
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32, no_follow: bool) -> Result<()> {
        (**self).chown(path, uid, gid, no_follow).await
    }

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        (**self).chtimes(path, atime, mtime).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(segments: &[&str]) -> Path {
        Path::new(segments.iter().copied())
    }

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        // Create a file through open
        let obj = fs
            .open(&p(&["test.txt"]), OpenFlags::READ_WRITE | OpenFlags::CREATE, 0o640)
            .await
            .unwrap();
        obj.overwrite(b"hello world").await.unwrap();

        // Read it back through a fresh handle
        let obj = fs.open(&p(&["test.txt"]), OpenFlags::READ, 0).await.unwrap();
        assert_eq!(obj.read_to_end().await.unwrap(), b"hello world");
        assert_eq!(obj.stat().mode, 0o640);

        // Exclusive create fails on an existing file
        let err = fs
            .open(&p(&["test.txt"]), OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCL, 0o600)
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));

        // Remove
        fs.remove(&p(&["test.txt"]), false).await.unwrap();
        assert!(fs.stat(&p(&["test.txt"]), true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_inmemory_fs_directories() {
        let fs = InMemoryFs::new();

        // Setup helper creates parent directories
        fs.write_file(&p(&["a", "b", "c.txt"]), b"content");
        assert!(fs.stat(&p(&["a", "b"]), true).await.unwrap().is_dir());

        // List directory
        let dir = fs.open(&p(&["a"]), OpenFlags::WALK_DEFAULTS, 0).await.unwrap();
        let entries = dir.read_dir().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir());

        // Creating inside a missing directory fails
        let err = fs
            .open(&p(&["missing", "x"]), OpenFlags::WRITE | OpenFlags::CREATE, 0o644)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // Non-recursive remove refuses non-empty directories
        assert!(fs.remove(&p(&["a"]), false).await.is_err());
        fs.remove(&p(&["a"]), true).await.unwrap();
        assert!(!fs.exists(&p(&["a", "b", "c.txt"])));
    }

    #[tokio::test]
    async fn test_inmemory_fs_symlinks() {
        let fs = InMemoryFs::new();
        fs.write_file(&p(&["file"]), b"data");
        fs.mkdir(&p(&["dir"]), 0o755, false).await.unwrap();
        fs.symlink(&p(&["dir", "link"]), &p(&["..", "file"])).await.unwrap();

        assert_eq!(fs.readlink(&p(&["dir", "link"])).await.unwrap(), p(&["..", "file"]));
        assert_eq!(
            fs.stat(&p(&["dir", "link"]), true).await.unwrap().kind,
            FileKind::Symlink
        );

        let followed = fs.open(&p(&["dir", "link"]), OpenFlags::READ, 0).await.unwrap();
        assert_eq!(followed.read_to_end().await.unwrap(), b"data");

        let unfollowed = fs
            .open(&p(&["dir", "link"]), OpenFlags::READ | OpenFlags::NO_FOLLOW, 0)
            .await
            .unwrap();
        assert_eq!(unfollowed.stat().kind, FileKind::Symlink);
    }

    #[tokio::test]
    async fn test_inmemory_fs_rename_moves_subtree() {
        let fs = InMemoryFs::new();
        fs.write_file(&p(&["old", "x", "y"]), b"1");
        fs.rename(&p(&["old"]), &p(&["new"])).await.unwrap();
        assert_eq!(fs.file_content(&p(&["new", "x", "y"])), Some(b"1".to_vec()));
        assert!(!fs.exists(&p(&["old"])));
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::READ_WRITE | OpenFlags::CREATE;
        assert!(flags.contains(OpenFlags::READ));
        assert!(flags.contains(OpenFlags::WRITE));
        assert!(!flags.contains(OpenFlags::TRUNC));
        assert!(OpenFlags::WALK_DEFAULTS.contains(OpenFlags::NO_FOLLOW));
        assert_eq!(format!("{:?}", OpenFlags::READ_WRITE), "OpenFlags(READ | WRITE)");
    }
}
