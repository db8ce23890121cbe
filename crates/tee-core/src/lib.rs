//! tee-core: Debounced one-way replication between two storage trees.
//!
//! This crate provides:
//! - Collision-free path keys and the `Storage`/`Object` abstraction
//! - Depth-first tree walking with pluggable error handling
//! - The debounce scheduler (task, task heap, task store)
//! - A single-flight cache for destination opens
//! - The `Syncer` tying watch events, scheduling and copying together

pub mod cache;
pub mod event;
pub mod fs;
pub mod path;
pub mod syncer;
pub mod walk;

pub use cache::{CacheConfig, CacheError, CachedStorage};
pub use event::{ChangeEvent, ChangeKind, Watcher};
pub use fs::{FileEntry, FileKind, FileStat, FsError, InMemoryFs, Object, ObjectRef, OpenFlags, Storage};
pub use path::{Path, PathKey};
pub use syncer::{ConfigError, SyncError, Syncer, SyncerConfig};
pub use walk::{ErrorHandler, ShouldDescend, WalkEntry, WalkError, skip_vanished, walk};
