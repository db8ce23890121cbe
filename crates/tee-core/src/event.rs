//! Change notifications flowing from a watcher into the syncer.

use crate::path::Path;
use crate::walk::WalkError;
use async_trait::async_trait;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use tokio::time::Instant;

/// What happened to a path. Several bits may be set at once.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeKind(u16);

impl ChangeKind {
    pub const CREATE: Self = Self(1 << 0);
    pub const UPDATE: Self = Self(1 << 1);
    pub const DELETE: Self = Self(1 << 2);
    pub const WRITE: Self = Self(1 << 3);
    pub const OPEN: Self = Self(1 << 4);
    pub const CLOSE_WRITE: Self = Self(1 << 5);
    pub const ATTRIB: Self = Self(1 << 6);
    pub const MOVE: Self = Self(1 << 7);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::CREATE, "CREATE"),
        (Self::UPDATE, "UPDATE"),
        (Self::DELETE, "DELETE"),
        (Self::WRITE, "WRITE"),
        (Self::OPEN, "OPEN"),
        (Self::CLOSE_WRITE, "CLOSE_WRITE"),
        (Self::ATTRIB, "ATTRIB"),
        (Self::MOVE, "MOVE"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for ChangeKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeKind {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(kind, _)| self.contains(*kind))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "ChangeKind({})", names.join(" | "))
    }
}

/// A single filesystem notification, relative to the watched root.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: Path,
    pub kind: ChangeKind,
    pub timestamp: Instant,
}

impl ChangeEvent {
    pub fn new(path: Path, kind: ChangeKind) -> Self {
        Self {
            path,
            kind,
            timestamp: Instant::now(),
        }
    }
}

/// Something that can start watching new directories of the source tree.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Mark `path` and every directory beneath it for watching.
    async fn watch(&self, path: &Path) -> Result<(), WalkError>;
}
