//! OS-agnostic hierarchical paths and their canonical map keys.
//!
//! A [`Path`] is a sequence of segments. No character is reserved inside a
//! segment (`/`, `\` and `\0` are all allowed), so a joined string can not
//! serve as a map key: `["a", "b/c"]` and `["a/b", "c"]` would collide.
//! [`PathKey`] length-delimits every segment instead.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, PathBuf};

/// OS-agnostic representation of a path, one string per nesting level.
///
/// An absolute local path starts with an empty segment (the root), matching
/// how a Unix path splits on its separator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(Vec<String>);

impl Path {
    /// The empty path, which names the root of a storage.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Split a local path into segments.
    pub fn from_local(path: &std::path::Path) -> Self {
        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::RootDir => segments.push(String::new()),
                Component::Prefix(prefix) => {
                    segments.push(prefix.as_os_str().to_string_lossy().into_owned())
                }
                Component::CurDir => {}
                Component::ParentDir => segments.push("..".to_string()),
                Component::Normal(name) => segments.push(name.to_string_lossy().into_owned()),
            }
        }
        Self(segments)
    }

    /// Render as a local path. A leading empty segment becomes the root.
    pub fn to_local(&self) -> PathBuf {
        let mut result = PathBuf::new();
        let mut segments = self.0.iter();
        if self.is_absolute() {
            result.push(std::path::MAIN_SEPARATOR_STR);
            segments.next();
        }
        for segment in segments {
            result.push(segment);
        }
        result
    }

    pub fn is_absolute(&self) -> bool {
        self.0.first().is_some_and(|s| s.is_empty())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last segment, if any.
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// A new path with `segment` appended.
    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// A new path with every segment of `other` appended.
    pub fn concat(&self, other: &Path) -> Self {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        Self(segments)
    }

    /// The path one level up; `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Express `self` relative to `root`, climbing with `..` where the two
    /// diverge.
    pub fn relative_to(&self, root: &Path) -> Self {
        let common = self
            .0
            .iter()
            .zip(root.0.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let rest = &self.0[common..];
        if common == root.0.len() {
            return Self(rest.to_vec());
        }

        let ups = root.0.len() - common;
        let mut segments = Vec::with_capacity(ups + rest.len());
        segments.extend(std::iter::repeat_n("..".to_string(), ups));
        segments.extend(rest.iter().cloned());
        Self(segments)
    }

    /// Canonical, collision-free key for maps.
    pub fn key(&self) -> PathKey {
        PathKey::new(self)
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(".");
        }
        write!(f, "{}", self.to_local().display())
    }
}

impl<S: Into<String>> FromIterator<S> for Path {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Fixed serialization of a [`Path`]: segment count, then every segment as a
/// little-endian `u64` length followed by its bytes.
///
/// Because every segment is length-prefixed the encoding is a prefix code,
/// so two distinct segment sequences never produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(Vec<u8>);

impl PathKey {
    fn new(path: &Path) -> Self {
        let payload: usize = path.0.iter().map(|s| 8 + s.len()).sum();
        let mut buf = Vec::with_capacity(8 + payload);
        buf.extend_from_slice(&(path.0.len() as u64).to_le_bytes());
        for segment in &path.0 {
            buf.extend_from_slice(&(segment.len() as u64).to_le_bytes());
            buf.extend_from_slice(segment.as_bytes());
        }
        Self(buf)
    }

    /// Rebuild the path this key was derived from.
    pub fn to_path(&self) -> Path {
        let mut cursor = self.0.as_slice();
        let count = take_len(&mut cursor);
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let len = take_len(&mut cursor);
            let (segment, rest) = cursor.split_at(len);
            // Keys are only built from `String`s, so the bytes are valid UTF-8.
            segments.push(String::from_utf8_lossy(segment).into_owned());
            cursor = rest;
        }
        Path(segments)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn take_len(cursor: &mut &[u8]) -> usize {
    let (head, rest) = cursor.split_at(8);
    *cursor = rest;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(head);
    u64::from_le_bytes(bytes) as usize
}
