//! Namespace paths.
//!
//! A path is a sequence of non-empty segments joined by `/`. Paths never
//! start or end with the separator; the namespace has no explicit root, so a
//! single-segment path is a top-level directory.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DfsError, DfsResult};

pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DfsPath(String);

impl DfsPath {
    /// Wraps a raw string without validating it. Use [`DfsPath::parse`] for
    /// anything that came off the wire.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Builds a path and checks it is well formed.
    pub fn parse(raw: &str) -> DfsResult<Self> {
        let path = Self::new(raw);
        path.validate()?;
        Ok(path)
    }

    pub fn validate(&self) -> DfsResult<()> {
        if self.0.is_empty() || self.0.split(SEPARATOR).any(str::is_empty) {
            return Err(DfsError::InvalidPath(self.0.clone()));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path with its last segment removed, or `None` for a single-segment
    /// or empty path.
    pub fn parent(&self) -> Option<DfsPath> {
        let (parent, _) = self.0.rsplit_once(SEPARATOR)?;
        Some(Self::new(parent))
    }

    /// The last segment, or `None` when there are fewer than two segments.
    pub fn leaf(&self) -> Option<&str> {
        self.0.rsplit_once(SEPARATOR).map(|(_, leaf)| leaf)
    }

    /// Walks from the immediate parent towards the top-level directory.
    pub fn ancestors(&self) -> impl Iterator<Item = DfsPath> {
        std::iter::successors(self.parent(), DfsPath::parent)
    }
}

impl fmt::Display for DfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `list` accepts an empty prefix, but a non-empty one still must not carry a
/// leading or trailing separator.
pub fn validate_prefix(prefix: &str) -> DfsResult<()> {
    if prefix.starts_with(SEPARATOR) || prefix.ends_with(SEPARATOR) {
        return Err(DfsError::InvalidPath(prefix.to_string()));
    }
    Ok(())
}
