//! The coordinator's authoritative namespace.
//!
//! Directories are flat string keys mapping to the files they directly
//! contain. A directory exists iff it is a key, even with no files. Recursive
//! operations (`rmdir`, `list`) match keys by string prefix, so `rmdir a`
//! also removes a sibling `ab`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::error::{DfsError, DfsResult};
use crate::identity::NodeIdentity;
use crate::path::{self, DfsPath};

pub const DEFAULT_PERMISSIONS: &str = "RW";

/// Whole-namespace image written to the coordinator journal.
pub type NamespaceSnapshot = BTreeMap<String, Vec<FileRecord>>;

/// One block of a file and the storage nodes holding a replica of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPlacement {
    pub block: Block,
    pub replicas: Vec<NodeIdentity>,
}

impl BlockPlacement {
    pub fn new(block: Block, replicas: Vec<NodeIdentity>) -> Self {
        Self { block, replicas }
    }
}

/// Metadata for a single file. Records compare equal when their filenames
/// match, which is what sibling-uniqueness checks rely on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    /// Milliseconds since the Unix epoch.
    pub created_ms: u64,
    pub modified_ms: u64,
    pub permissions: String,
    pub owner: String,
    pub blocks: Vec<BlockPlacement>,
}

impl FileRecord {
    fn new(filename: &str, owner: &str, blocks: Vec<BlockPlacement>) -> Self {
        let now = now_ms();
        Self {
            filename: filename.to_string(),
            created_ms: now,
            modified_ms: now,
            permissions: DEFAULT_PERMISSIONS.to_string(),
            owner: owner.to_string(),
            blocks,
        }
    }

    /// Every node holding any block of this file, in placement order,
    /// without duplicates.
    pub fn replicas(&self) -> Vec<NodeIdentity> {
        let mut nodes: Vec<NodeIdentity> = Vec::new();
        for node in self.blocks.iter().flat_map(|placement| &placement.replicas) {
            if !nodes.iter().any(|known| known.same_endpoint(node)) {
                nodes.push(node.clone());
            }
        }
        nodes
    }
}

impl PartialEq for FileRecord {
    fn eq(&self, other: &Self) -> bool {
        self.filename == other.filename
    }
}

impl Eq for FileRecord {}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filename)
    }
}

/// A file located through its parent directory, with the full path it lives
/// under.
#[derive(Debug, Clone)]
pub struct LocatedFile {
    pub path: String,
    pub record: FileRecord,
}

/// Everything `rmdir` took out of the namespace.
#[derive(Debug, Default)]
pub struct Removed {
    /// Removed directory keys, in key order.
    pub directories: Vec<String>,
    /// Files that lived under the removed directories.
    pub files: Vec<LocatedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    NoRootDirectories,
    Entries(Vec<String>),
}

pub struct NamespaceStore {
    dirs: RwLock<NamespaceSnapshot>,
    owner: String,
}

impl NamespaceStore {
    pub fn new(owner: impl Into<String>) -> Self {
        Self::from_snapshot(owner, NamespaceSnapshot::new())
    }

    pub fn from_snapshot(owner: impl Into<String>, snapshot: NamespaceSnapshot) -> Self {
        Self {
            dirs: RwLock::new(snapshot),
            owner: owner.into(),
        }
    }

    pub fn mkdir(&self, raw: &str) -> DfsResult<()> {
        let path = DfsPath::parse(raw)?;
        let mut dirs = self.dirs.write();
        if dirs.contains_key(path.as_str()) {
            return Err(DfsError::AlreadyExists(path.to_string()));
        }
        if let Some(parent) = path.parent() {
            if !dirs.contains_key(parent.as_str()) {
                return Err(DfsError::MissingParent(path.to_string()));
            }
        }
        dirs.insert(path.to_string(), Vec::new());
        Ok(())
    }

    /// Creates `raw` and every missing ancestor. The upward walk stops at the
    /// first ancestor that already exists. Returns the keys created.
    pub fn mkdirs(&self, raw: &str) -> DfsResult<Vec<String>> {
        let path = DfsPath::parse(raw)?;
        let mut dirs = self.dirs.write();
        if dirs.contains_key(path.as_str()) {
            return Err(DfsError::AlreadyExists(path.to_string()));
        }

        let mut created = Vec::new();
        for ancestor in path.ancestors() {
            if dirs.contains_key(ancestor.as_str()) {
                break;
            }
            dirs.insert(ancestor.to_string(), Vec::new());
            created.push(ancestor.to_string());
        }
        dirs.insert(path.to_string(), Vec::new());
        created.push(path.to_string());
        Ok(created)
    }

    /// Removes every directory key starting with `raw`, together with its
    /// files.
    pub fn rmdir(&self, raw: &str) -> DfsResult<Removed> {
        let path = DfsPath::parse(raw)?;
        let mut dirs = self.dirs.write();
        let doomed: Vec<String> = dirs
            .keys()
            .filter(|key| key.starts_with(path.as_str()))
            .cloned()
            .collect();

        let mut removed = Removed::default();
        for key in doomed {
            if let Some(records) = dirs.remove(&key) {
                removed.files.extend(records.into_iter().map(|record| LocatedFile {
                    path: format!("{key}/{}", record.filename),
                    record,
                }));
            }
            removed.directories.push(key);
        }
        Ok(removed)
    }

    /// Checks that a file could be created at `raw` right now: the path is
    /// well formed, it has a parent directory, and no sibling shares its name.
    pub fn ensure_creatable(&self, raw: &str) -> DfsResult<()> {
        let path = DfsPath::parse(raw)?;
        let dirs = self.dirs.read();
        Self::check_creatable(&dirs, &path).map(|_| ())
    }

    /// Adds a new file record under its parent directory.
    pub fn create_file(&self, raw: &str, blocks: Vec<BlockPlacement>) -> DfsResult<FileRecord> {
        let path = DfsPath::parse(raw)?;
        let mut dirs = self.dirs.write();
        let (parent, leaf) = Self::check_creatable(&dirs, &path)?;
        let record = FileRecord::new(&leaf, &self.owner, blocks);
        dirs.entry(parent).or_default().push(record.clone());
        Ok(record)
    }

    fn check_creatable(dirs: &NamespaceSnapshot, path: &DfsPath) -> DfsResult<(String, String)> {
        let (Some(parent), Some(leaf)) = (path.parent(), path.leaf()) else {
            return Err(DfsError::MissingParent(path.to_string()));
        };
        let Some(files) = dirs.get(parent.as_str()) else {
            return Err(DfsError::MissingParent(path.to_string()));
        };
        if files.iter().any(|record| record.filename == leaf) {
            return Err(DfsError::AlreadyExists(path.to_string()));
        }
        Ok((parent.to_string(), leaf.to_string()))
    }

    pub fn locate(&self, raw: &str) -> DfsResult<FileRecord> {
        let path = DfsPath::parse(raw)?;
        let dirs = self.dirs.read();
        Self::find(&dirs, &path)
            .cloned()
            .ok_or_else(|| DfsError::NoSuchFile(path.to_string()))
    }

    /// Bumps the modification time of an existing file and returns it.
    pub fn touch(&self, raw: &str) -> DfsResult<FileRecord> {
        let path = DfsPath::parse(raw)?;
        let mut dirs = self.dirs.write();
        let (Some(parent), Some(leaf)) = (path.parent(), path.leaf()) else {
            return Err(DfsError::NoSuchFile(path.to_string()));
        };
        let record = dirs
            .get_mut(parent.as_str())
            .and_then(|files| files.iter_mut().find(|record| record.filename == leaf))
            .ok_or_else(|| DfsError::NoSuchFile(path.to_string()))?;
        record.modified_ms = now_ms().max(record.modified_ms);
        Ok(record.clone())
    }

    fn find<'a>(dirs: &'a NamespaceSnapshot, path: &DfsPath) -> Option<&'a FileRecord> {
        let parent = path.parent()?;
        let leaf = path.leaf()?;
        dirs.get(parent.as_str())?
            .iter()
            .find(|record| record.filename == leaf)
    }

    /// Renders every directory whose key starts with `prefix` as
    /// `key : [file, ...]`. An empty namespace is reported before the prefix
    /// is looked at.
    pub fn list(&self, prefix: &str) -> DfsResult<Listing> {
        let dirs = self.dirs.read();
        if dirs.is_empty() {
            return Ok(Listing::NoRootDirectories);
        }
        path::validate_prefix(prefix)?;

        let entries = dirs
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, files)| {
                let names: Vec<&str> = files.iter().map(|record| record.filename.as_str()).collect();
                format!("{key} : [{}]", names.join(", "))
            })
            .collect();
        Ok(Listing::Entries(entries))
    }

    pub fn contains_dir(&self, key: &str) -> bool {
        self.dirs.read().contains_key(key)
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.read().len()
    }

    /// Drops every directory and file.
    pub fn format(&self) {
        self.dirs.write().clear();
    }

    /// Clones the whole namespace so the lock is not held while it is
    /// encoded.
    pub fn snapshot(&self) -> NamespaceSnapshot {
        self.dirs.read().clone()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
