//! Error taxonomy shared by the coordinator, the storage nodes and the wire
//! protocol.
//!
//! The `Display` text of every variant doubles as the single reply line sent
//! back to a peer when an operation fails, so messages stay on one line.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DfsError {
    #[error("invalid path '{0}': paths must be non-empty, must not start or end with '/' and must not contain empty segments")]
    InvalidPath(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("cannot create {0} because its parent directory does not exist")]
    MissingParent(String),

    #[error("no such file: {0}")]
    NoSuchFile(String),

    #[error("no storage nodes are connected")]
    NoStorageAvailable,

    #[error("a client is already attached ({0}); log it out first")]
    ClientAlreadyAttached(String),

    #[error("protocol mismatch: expected a {expected} peer, found {found}")]
    ProtocolMismatch { expected: String, found: String },

    #[error("storage node {endpoint} is unavailable: {reason}")]
    StorageUnavailable { endpoint: String, reason: String },

    #[error("journal {}: {reason}", .path.display())]
    Journal { path: PathBuf, reason: String },

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type DfsResult<T> = Result<T, DfsError>;

impl DfsError {
    pub fn storage_unavailable(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::StorageUnavailable {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    pub fn journal(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Journal {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol_mismatch(expected: impl ToString, found: impl ToString) -> Self {
        Self::ProtocolMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Journal failures mean this node can no longer persist its state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Journal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_fit_on_one_line() {
        let errors = [
            DfsError::InvalidPath("/a".into()),
            DfsError::AlreadyExists("a".into()),
            DfsError::MissingParent("a/b".into()),
            DfsError::NoStorageAvailable,
            DfsError::storage_unavailable("127.0.0.1:1", "connection refused"),
            DfsError::journal("/tmp/meta_journal", "bad magic"),
            DfsError::protocol_mismatch("storage", "client"),
        ];
        for err in errors {
            assert!(!err.to_string().contains('\n'), "{err}");
        }
    }

    #[test]
    fn only_journal_errors_are_fatal() {
        assert!(DfsError::journal("x", "disk full").is_fatal());
        assert!(!DfsError::NoStorageAvailable.is_fatal());
        assert!(!DfsError::UnknownCommand("frob".into()).is_fatal());
    }
}
