//! Whole-state snapshot files.
//!
//! Layout: an 8-byte magic, a little-endian `u32` format version, a
//! little-endian `u64` payload length, then the bincode payload. A snapshot
//! is written to a sibling temp file and renamed over the old one, so a
//! reader sees either the previous or the new image.

use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{DfsError, DfsResult};

pub const MAGIC: &[u8; 8] = b"MINIDFS\0";
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = MAGIC.len() + 4 + 8;

pub struct JournalStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JournalStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn encode(value: &T) -> Result<Vec<u8>, String> {
        let payload = bincode::serialize(value).map_err(|err| err.to_string())?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<T, String> {
        if bytes.len() < HEADER_LEN {
            return Err(format!("truncated header ({} bytes)", bytes.len()));
        }
        let (magic, rest) = bytes.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err("bad magic".to_string());
        }

        let (version, rest) = rest.split_at(4);
        let version = u32::from_le_bytes(version.try_into().map_err(|_| "bad version field")?);
        if version != FORMAT_VERSION {
            return Err(format!("unsupported format version {version}"));
        }

        let (length, payload) = rest.split_at(8);
        let length = u64::from_le_bytes(length.try_into().map_err(|_| "bad length field")?);
        if payload.len() as u64 != length {
            return Err(format!(
                "payload is {} bytes but the header says {length}",
                payload.len()
            ));
        }
        bincode::deserialize(payload).map_err(|err| err.to_string())
    }

    /// Reads the snapshot. A missing file is `Ok(None)`; anything unreadable
    /// is a journal error.
    pub async fn load(&self) -> DfsResult<Option<T>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(DfsError::journal(&self.path, err)),
        };
        let value = Self::decode(&bytes).map_err(|reason| DfsError::journal(&self.path, reason))?;
        info!(path = %self.path.display(), bytes = bytes.len(), "journal loaded");
        Ok(Some(value))
    }

    pub async fn save(&self, value: &T) -> DfsResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write_locked(value).await
    }

    /// Takes the snapshot while holding the write lock, so concurrent savers
    /// never overwrite a newer image with an older one.
    pub async fn save_with<F>(&self, snapshot: F) -> DfsResult<()>
    where
        F: FnOnce() -> T,
    {
        let _guard = self.write_lock.lock().await;
        let value = snapshot();
        self.write_locked(&value).await
    }

    async fn write_locked(&self, value: &T) -> DfsResult<()> {
        let bytes = Self::encode(value).map_err(|reason| DfsError::journal(&self.path, reason))?;
        let tmp = self.path.with_extension("tmp");
        let result = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;
        result.map_err(|err| DfsError::journal(&self.path, err))?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "journal written");
        Ok(())
    }

    /// Deletes the snapshot. Failing to delete is an I/O error, not a
    /// journal error: the node can still persist.
    pub async fn remove(&self) -> DfsResult<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
