//! On-disk block files of a storage node.
//!
//! Each file path maps to the ordered list of blocks holding its content.
//! Block files live flat in the block directory as `blk_<id>`. Every
//! structural change to the listing is followed by a journal snapshot.

use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::path::PathBuf;

use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::config::StorageConfig;
use crate::error::{DfsError, DfsResult};
use crate::journal::JournalStore;
use crate::protocol::{decode_payload, encode_payload};

pub type BlockSnapshot = BTreeMap<String, Vec<Block>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Append,
}

pub struct BlockStore {
    block_dir: PathBuf,
    blocks: Mutex<BlockSnapshot>,
    journal: JournalStore<BlockSnapshot>,
    read_budget: usize,
    block_capacity: u64,
}

impl BlockStore {
    /// Creates the block directory if needed and restores the listing from
    /// the journal.
    pub async fn open(config: &StorageConfig) -> DfsResult<Self> {
        let block_dir = config.block_dir();
        tokio::fs::create_dir_all(&block_dir).await?;

        let journal: JournalStore<BlockSnapshot> = JournalStore::new(config.journal_path());
        let blocks = journal.load().await?.unwrap_or_default();
        info!(
            dir = %block_dir.display(),
            files = blocks.len(),
            "block store opened"
        );

        Ok(Self {
            block_dir,
            blocks: Mutex::new(blocks),
            journal,
            read_budget: config.read_budget,
            block_capacity: config.block_capacity,
        })
    }

    fn block_path(&self, block: &Block) -> PathBuf {
        self.block_dir.join(block.file_name())
    }

    /// Allocates the first block of a new file and creates its backing file.
    pub async fn create_block_list(&self, path: &str) -> DfsResult<Block> {
        let block = {
            let mut blocks = self.blocks.lock();
            if blocks.contains_key(path) {
                return Err(DfsError::AlreadyExists(format!("block listing for {path}")));
            }
            let block = Block::allocate();
            blocks.insert(path.to_string(), vec![block.clone()]);
            block
        };

        if let Err(err) = File::create(self.block_path(&block)).await {
            self.blocks.lock().remove(path);
            return Err(err.into());
        }
        self.save_journal().await?;
        debug!(path, %block, "block listing created");
        Ok(block)
    }

    /// Writes `data` into the file's last block. Escaped `\n` sequences are
    /// decoded first.
    ///
    /// Overwriting collapses the listing to its last block. Appending to a
    /// saturated block first grows the listing by a fresh block. A block is
    /// marked saturated once it reaches the configured capacity. The listing
    /// only changes once the block file has been written.
    pub async fn write(&self, path: &str, data: &str, mode: WriteMode) -> DfsResult<Block> {
        let payload = decode_payload(data);

        let (target, stale, grew) = {
            let mut blocks = self.blocks.lock();
            let list = blocks
                .get_mut(path)
                .ok_or_else(|| DfsError::NoSuchFile(path.to_string()))?;
            let last = list
                .last()
                .cloned()
                .ok_or_else(|| DfsError::NoSuchFile(path.to_string()))?;

            match mode {
                WriteMode::Overwrite => {
                    let stale = list[..list.len() - 1].to_vec();
                    (last, stale, false)
                }
                WriteMode::Append if !last.is_saturated() => (last, Vec::new(), false),
                WriteMode::Append => {
                    let fresh = Block::allocate();
                    list.push(fresh.clone());
                    (fresh, Vec::new(), true)
                }
            }
        };

        let len = match self.write_block(&target, &payload, mode).await {
            Ok(len) => len,
            Err(err) => {
                if grew {
                    self.forget_block(path, &target);
                    self.delete_block_file(&target).await;
                }
                return Err(err.into());
            }
        };

        let (dropped, changed) = self.settle(path, &target, &stale, len);
        for block in &dropped {
            self.delete_block_file(block).await;
        }
        if grew || changed {
            self.save_journal().await?;
        }
        debug!(path, block = %target, ?mode, bytes = payload.len(), "block written");
        Ok(target)
    }

    async fn write_block(&self, block: &Block, payload: &str, mode: WriteMode) -> io::Result<u64> {
        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            WriteMode::Overwrite => options.write(true).truncate(true),
            WriteMode::Append => options.append(true),
        };
        let mut file = options.open(self.block_path(block)).await?;
        file.write_all(payload.as_bytes()).await?;
        file.flush().await?;
        Ok(file.metadata().await?.len())
    }

    fn forget_block(&self, path: &str, block: &Block) {
        if let Some(list) = self.blocks.lock().get_mut(path) {
            list.retain(|kept| kept.id() != block.id());
        }
    }

    /// Drops the `stale` blocks from the listing and updates the saturation
    /// flag of `target` for its new length. Returns the blocks that left the
    /// listing and whether anything changed.
    fn settle(&self, path: &str, target: &Block, stale: &[Block], len: u64) -> (Vec<Block>, bool) {
        let mut blocks = self.blocks.lock();
        let Some(list) = blocks.get_mut(path) else {
            return (Vec::new(), false);
        };

        let mut dropped = Vec::new();
        list.retain(|block| {
            let is_stale = stale.iter().any(|old| old.id() == block.id());
            if is_stale {
                dropped.push(block.clone());
            }
            !is_stale
        });

        let saturated = len >= self.block_capacity;
        let mut changed = !dropped.is_empty();
        if let Some(block) = list.iter_mut().find(|block| block.id() == target.id()) {
            if block.is_saturated() != saturated {
                block.set_saturated(saturated);
                changed = true;
            }
        }
        (dropped, changed)
    }

    /// Up to the read budget from the start of the first block.
    pub async fn read_head(&self, path: &str) -> DfsResult<String> {
        let block = self.first_or_last(path, false)?;
        let mut file = File::open(self.block_path(&block)).await?;
        let mut buf = Vec::with_capacity(self.read_budget);
        (&mut file).take(self.read_budget as u64).read_to_end(&mut buf).await?;
        Ok(encode_payload(&head_text(buf)))
    }

    /// Up to the read budget from the end of the last block.
    pub async fn read_tail(&self, path: &str) -> DfsResult<String> {
        let block = self.first_or_last(path, true)?;
        let mut file = File::open(self.block_path(&block)).await?;
        let len = file.metadata().await?.len();
        let skip = len.saturating_sub(self.read_budget as u64);
        file.seek(SeekFrom::Start(skip)).await?;
        let mut buf = Vec::with_capacity(self.read_budget);
        file.read_to_end(&mut buf).await?;
        Ok(encode_payload(&tail_text(&buf)))
    }

    fn first_or_last(&self, path: &str, last: bool) -> DfsResult<Block> {
        let blocks = self.blocks.lock();
        let list = blocks.get(path);
        let block = if last {
            list.and_then(|list| list.last())
        } else {
            list.and_then(|list| list.first())
        };
        block
            .cloned()
            .ok_or_else(|| DfsError::NoSuchFile(path.to_string()))
    }

    /// Drops the listing and deletes every backing file.
    pub async fn remove(&self, path: &str) -> DfsResult<usize> {
        let removed = self
            .blocks
            .lock()
            .remove(path)
            .ok_or_else(|| DfsError::NoSuchFile(path.to_string()))?;
        for block in &removed {
            self.delete_block_file(block).await;
        }
        self.save_journal().await?;
        Ok(removed.len())
    }

    async fn delete_block_file(&self, block: &Block) {
        match tokio::fs::remove_file(self.block_path(block)).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(%block, error = ?err, "failed to delete block file"),
        }
    }

    pub fn listing(&self, path: &str) -> Option<Vec<Block>> {
        self.blocks.lock().get(path).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn journal_path(&self) -> PathBuf {
        self.journal.path().to_path_buf()
    }

    pub async fn save_journal(&self) -> DfsResult<()> {
        self.journal.save_with(|| self.blocks.lock().clone()).await
    }
}

/// Decodes a head read, dropping a character cut short by the budget.
fn head_text(mut buf: Vec<u8>) -> String {
    if let Err(err) = std::str::from_utf8(&buf) {
        if err.error_len().is_none() {
            buf.truncate(err.valid_up_to());
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Decodes a tail read, skipping the continuation bytes of a character whose
/// start fell before the budget.
fn tail_text(buf: &[u8]) -> String {
    let cut = buf.iter().take(3).take_while(|byte| **byte & 0xC0 == 0x80).count();
    String::from_utf8_lossy(&buf[cut..]).into_owned()
}
