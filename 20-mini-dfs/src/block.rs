use std::fmt;

use serde::{Deserialize, Serialize};

pub const BLOCK_PREFIX: &str = "blk_";

/// A fixed-identity chunk of file content.
///
/// Ids are random 63-bit values so they stay positive in any signed
/// representation. Once `saturated` is set the block takes no further writes
/// and the owning file grows a new block instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    id: u64,
    saturated: bool,
}

impl Block {
    pub fn allocate() -> Self {
        Self::with_id(rand::random::<u64>() >> 1)
    }

    pub fn with_id(id: u64) -> Self {
        Self {
            id,
            saturated: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn file_name(&self) -> String {
        format!("{BLOCK_PREFIX}{}", self.id)
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    pub fn set_saturated(&mut self, saturated: bool) {
        self.saturated = saturated;
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BLOCK_PREFIX}{}", self.id)
    }
}
