use crate::error::{BridgeError, Result};
use anyscreen_proto::{
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_BLOCKS, DEFAULT_MAX_CHUNK, DEFAULT_QUEUE_CAPACITY,
    EMPTY_BATCH_SENTINEL_LEN,
};
use serde::{Deserialize, Serialize};

/// Bridge sizing parameters that stay constant while the device exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Number of request slots in the ring.
    pub queue_capacity: usize,
    /// Largest write chunk staged into one request (also the staging buffer size).
    pub max_chunk: usize,
    /// Unit of block addresses.
    pub block_size: usize,
    /// Number of blocks held by the batch cache.
    pub max_blocks: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_chunk: DEFAULT_MAX_CHUNK,
            block_size: DEFAULT_BLOCK_SIZE,
            max_blocks: DEFAULT_MAX_BLOCKS,
        }
    }
}

impl BridgeConfig {
    pub fn new(queue_capacity: usize, max_chunk: usize, block_size: usize, max_blocks: usize) -> Self {
        Self {
            queue_capacity,
            max_chunk,
            block_size,
            max_blocks,
        }
    }

    /// Bytes requested from the daemon for one batch refill.
    pub fn batch_bytes(&self) -> usize {
        self.block_size * self.max_blocks
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(BridgeError::Config("queue_capacity must be positive".into()));
        }
        if self.block_size < EMPTY_BATCH_SENTINEL_LEN {
            return Err(BridgeError::Config(format!(
                "block_size must be at least {EMPTY_BATCH_SENTINEL_LEN}"
            )));
        }
        if self.max_chunk == 0 || self.max_chunk % self.block_size != 0 {
            return Err(BridgeError::Config(format!(
                "max_chunk {} must be a positive multiple of block_size {}",
                self.max_chunk, self.block_size
            )));
        }
        if self.max_blocks == 0 {
            return Err(BridgeError::Config("max_blocks must be positive".into()));
        }
        self.block_size
            .checked_mul(self.max_blocks)
            .ok_or_else(|| BridgeError::Config("batch size overflow".into()))?;
        Ok(())
    }
}
