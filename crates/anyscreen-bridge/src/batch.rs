//! Read-ahead cache for the preload output region.

use crate::error::{BridgeError, Result};
use crate::metrics;
use anyscreen_proto::{is_empty_batch_sentinel, Acknowledgement, PacketType};
use std::cmp;
use tracing::debug;

/// Why the cache stopped being valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidateReason {
    /// Preload mode was (re)entered.
    Preload,
    /// A read crossed between the two output blocks.
    ImplicitAck,
    /// A write at/after the in-block carried the ACK flag.
    Ack,
    /// A write at/after the in-block carried NACK.
    Nack,
    /// The block served from the cache started with the empty-batch sentinel.
    EmptyBatch,
}

impl InvalidateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidateReason::Preload => "preload",
            InvalidateReason::ImplicitAck => "implicit_ack",
            InvalidateReason::Ack => "ack",
            InvalidateReason::Nack => "nack",
            InvalidateReason::EmptyBatch => "empty_batch",
        }
    }
}

impl From<Acknowledgement> for InvalidateReason {
    fn from(ack: Acknowledgement) -> Self {
        match ack {
            Acknowledgement::Ack => InvalidateReason::Ack,
            Acknowledgement::Nack => InvalidateReason::Nack,
        }
    }
}

/// Boundaries programmed by the daemon that decide which accesses touch the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreloadWindow {
    pub in_block: usize,
    pub out_block1: usize,
    pub out_block2: usize,
    pub current_out_block: usize,
    pub preload: bool,
    pub implicit_ack: bool,
}

/// Multi-block cache filled by one oversized read request.
#[derive(Debug)]
pub struct BatchCache {
    window: PreloadWindow,
    storage: Option<Vec<u8>>,
    block_size: usize,
    max_blocks: usize,
    batch_size: usize,
    valid: bool,
    block_pointer: usize,
}

impl BatchCache {
    pub fn new(block_size: usize, max_blocks: usize) -> Self {
        Self {
            window: PreloadWindow::default(),
            storage: Some(vec![0u8; block_size * max_blocks]),
            block_size,
            max_blocks,
            batch_size: max_blocks,
            valid: false,
            block_pointer: 0,
        }
    }

    pub fn window(&self) -> PreloadWindow {
        self.window
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn block_pointer(&self) -> usize {
        self.block_pointer
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn set_in_block(&mut self, address: usize) {
        debug!(in_block = address, "set in-block boundary");
        self.window.in_block = address;
    }

    pub fn set_out_block1(&mut self, address: usize) {
        debug!(out_block1 = address, "set first output boundary");
        self.window.out_block1 = address;
    }

    pub fn set_out_block2(&mut self, address: usize) {
        debug!(out_block2 = address, "set second output boundary");
        self.window.out_block2 = address;
    }

    pub fn enable_implicit_ack(&mut self) {
        debug!("implicit ack enabled");
        self.window.implicit_ack = true;
    }

    pub fn enter_preload(&mut self) {
        self.invalidate(InvalidateReason::Preload);
        self.window.preload = true;
        self.window.current_out_block = self.window.out_block1;
        debug!(out_block = self.window.current_out_block, "starting preload mode");
    }

    /// Set the block-count divisor used when walking the cache.
    pub fn set_batch_size(&mut self, blocks: usize) -> Result<()> {
        if blocks == 0 || blocks > self.max_blocks {
            return Err(BridgeError::InvalidBatchSize {
                requested: blocks,
                max: self.max_blocks,
            });
        }
        debug!(blocks, "set batch size");
        self.batch_size = blocks;
        Ok(())
    }

    /// Whether a read at `address` is served from the cache.
    pub fn serves(&self, address: usize) -> bool {
        self.window.preload && address >= self.window.out_block1
    }

    /// Apply the implicit-ACK rule for a read at `address`.
    pub fn observe_read(&mut self, address: usize) -> bool {
        let window = &mut self.window;
        if !window.implicit_ack {
            return false;
        }
        let crossed_up = address >= window.out_block2 && window.current_out_block == window.out_block1;
        let crossed_down = address < window.out_block2 && window.current_out_block == window.out_block2;
        if !(crossed_up || crossed_down) {
            return false;
        }
        window.current_out_block = if window.current_out_block == window.out_block1 {
            window.out_block2
        } else {
            window.out_block1
        };
        debug!(address, out_block = window.current_out_block, "implicit ack");
        self.invalidate(InvalidateReason::ImplicitAck);
        true
    }

    /// Inspect a write chunk for ACK/NACK traffic aimed at the batch producer.
    pub fn observe_write(&mut self, address: usize, chunk: &[u8]) -> Option<Acknowledgement> {
        if address < self.window.in_block {
            return None;
        }
        let byte = *chunk.first()?;
        let ack = Acknowledgement::from_packet_byte(byte)?;
        debug!(
            address,
            ack = ack.as_str(),
            packet = ?PacketType::try_from(byte).ok(),
            "acknowledgement in write stream"
        );
        self.invalidate(ack.into());
        Some(ack)
    }

    pub fn invalidate(&mut self, reason: InvalidateReason) {
        if self.valid {
            metrics::batch_invalidated(reason);
        }
        self.valid = false;
    }

    /// Hand out the cache storage to be filled by a refill request.
    pub fn begin_refill(&mut self) -> Vec<u8> {
        self.block_pointer = 0;
        let bytes = self.block_size * self.max_blocks;
        match self.storage.take() {
            Some(buf) if buf.len() == bytes => buf,
            _ => vec![0u8; bytes],
        }
    }

    /// Take back the storage after the daemon answered the refill request.
    pub fn finish_refill(&mut self, buf: Vec<u8>) {
        self.storage = Some(buf);
        self.valid = true;
        metrics::batch_refilled();
    }

    /// Copy `out.len()` bytes from the cache at the block cursor.
    ///
    /// Returns `true` when the copied block carried the empty-batch sentinel, in
    /// which case the cache is invalidated and the cursor rewound.
    pub fn copy_out(&mut self, out: &mut [u8]) -> bool {
        let start = (self.block_pointer % self.batch_size) * self.block_size;
        self.block_pointer += out.len() / self.block_size;
        let storage = self.storage.as_deref().unwrap_or_default();
        let end = cmp::min(start + out.len(), storage.len());
        let available = end.saturating_sub(start);
        if available > 0 {
            out[..available].copy_from_slice(&storage[start..end]);
        }
        out[available..].fill(0);

        if is_empty_batch_sentinel(out) {
            debug!(
                block_pointer = self.block_pointer,
                "empty batch sentinel, refilling on next read"
            );
            self.block_pointer = 0;
            self.invalidate(InvalidateReason::EmptyBatch);
            return true;
        }
        false
    }
}
