//! Redo-log header.
//!
//! The header is the first block of the on-disk log region and doubles as
//! the in-memory record of the open transaction: an ordered list of home
//! block numbers, one per staged log slot. Writing a non-empty header to
//! disk is what commits a transaction; writing an empty one erases it.

use crate::storage::disk::BLOCK_SIZE;
use crate::storage::error::{StorageError, StorageResult};
use byteorder::{ByteOrder, LittleEndian};

/// Most blocks a single transaction can touch, bounded by the header
/// encoding. The effective limit also depends on the log region size.
pub const LOG_CAPACITY: usize = 30;

/// Ordered list of home block numbers for the active transaction.
///
/// A block number appears at most once: a repeated write is absorbed into
/// the existing entry, since commit reads the latest payload from the
/// cache anyway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogHeader {
    blocks: Vec<u32>,
}

impl LogHeader {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Home block numbers in log-slot order.
    pub fn blocks(&self) -> &[u32] {
        &self.blocks
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Record a write to `block`. Returns true when the block was newly
    /// appended, false when an existing entry absorbed the write.
    pub fn absorb(&mut self, block: u32) -> bool {
        if self.blocks.contains(&block) {
            return false;
        }
        assert!(self.blocks.len() < LOG_CAPACITY, "log header full");
        self.blocks.push(block);
        true
    }

    /// Serialize into a header block: count, then one slot per entry,
    /// unused slots zeroed.
    pub fn encode(&self, buf: &mut [u8; BLOCK_SIZE]) {
        LittleEndian::write_i32(&mut buf[0..4], self.blocks.len() as i32);
        for i in 0..LOG_CAPACITY {
            let v = self.blocks.get(i).copied().unwrap_or(0);
            LittleEndian::write_u32(&mut buf[4 + i * 4..8 + i * 4], v);
        }
    }

    /// Deserialize a header block, rejecting counts that could not have
    /// been written by a log of the given capacity.
    pub fn decode(buf: &[u8; BLOCK_SIZE], capacity: usize) -> StorageResult<Self> {
        let count = LittleEndian::read_i32(&buf[0..4]);
        if count < 0 || count as usize > capacity {
            return Err(StorageError::CorruptLogHeader { count, capacity });
        }
        let mut blocks = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            blocks.push(LittleEndian::read_u32(&buf[4 + i * 4..8 + i * 4]));
        }
        Ok(Self { blocks })
    }
}
