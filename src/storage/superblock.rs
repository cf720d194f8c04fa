//! On-disk superblock.
//!
//! Block 0 of a volume is reserved; block 1 holds the superblock, which
//! describes the geometry every other subsystem is sized from: where the
//! redo-log region starts, how many blocks it spans, and where the data
//! region begins. It is read exactly once, at mount time.

use crate::storage::disk::{BlockDevice, BLOCK_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use byteorder::{ByteOrder, LittleEndian};

/// Identifies a blocklog volume.
pub const SUPERBLOCK_MAGIC: u32 = 0x626c_6f67;

/// Block number the superblock lives at.
pub const SUPERBLOCK_BLOCK: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    /// Total size of the volume in blocks.
    pub total_blocks: u32,
    /// First block of the log region (the header block).
    pub log_start: u32,
    /// Length of the log region in blocks, header included.
    pub log_blocks: u32,
    /// First block of the data region.
    pub data_start: u32,
}

impl Superblock {
    /// Lay out a fresh volume: boot block, superblock, log region, data.
    pub fn for_geometry(total_blocks: u32, log_blocks: u32) -> StorageResult<Self> {
        let sb = Superblock {
            magic: SUPERBLOCK_MAGIC,
            total_blocks,
            log_start: SUPERBLOCK_BLOCK + 1,
            log_blocks,
            data_start: SUPERBLOCK_BLOCK + 1 + log_blocks,
        };
        sb.validate()?;
        Ok(sb)
    }

    fn validate(&self) -> StorageResult<()> {
        if self.magic != SUPERBLOCK_MAGIC {
            return Err(StorageError::BadMagic {
                expected: SUPERBLOCK_MAGIC,
                found: self.magic,
            });
        }
        if self.log_blocks < 2 {
            return Err(StorageError::BadGeometry(format!(
                "log region of {} blocks cannot hold a header and data",
                self.log_blocks
            )));
        }
        if self.log_start <= SUPERBLOCK_BLOCK {
            return Err(StorageError::BadGeometry(format!(
                "log region at block {} overlaps the superblock",
                self.log_start
            )));
        }
        if self.data_start != self.log_start + self.log_blocks {
            return Err(StorageError::BadGeometry(format!(
                "data region at block {} does not follow the log region",
                self.data_start
            )));
        }
        if self.data_start >= self.total_blocks {
            return Err(StorageError::BadGeometry(format!(
                "no data blocks: data region starts at {} of {}",
                self.data_start, self.total_blocks
            )));
        }
        Ok(())
    }

    /// Number of blocks in the data region.
    pub fn data_blocks(&self) -> u32 {
        self.total_blocks - self.data_start
    }

    pub fn encode(&self, buf: &mut [u8; BLOCK_SIZE]) {
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.total_blocks);
        LittleEndian::write_u32(&mut buf[8..12], self.log_start);
        LittleEndian::write_u32(&mut buf[12..16], self.log_blocks);
        LittleEndian::write_u32(&mut buf[16..20], self.data_start);
    }

    pub fn decode(buf: &[u8; BLOCK_SIZE]) -> StorageResult<Self> {
        let sb = Superblock {
            magic: LittleEndian::read_u32(&buf[0..4]),
            total_blocks: LittleEndian::read_u32(&buf[4..8]),
            log_start: LittleEndian::read_u32(&buf[8..12]),
            log_blocks: LittleEndian::read_u32(&buf[12..16]),
            data_start: LittleEndian::read_u32(&buf[16..20]),
        };
        sb.validate()?;
        Ok(sb)
    }

    /// Read and validate the superblock of a mounted device.
    pub fn read(device: &dyn BlockDevice) -> anyhow::Result<Self> {
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(SUPERBLOCK_BLOCK, &mut buf)?;
        Ok(Self::decode(&buf)?)
    }

    /// Write the superblock to its fixed location.
    pub fn write(&self, device: &dyn BlockDevice) -> anyhow::Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.encode(&mut buf);
        device.write_block(SUPERBLOCK_BLOCK, &buf)?;
        Ok(())
    }
}
