use crate::storage::error::StorageError;
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const BLOCK_SIZE: usize = 1024;

/// Index of a registered device within a buffer cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// Synchronous fixed-size block I/O.
///
/// Reads and writes block the caller until the device has completed them;
/// there is no asynchronous or batched path at this layer.
pub trait BlockDevice: Send + Sync {
    /// Read one block into `buf`. `buf` must be exactly `BLOCK_SIZE` bytes.
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()>;

    /// Write one block from `data`, synchronously, all the way to stable
    /// storage. `data` must be exactly `BLOCK_SIZE` bytes.
    fn write_block(&self, block: u32, data: &[u8]) -> Result<()>;

    /// Total number of blocks on the device.
    fn block_count(&self) -> u32;
}

/// File-backed block device with a geometry fixed at creation time.
///
/// Unlike a heap file, the device never grows: accessing a block past the
/// end is an error, the same as addressing past the end of a disk.
pub struct FileDevice {
    file: Mutex<File>,
    blocks: u32,
}

impl FileDevice {
    /// Create a new device file of exactly `blocks` blocks, zero-filled.
    pub fn create(path: &Path, blocks: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create device file: {:?}", path))?;

        file.set_len(blocks as u64 * BLOCK_SIZE as u64)
            .context("Failed to size device file")?;

        Ok(Self {
            file: Mutex::new(file),
            blocks,
        })
    }

    /// Open an existing device file. The block count is derived from the
    /// file length, which must be a whole number of blocks.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open device file: {:?}", path))?;

        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            bail!(
                "Device file {:?} is not a whole number of blocks ({} bytes)",
                path,
                len
            );
        }

        Ok(Self {
            file: Mutex::new(file),
            blocks: (len / BLOCK_SIZE as u64) as u32,
        })
    }

    fn check_range(&self, block: u32) -> Result<u64> {
        if block >= self.blocks {
            bail!(StorageError::BlockOutOfRange {
                block,
                total: self.blocks,
            });
        }
        Ok(block as u64 * BLOCK_SIZE as u64)
    }
}

impl BlockDevice for FileDevice {
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            bail!(
                "Buffer size must be BLOCK_SIZE ({}), got {}",
                BLOCK_SIZE,
                buf.len()
            );
        }

        let offset = self.check_range(block)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).context("Failed to seek")?;
        file.read_exact(buf).context("Failed to read block")?;

        Ok(())
    }

    fn write_block(&self, block: u32, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            bail!(
                "Data size must be BLOCK_SIZE ({}), got {}",
                BLOCK_SIZE,
                data.len()
            );
        }

        let offset = self.check_range(block)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).context("Failed to seek")?;
        file.write_all(data).context("Failed to write block")?;
        file.sync_all().context("Failed to sync")?;

        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.blocks
    }
}
