//! Volume: the mount-time context object.
//!
//! A [`Volume`] owns the block device, the buffer cache, and the redo log
//! for one mounted disk image, and is handed to the layers above instead
//! of living in global state. Construction runs crash recovery, so by the
//! time `create`, `open`, or `mount` returns, the volume is consistent
//! and ready to admit operations.

use crate::storage::buffer::{BufferCache, DEFAULT_POOL_FRAMES};
use crate::storage::disk::{BlockDevice, DeviceId, FileDevice};
use crate::storage::superblock::Superblock;
use crate::wal::{Operation, WalConfig, WalManager};
use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;

/// Sizing for a volume and its in-memory state.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Total size of the volume in blocks.
    pub total_blocks: u32,
    /// Length of the log region in blocks, header included.
    pub log_blocks: u32,
    /// Frames in the buffer pool.
    pub pool_frames: usize,
    /// Per-operation log reservation.
    pub max_op_blocks: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            total_blocks: 1024,
            log_blocks: 30,
            pool_frames: DEFAULT_POOL_FRAMES,
            max_op_blocks: 10,
        }
    }
}

/// One mounted volume: device, cache, and log.
pub struct Volume {
    superblock: Superblock,
    cache: BufferCache,
    wal: WalManager,
}

impl Volume {
    /// Create and mount a fresh volume at `path`.
    pub fn create(path: &Path, config: VolumeConfig) -> Result<Self> {
        if path.exists() {
            bail!("Volume file already exists at {:?}", path);
        }

        let device = Arc::new(FileDevice::create(path, config.total_blocks)?);
        let superblock = Superblock::for_geometry(config.total_blocks, config.log_blocks)?;
        superblock.write(&*device)?;
        // A fresh device reads as zeroes, which is already an empty log
        // header; nothing else needs initializing.

        Self::mount(device, config)
    }

    /// Mount an existing volume file.
    pub fn open(path: &Path, config: VolumeConfig) -> Result<Self> {
        if !path.exists() {
            bail!("Volume file does not exist at {:?}", path);
        }

        let device = Arc::new(FileDevice::open(path)?);
        Self::mount(device, config)
    }

    /// Mount a device: read the superblock, build the cache, and bring up
    /// the log (which replays any committed transaction).
    pub fn mount(device: Arc<dyn BlockDevice>, config: VolumeConfig) -> Result<Self> {
        let superblock = Superblock::read(&*device)?;

        let cache = BufferCache::new(vec![device], config.pool_frames);
        let wal = WalManager::new(
            cache.clone(),
            DeviceId(0),
            &superblock,
            WalConfig {
                max_op_blocks: config.max_op_blocks,
            },
        )?;

        Ok(Self {
            superblock,
            cache,
            wal,
        })
    }

    /// The device id blocks of this volume are addressed with.
    pub fn device_id(&self) -> DeviceId {
        DeviceId(0)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    /// Open the begin/end bracket for one mutating operation.
    pub fn begin(&self) -> Operation<'_> {
        self.wal.begin()
    }
}
