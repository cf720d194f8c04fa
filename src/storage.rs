//! Storage layer for blocklog.
//!
//! This module provides the block-level foundation the logging layer is
//! built on. Key components:
//!
//! - **BlockDevice**: synchronous fixed-size (1KB) block I/O, with a
//!   file-backed implementation for disk images
//! - **Superblock**: on-disk volume geometry, read once at mount
//! - **BufferCache**: fixed pool of in-memory block copies, hash-sharded
//!   into independently locked buckets, with per-block exclusive access
//!
//! Durability across crashes is the redo log's job (see [`crate::wal`]);
//! this layer only promises that a flushed block is on stable storage
//! before the call returns.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod superblock;

pub use buffer::{BlockId, BufferCache, BufferGuard, BUCKET_COUNT, DEFAULT_POOL_FRAMES};
pub use disk::{BlockDevice, DeviceId, FileDevice, BLOCK_SIZE};
pub use error::{StorageError, StorageResult};
pub use superblock::{Superblock, SUPERBLOCK_BLOCK, SUPERBLOCK_MAGIC};
