//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("bad superblock magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("inconsistent volume geometry: {0}")]
    BadGeometry(String),

    #[error("block {block} out of range (device has {total} blocks)")]
    BlockOutOfRange { block: u32, total: u32 },

    #[error("corrupt log header: count {count} exceeds capacity {capacity}")]
    CorruptLogHeader { count: i32, capacity: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
