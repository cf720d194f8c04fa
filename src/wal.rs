//! Write-ahead redo logging.
//!
//! This module gives the storage layer crash-consistent multi-block
//! transactions:
//! - the on-disk log header and its codec
//! - operation admission and group commit
//! - log absorption of repeated writes to one block
//! - mount-time crash recovery
//!
//! A transaction is the set of block writes made by all concurrently
//! outstanding operations; it reaches the device atomically or not at all.

pub mod header;
pub mod manager;

pub use header::{LogHeader, LOG_CAPACITY};
pub use manager::{Operation, WalConfig, WalManager};
