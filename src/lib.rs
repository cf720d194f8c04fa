//! blocklog: crash-consistent, concurrent block storage.
//!
//! The crate pairs a sharded buffer cache with a write-ahead redo log, the
//! two subsystems a file system needs between itself and a raw block
//! device. A mutating operation brackets itself with [`Volume::begin`],
//! acquires buffers from the cache, mutates them in place, records each
//! write with [`wal::Operation::write`], and closes the bracket; the last
//! operation out commits every write atomically. A crash either replays
//! the whole transaction at the next mount or discards it entirely.
//!
//! [`Volume::begin`]: volume::Volume::begin

pub mod storage;
pub mod volume;
pub mod wal;
