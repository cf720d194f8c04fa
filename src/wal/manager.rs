//! Redo-log manager.
//!
//! One log transaction contains the block writes of every operation that
//! was outstanding between two quiescent points. The log only commits when
//! no operation is active, so there is never any reasoning about whether a
//! commit might push half of an operation's writes to disk.
//!
//! Callers bracket each mutating operation with [`WalManager::begin`] and
//! the returned [`Operation`] handle. Usually `begin` just raises the
//! outstanding count, but when the log is close to running out of space,
//! or a commit is in flight, it parks the caller until the situation
//! clears.
//!
//! The on-disk format is a physical redo log: a header block listing home
//! block numbers, followed by one staged copy of each listed block. All
//! log appends are synchronous.

use super::header::{LogHeader, LOG_CAPACITY};
use crate::storage::buffer::{BufferCache, BufferGuard};
use crate::storage::disk::DeviceId;
use crate::storage::superblock::Superblock;
use anyhow::{bail, Result};
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

/// Tuning knobs for the redo log.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Upper bound on the blocks a single operation may log, used to
    /// reserve log space at admission time.
    pub max_op_blocks: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig { max_op_blocks: 10 }
    }
}

/// Bookkeeping guarded by the short state lock.
struct LogState {
    /// Operations currently inside a begin/end bracket.
    outstanding: u32,
    /// A commit is flushing; admission waits until it finishes.
    committing: bool,
    /// In-memory mirror of the on-disk header.
    header: LogHeader,
}

/// Group-committing redo log over a [`BufferCache`].
///
/// Constructed once at mount time; construction runs crash recovery
/// before any operation can be admitted.
pub struct WalManager {
    cache: BufferCache,
    dev: DeviceId,
    /// First block of the log region (the header block).
    start: u32,
    /// Log region length in blocks, header included.
    log_blocks: u32,
    max_op_blocks: usize,
    state: Mutex<LogState>,
    ops: Condvar,
}

impl WalManager {
    pub fn new(
        cache: BufferCache,
        dev: DeviceId,
        superblock: &Superblock,
        config: WalConfig,
    ) -> Result<Self> {
        let wal = Self {
            cache,
            dev,
            start: superblock.log_start,
            log_blocks: superblock.log_blocks,
            max_op_blocks: config.max_op_blocks,
            state: Mutex::new(LogState {
                outstanding: 0,
                committing: false,
                header: LogHeader::new(),
            }),
            ops: Condvar::new(),
        };

        if wal.max_op_blocks == 0 || wal.max_op_blocks > wal.capacity() {
            bail!(
                "max_op_blocks {} does not fit a log with capacity {}",
                wal.max_op_blocks,
                wal.capacity()
            );
        }

        wal.recover()?;
        Ok(wal)
    }

    /// Blocks a single transaction may occupy, bounded by both the header
    /// encoding and the staging slots the region actually has.
    fn capacity(&self) -> usize {
        (self.log_blocks as usize - 1).min(LOG_CAPACITY)
    }

    /// Block number of the i-th staging slot.
    fn slot(&self, i: usize) -> u32 {
        self.start + 1 + i as u32
    }

    /// Open the bracket for one mutating operation, parking the caller
    /// while a commit is in flight or while admitting it could overflow
    /// the log in the worst case.
    pub fn begin(&self) -> Operation<'_> {
        let mut st = self.state.lock();
        loop {
            if st.committing {
                self.ops.wait(&mut st);
            } else if st.header.len() + (st.outstanding as usize + 1) * self.max_op_blocks
                > self.capacity()
            {
                // This operation might exhaust the log; wait for a commit
                // to drain it.
                self.ops.wait(&mut st);
            } else {
                st.outstanding += 1;
                break;
            }
        }
        drop(st);
        Operation {
            wal: self,
            ended: false,
        }
    }

    /// Close the bracket; commits if this was the last outstanding
    /// operation.
    fn end_op(&self) -> Result<()> {
        let do_commit = {
            let mut st = self.state.lock();
            assert!(st.outstanding > 0, "operation ended twice");
            assert!(!st.committing, "commit started with operations in flight");
            st.outstanding -= 1;
            if st.outstanding == 0 {
                st.committing = true;
                true
            } else {
                // Ending this operation released reserved log space; an
                // admission waiter may now fit.
                self.ops.notify_all();
                false
            }
        };

        if do_commit {
            // Run the commit outside the state lock; it performs device
            // I/O and must not hold any short lock across it.
            let result = self.commit();
            let mut st = self.state.lock();
            st.committing = false;
            self.ops.notify_all();
            drop(st);
            result?;
        }
        Ok(())
    }

    /// Record a mutated buffer in the active transaction and keep it
    /// cached until commit installs it.
    fn log_write(&self, buf: &BufferGuard<'_>) {
        assert_eq!(
            buf.device(),
            self.dev,
            "buffer from a device this log does not cover"
        );

        let mut st = self.state.lock();
        assert!(st.outstanding > 0, "log write outside of an operation");
        assert!(
            st.header.len() < self.capacity(),
            "transaction too large for the log"
        );
        if st.header.absorb(buf.block()) {
            // Newly listed: pin the frame so the cache cannot recycle it
            // before commit copies the payload out.
            buf.pin();
        }
    }

    /// Flush the whole transaction. Runs only when no operation is
    /// outstanding, so the header cannot change underneath it.
    fn commit(&self) -> Result<()> {
        let header = self.state.lock().header.clone();
        if header.is_empty() {
            return Ok(());
        }

        debug!("committing {} blocks", header.len());
        self.write_slots(&header)?;
        // The header write is the durability point: before it the
        // transaction never happened, after it replay is guaranteed.
        self.write_head(&header)?;
        self.install(&header, false)?;
        self.state.lock().header.clear();
        self.write_head(&LogHeader::new())?;
        Ok(())
    }

    /// Stage every listed block's cached payload into its log slot.
    fn write_slots(&self, header: &LogHeader) -> Result<()> {
        for (i, &home) in header.blocks().iter().enumerate() {
            let from = self.cache.acquire(self.dev, home)?;
            let mut to = self.cache.acquire(self.dev, self.slot(i))?;
            to.copy_from_slice(&from[..]);
            to.flush()?;
        }
        Ok(())
    }

    /// Write the in-memory header to the on-disk header block.
    fn write_head(&self, header: &LogHeader) -> Result<()> {
        let mut buf = self.cache.acquire(self.dev, self.start)?;
        header.encode(&mut buf);
        buf.flush()?;
        Ok(())
    }

    /// Copy staged blocks from their log slots to their home locations.
    fn install(&self, header: &LogHeader, recovering: bool) -> Result<()> {
        for (i, &home) in header.blocks().iter().enumerate() {
            let from = self.cache.acquire(self.dev, self.slot(i))?;
            let mut to = self.cache.acquire(self.dev, home)?;
            to.copy_from_slice(&from[..]);
            to.flush()?;
            if !recovering {
                // Balance the pin taken at log_write time. At mount there
                // are no live users and nothing was pinned.
                to.unpin();
            }
        }
        Ok(())
    }

    fn read_head(&self) -> Result<LogHeader> {
        let buf = self.cache.acquire(self.dev, self.start)?;
        Ok(LogHeader::decode(&buf, self.capacity())?)
    }

    /// Replay a committed-but-not-installed transaction, then erase it.
    /// Runs before the first operation is admitted.
    fn recover(&self) -> Result<()> {
        let header = self.read_head()?;
        if !header.is_empty() {
            info!("recovering {} committed blocks", header.len());
        }
        self.install(&header, true)?;
        self.write_head(&LogHeader::new())?;
        Ok(())
    }

    #[cfg(test)]
    fn logged_blocks(&self) -> Vec<u32> {
        self.state.lock().header.blocks().to_vec()
    }

    #[cfg(test)]
    fn outstanding(&self) -> u32 {
        self.state.lock().outstanding
    }
}

/// Bracket around one mutating operation.
///
/// Dropping the handle closes the bracket; [`Operation::end`] does the
/// same while surfacing a commit failure to the caller.
pub struct Operation<'a> {
    wal: &'a WalManager,
    ended: bool,
}

impl Operation<'_> {
    /// Record a mutated buffer in the transaction. Call after changing the
    /// payload and before dropping the guard; the commit does the actual
    /// device write.
    pub fn write(&self, buf: &BufferGuard<'_>) {
        self.wal.log_write(buf);
    }

    /// Close the bracket, committing if this was the last outstanding
    /// operation, and report how that commit went.
    pub fn end(mut self) -> Result<()> {
        self.ended = true;
        self.wal.end_op()
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        if !self.ended {
            if let Err(e) = self.wal.end_op() {
                error!("commit failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::{BlockDevice, FileDevice, BLOCK_SIZE};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const DEV: DeviceId = DeviceId(0);

    struct Harness {
        _dir: TempDir,
        device: Arc<FileDevice>,
        superblock: Superblock,
        cache: BufferCache,
        wal: Arc<WalManager>,
    }

    fn setup(total: u32, log_blocks: u32, pool: usize, max_op_blocks: usize) -> Result<Harness> {
        let dir = tempdir()?;
        let device = Arc::new(FileDevice::create(&dir.path().join("test.img"), total)?);
        let superblock = Superblock::for_geometry(total, log_blocks)?;
        superblock.write(&*device)?;

        let cache = BufferCache::new(vec![device.clone()], pool);
        let wal = Arc::new(WalManager::new(
            cache.clone(),
            DEV,
            &superblock,
            WalConfig { max_op_blocks },
        )?);

        Ok(Harness {
            _dir: dir,
            device,
            superblock,
            cache,
            wal,
        })
    }

    fn read_raw(device: &FileDevice, block: u32) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(block, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_commit_installs_home_blocks() -> Result<()> {
        let h = setup(64, 10, 16, 4)?;
        let home = h.superblock.data_start;

        let op = h.wal.begin();
        {
            let mut guard = h.cache.acquire(DEV, home)?;
            guard[0] = 0xab;
            guard[1] = 0xcd;
            op.write(&guard);
        }
        // Nothing reaches the device until the bracket closes.
        assert_eq!(read_raw(&h.device, home)[0], 0);
        op.end()?;

        let raw = read_raw(&h.device, home);
        assert_eq!(raw[0], 0xab);
        assert_eq!(raw[1], 0xcd);

        // The transaction record is erased after install.
        let head = LogHeader::decode(&read_raw(&h.device, h.superblock.log_start), LOG_CAPACITY)?;
        assert!(head.is_empty());
        assert_eq!(h.wal.outstanding(), 0);

        Ok(())
    }

    #[test]
    fn test_absorption_collapses_repeated_writes() -> Result<()> {
        let h = setup(64, 10, 16, 8)?;
        let d = |n: u32| h.superblock.data_start + n;

        let op = h.wal.begin();
        {
            let mut guard = h.cache.acquire(DEV, d(5))?;
            guard.fill(0x11);
            op.write(&guard);
        }
        {
            let mut guard = h.cache.acquire(DEV, d(9))?;
            guard.fill(0x22);
            op.write(&guard);
        }
        {
            // Second write to the same block: absorbed, latest payload wins.
            let mut guard = h.cache.acquire(DEV, d(5))?;
            guard.fill(0x33);
            op.write(&guard);
        }
        {
            let mut guard = h.cache.acquire(DEV, d(12))?;
            guard.fill(0x44);
            op.write(&guard);
        }

        assert_eq!(h.wal.logged_blocks(), vec![d(5), d(9), d(12)]);
        op.end()?;

        assert!(read_raw(&h.device, d(5)).iter().all(|&b| b == 0x33));
        assert!(read_raw(&h.device, d(9)).iter().all(|&b| b == 0x22));
        assert!(read_raw(&h.device, d(12)).iter().all(|&b| b == 0x44));

        Ok(())
    }

    #[test]
    fn test_commit_only_after_last_outstanding_op() -> Result<()> {
        let h = setup(64, 10, 16, 4)?;
        let home = h.superblock.data_start + 1;

        let op_a = h.wal.begin();
        let op_b = h.wal.begin();

        {
            let mut guard = h.cache.acquire(DEV, home)?;
            guard[0] = 7;
            op_a.write(&guard);
        }
        op_a.end()?;

        // One operation is still open, so the group has not committed.
        assert_eq!(read_raw(&h.device, home)[0], 0);
        assert_eq!(h.wal.outstanding(), 1);

        op_b.end()?;
        assert_eq!(read_raw(&h.device, home)[0], 7);

        Ok(())
    }

    #[test]
    fn test_empty_operation_commits_nothing() -> Result<()> {
        let h = setup(64, 10, 16, 4)?;

        let op = h.wal.begin();
        op.end()?;

        assert_eq!(h.wal.outstanding(), 0);
        assert!(h.wal.logged_blocks().is_empty());

        // The log is still usable afterwards.
        let op = h.wal.begin();
        {
            let mut guard = h.cache.acquire(DEV, h.superblock.data_start)?;
            guard[0] = 1;
            op.write(&guard);
        }
        op.end()?;
        assert_eq!(read_raw(&h.device, h.superblock.data_start)[0], 1);

        Ok(())
    }

    #[test]
    fn test_recovery_replays_committed_header() -> Result<()> {
        let dir = tempdir()?;
        let device = Arc::new(FileDevice::create(&dir.path().join("test.img"), 64)?);
        let superblock = Superblock::for_geometry(64, 10)?;
        superblock.write(&*device)?;

        let home_a = superblock.data_start;
        let home_b = superblock.data_start + 3;

        // Crash image: staged payloads and a written header, but the
        // install never ran.
        let mut staged = [0u8; BLOCK_SIZE];
        staged.fill(0x5a);
        device.write_block(superblock.log_start + 1, &staged)?;
        staged.fill(0x6b);
        device.write_block(superblock.log_start + 2, &staged)?;

        let mut header = LogHeader::new();
        header.absorb(home_a);
        header.absorb(home_b);
        let mut head_block = [0u8; BLOCK_SIZE];
        header.encode(&mut head_block);
        device.write_block(superblock.log_start, &head_block)?;

        // Mounting replays the transaction.
        let cache = BufferCache::new(vec![device.clone()], 16);
        let _wal = WalManager::new(cache, DEV, &superblock, WalConfig::default())?;

        assert!(read_raw(&device, home_a).iter().all(|&b| b == 0x5a));
        assert!(read_raw(&device, home_b).iter().all(|&b| b == 0x6b));
        let head = LogHeader::decode(&read_raw(&device, superblock.log_start), LOG_CAPACITY)?;
        assert!(head.is_empty());

        Ok(())
    }

    #[test]
    fn test_recovery_discards_unheadered_writes() -> Result<()> {
        let dir = tempdir()?;
        let device = Arc::new(FileDevice::create(&dir.path().join("test.img"), 64)?);
        let superblock = Superblock::for_geometry(64, 10)?;
        superblock.write(&*device)?;

        let home = superblock.data_start;
        let mut original = [0u8; BLOCK_SIZE];
        original.fill(0x77);
        device.write_block(home, &original)?;

        // Crash image: payload staged into a log slot, but the crash hit
        // before the header write. The transaction never happened.
        let mut staged = [0u8; BLOCK_SIZE];
        staged.fill(0x99);
        device.write_block(superblock.log_start + 1, &staged)?;

        let cache = BufferCache::new(vec![device.clone()], 16);
        let _wal = WalManager::new(cache, DEV, &superblock, WalConfig::default())?;

        assert!(read_raw(&device, home).iter().all(|&b| b == 0x77));

        Ok(())
    }

    #[test]
    fn test_begin_blocks_under_capacity_pressure() -> Result<()> {
        // Capacity 6, reservations of 3: two open operations use up the
        // worst-case reservation and a third must wait for the commit.
        let h = setup(64, 7, 16, 3)?;

        let op1 = h.wal.begin();
        let op2 = h.wal.begin();
        {
            let mut guard = h.cache.acquire(DEV, h.superblock.data_start)?;
            guard[0] = 1;
            op1.write(&guard);
        }

        let (admitted_tx, admitted_rx) = mpsc::channel();
        let waiter = {
            let wal = h.wal.clone();
            thread::spawn(move || {
                let op3 = wal.begin();
                admitted_tx.send(()).unwrap();
                op3.end().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(
            admitted_rx.try_recv().is_err(),
            "operation admitted past the reservation limit"
        );

        op1.end()?;
        op2.end()?;
        admitted_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("waiter was never admitted after the commit");
        waiter.join().unwrap();

        Ok(())
    }

    #[test]
    #[should_panic(expected = "transaction too large")]
    fn test_oversized_transaction_panics() {
        // Capacity 4; a single operation logging a fifth distinct block is
        // a protocol violation, not something to truncate quietly.
        let h = setup(64, 5, 16, 4).unwrap();

        let op = h.wal.begin();
        for n in 0..5u32 {
            let mut guard = h.cache.acquire(DEV, h.superblock.data_start + n).unwrap();
            guard[0] = n as u8;
            op.write(&guard);
        }
    }

    #[test]
    fn test_rejects_unusable_reservation() -> Result<()> {
        let dir = tempdir()?;
        let device = Arc::new(FileDevice::create(&dir.path().join("test.img"), 64)?);
        let superblock = Superblock::for_geometry(64, 5)?;
        superblock.write(&*device)?;
        let cache = BufferCache::new(vec![device], 8);

        // Reservation larger than the whole log: no operation could ever
        // be admitted.
        let result = WalManager::new(cache, DEV, &superblock, WalConfig { max_op_blocks: 10 });
        assert!(result.is_err());

        Ok(())
    }

    #[test]
    fn test_concurrent_operations_commit_everything() -> Result<()> {
        let h = setup(128, 30, 32, 4)?;
        let threads = 4u32;
        let ops_per_thread = 8u32;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let wal = h.wal.clone();
                let cache = h.cache.clone();
                let data_start = h.superblock.data_start;
                thread::spawn(move || {
                    for j in 0..ops_per_thread {
                        let block = data_start + t * ops_per_thread + j;
                        let op = wal.begin();
                        {
                            let mut guard = cache.acquire(DEV, block).unwrap();
                            guard.fill((t * ops_per_thread + j) as u8 + 1);
                            op.write(&guard);
                        }
                        op.end().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(h.wal.outstanding(), 0);
        assert!(h.wal.logged_blocks().is_empty());

        for n in 0..threads * ops_per_thread {
            let raw = read_raw(&h.device, h.superblock.data_start + n);
            assert!(raw.iter().all(|&b| b == n as u8 + 1), "block {} lost", n);
        }

        Ok(())
    }
}
