//! Sharded buffer cache.
//!
//! The cache holds a fixed pool of block-sized frames and resolves a
//! `(device, block)` identity to a frame holding that block's contents,
//! loading from the device on demand. The pool is hash-sharded into
//! [`BUCKET_COUNT`] independently locked buckets so that traffic on
//! unrelated blocks never contends on a single global lock.
//!
//! Interface:
//! * [`BufferCache::acquire`] returns a [`BufferGuard`] with exclusive
//!   access to one block's payload, blocking while another user holds it.
//! * [`BufferGuard::flush`] writes the payload through to the device.
//! * Dropping the guard releases the block for the next user.
//! * [`BufferGuard::pin`] / [`BufferGuard::unpin`] protect a frame from
//!   recycling independent of any live guard.
//!
//! Only one user at a time can hold a given block, so guards should not be
//! kept longer than necessary.

use crate::storage::disk::{BlockDevice, DeviceId, BLOCK_SIZE};
use anyhow::Result;
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Number of hash shards the pool is partitioned into.
pub const BUCKET_COUNT: usize = 13;

/// Default number of frames in the pool.
pub const DEFAULT_POOL_FRAMES: usize = 30;

/// Sentinel index terminating the per-bucket frame lists.
const NIL: usize = usize::MAX;

/// Identity of one cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub dev: DeviceId,
    pub block: u32,
}

/// Frame state guarded by the mutex of the bucket the frame belongs to:
/// its identity, reference count, and list links (arena indices).
struct FrameMeta {
    ident: Option<BlockId>,
    refcnt: u32,
    prev: usize,
    next: usize,
}

/// Frame state guarded by the frame's own exclusive lock: the payload and
/// whether it reflects the device contents.
struct FrameData {
    valid: bool,
    bytes: Box<[u8; BLOCK_SIZE]>,
}

struct Frame {
    meta: UnsafeCell<FrameMeta>,
    data: Mutex<FrameData>,
}

// SAFETY: `meta` is only ever accessed while holding the mutex of the
// bucket that currently contains the frame; a migration between buckets
// holds both bucket mutexes for the duration of the relink. `data` is an
// ordinary mutex.
unsafe impl Sync for Frame {}

/// Doubly linked list of frames, most recently inserted at the head.
struct Bucket {
    head: usize,
    tail: usize,
}

/// Fixed pool of block buffers, sharded into independently locked buckets.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct BufferCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    devices: Box<[Arc<dyn BlockDevice>]>,
    buckets: Box<[Mutex<Bucket>]>,
    frames: Box<[Frame]>,
}

impl CacheInner {
    fn bucket_of(&self, id: BlockId) -> usize {
        (id.block as usize + id.dev.0 as usize) % self.buckets.len()
    }

    fn device(&self, dev: DeviceId) -> &Arc<dyn BlockDevice> {
        self.devices
            .get(dev.0 as usize)
            .expect("block device not registered with this cache")
    }

    /// SAFETY: the caller must hold the mutex of the bucket that currently
    /// contains frame `idx`, and must not let the returned borrow outlive
    /// that guard.
    #[allow(clippy::mut_from_ref)]
    unsafe fn meta(&self, idx: usize) -> &mut FrameMeta {
        &mut *self.frames[idx].meta.get()
    }

    /// Scan a locked bucket for a frame caching `id`.
    fn find(&self, bucket: &Bucket, id: BlockId) -> Option<usize> {
        let mut idx = bucket.head;
        while idx != NIL {
            let meta = unsafe { self.meta(idx) };
            if meta.ident == Some(id) {
                return Some(idx);
            }
            idx = meta.next;
        }
        None
    }

    /// Scan a locked bucket for a recyclable frame, least recently
    /// inserted first.
    fn find_free(&self, bucket: &Bucket) -> Option<usize> {
        let mut idx = bucket.tail;
        while idx != NIL {
            let meta = unsafe { self.meta(idx) };
            if meta.refcnt == 0 {
                return Some(idx);
            }
            idx = meta.prev;
        }
        None
    }

    fn unlink(&self, bucket: &mut Bucket, idx: usize) {
        let (prev, next) = {
            let meta = unsafe { self.meta(idx) };
            (meta.prev, meta.next)
        };
        if prev == NIL {
            bucket.head = next;
        } else {
            unsafe { self.meta(prev) }.next = next;
        }
        if next == NIL {
            bucket.tail = prev;
        } else {
            unsafe { self.meta(next) }.prev = prev;
        }
        let meta = unsafe { self.meta(idx) };
        meta.prev = NIL;
        meta.next = NIL;
    }

    fn push_front(&self, bucket: &mut Bucket, idx: usize) {
        let old_head = bucket.head;
        {
            let meta = unsafe { self.meta(idx) };
            meta.prev = NIL;
            meta.next = old_head;
        }
        if old_head == NIL {
            bucket.tail = idx;
        } else {
            unsafe { self.meta(old_head) }.prev = idx;
        }
        bucket.head = idx;
    }
}

impl BufferCache {
    /// Build a cache over the given devices (indexed by [`DeviceId`]) with
    /// a fixed pool of `pool_frames` frames.
    pub fn new(devices: Vec<Arc<dyn BlockDevice>>, pool_frames: usize) -> Self {
        assert!(pool_frames > 0, "buffer pool must have at least one frame");

        let frames: Box<[Frame]> = (0..pool_frames)
            .map(|_| Frame {
                meta: UnsafeCell::new(FrameMeta {
                    ident: None,
                    refcnt: 0,
                    prev: NIL,
                    next: NIL,
                }),
                data: Mutex::new(FrameData {
                    valid: false,
                    bytes: Box::new([0u8; BLOCK_SIZE]),
                }),
            })
            .collect();

        let buckets: Box<[Mutex<Bucket>]> = (0..BUCKET_COUNT)
            .map(|_| {
                Mutex::new(Bucket {
                    head: NIL,
                    tail: NIL,
                })
            })
            .collect();

        let inner = Arc::new(CacheInner {
            devices: devices.into_boxed_slice(),
            buckets,
            frames,
        });

        // Partition the pool across the buckets; frames migrate between
        // buckets later as eviction demands.
        for idx in 0..pool_frames {
            let mut bucket = inner.buckets[idx % BUCKET_COUNT].lock();
            inner.push_front(&mut bucket, idx);
        }

        Self { inner }
    }

    /// Number of frames in the pool.
    pub fn pool_frames(&self) -> usize {
        self.inner.frames.len()
    }

    /// Return a guard with exclusive access to the named block, loading it
    /// from the device if it is not already cached.
    ///
    /// Blocks while another user holds the same block. Panics if every
    /// frame in the pool is in use; that means the pool is smaller than
    /// the workload's concurrent working set, which is a sizing bug rather
    /// than a transient condition.
    pub fn acquire(&self, dev: DeviceId, block: u32) -> Result<BufferGuard<'_>> {
        let id = BlockId { dev, block };
        let inner = &*self.inner;
        let key = inner.bucket_of(id);

        {
            let mut bucket = inner.buckets[key].lock();

            if let Some(idx) = inner.find(&bucket, id) {
                unsafe { inner.meta(idx) }.refcnt += 1;
                drop(bucket);
                // Wait for the current holder outside the bucket lock so a
                // long wait never blocks other traffic through the bucket.
                let data = inner.frames[idx].data.lock();
                return self.finish(idx, id, data);
            }

            if let Some(idx) = inner.find_free(&bucket) {
                let data = self.take_over(idx, id);
                drop(bucket);
                return self.finish(idx, id, data);
            }
        }

        // The home bucket has no recyclable frame: probe the other shards
        // in index order, each under its own lock, and migrate a free
        // frame over. Source and destination locks are only nested for the
        // relink itself.
        for donor_key in 0..inner.buckets.len() {
            if donor_key == key {
                continue;
            }
            let mut donor = inner.buckets[donor_key].lock();
            if let Some(idx) = inner.find_free(&donor) {
                let mut home = inner.buckets[key].lock();

                // The home bucket was unlocked while we probed, so another
                // thread may have cached this block in the meantime. Join
                // that frame instead of inserting a duplicate identity.
                if let Some(existing) = inner.find(&home, id) {
                    unsafe { inner.meta(existing) }.refcnt += 1;
                    drop(donor);
                    drop(home);
                    let data = inner.frames[existing].data.lock();
                    return self.finish(existing, id, data);
                }

                inner.unlink(&mut donor, idx);
                let data = self.take_over(idx, id);
                inner.push_front(&mut home, idx);
                drop(donor);
                drop(home);
                debug!(
                    "migrated frame {} from bucket {} to bucket {} for block ({}, {})",
                    idx, donor_key, key, dev.0, block
                );
                return self.finish(idx, id, data);
            }
        }

        panic!(
            "buffer cache exhausted: all {} frames are in use",
            inner.frames.len()
        );
    }

    /// Claim a free frame for a new identity. The caller holds the lock of
    /// the bucket currently containing `idx`, and the frame's refcnt is 0.
    fn take_over(&self, idx: usize, id: BlockId) -> MutexGuard<'_, FrameData> {
        // refcnt == 0 means no guard exists, so this cannot contend.
        let mut data = self.inner.frames[idx]
            .data
            .try_lock()
            .expect("recycling a frame whose exclusive lock is held");
        data.valid = false;
        let meta = unsafe { self.inner.meta(idx) };
        meta.ident = Some(id);
        meta.refcnt = 1;
        data
    }

    /// Load the payload from the device if needed and wrap it in a guard.
    fn finish<'a>(
        &'a self,
        idx: usize,
        id: BlockId,
        data: MutexGuard<'a, FrameData>,
    ) -> Result<BufferGuard<'a>> {
        let mut guard = BufferGuard {
            cache: &*self.inner,
            idx,
            id,
            data: Some(data),
        };
        let data = guard.data.as_mut().unwrap();
        if !data.valid {
            guard
                .cache
                .device(id.dev)
                .read_block(id.block, &mut data.bytes[..])?;
            data.valid = true;
        }
        Ok(guard)
    }

    #[cfg(test)]
    fn refcnt(&self, dev: DeviceId, block: u32) -> Option<u32> {
        let id = BlockId { dev, block };
        let bucket = self.inner.buckets[self.inner.bucket_of(id)].lock();
        self.inner
            .find(&bucket, id)
            .map(|idx| unsafe { self.inner.meta(idx) }.refcnt)
    }

    #[cfg(test)]
    fn cached_entries(&self, dev: DeviceId, block: u32) -> usize {
        let id = BlockId { dev, block };
        let mut count = 0;
        for bucket in self.inner.buckets.iter() {
            let bucket = bucket.lock();
            let mut idx = bucket.head;
            while idx != NIL {
                let meta = unsafe { self.inner.meta(idx) };
                if meta.ident == Some(id) {
                    count += 1;
                }
                idx = meta.next;
            }
        }
        count
    }
}

/// Exclusive access to one cached block.
///
/// The guard is the proof of lock ownership: payload access and
/// write-through both go through it, and dropping it releases the block
/// for the next user.
pub struct BufferGuard<'a> {
    cache: &'a CacheInner,
    idx: usize,
    id: BlockId,
    data: Option<MutexGuard<'a, FrameData>>,
}

impl BufferGuard<'_> {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.id.dev
    }

    pub fn block(&self) -> u32 {
        self.id.block
    }

    /// Synchronously write the payload through to the device.
    pub fn flush(&self) -> Result<()> {
        let data = self.data.as_ref().unwrap();
        self.cache
            .device(self.id.dev)
            .write_block(self.id.block, &data.bytes[..])
    }

    /// Raise the reference count without touching the exclusive lock,
    /// protecting the frame from recycling after this guard is dropped.
    pub fn pin(&self) {
        let _bucket = self.cache.buckets[self.cache.bucket_of(self.id)].lock();
        unsafe { self.cache.meta(self.idx) }.refcnt += 1;
    }

    /// Drop a reference taken with [`BufferGuard::pin`].
    ///
    /// Panics if there is no pin to drop; an unbalanced unpin is a caller
    /// protocol bug.
    pub fn unpin(&self) {
        let _bucket = self.cache.buckets[self.cache.bucket_of(self.id)].lock();
        let meta = unsafe { self.cache.meta(self.idx) };
        assert!(meta.refcnt > 1, "unpin without matching pin");
        meta.refcnt -= 1;
    }
}

impl Deref for BufferGuard<'_> {
    type Target = [u8; BLOCK_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data.as_ref().unwrap().bytes
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data.as_mut().unwrap().bytes
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        // Release the exclusive lock first; only then update bucket state.
        self.data.take();
        let _bucket = self.cache.buckets[self.cache.bucket_of(self.id)].lock();
        let meta = unsafe { self.cache.meta(self.idx) };
        debug_assert_eq!(meta.ident, Some(self.id));
        assert!(meta.refcnt > 0, "release without matching acquire");
        meta.refcnt -= 1;
    }
}
