//! The block hash index: `(handle, page) -> frame`.
//!
//! A fixed array of chains, each behind its own reader/writer lock. An
//! entry stores a copy of the key next to the frame id; a mapped frame's
//! key only ever changes under the owning chain's write lock, so lookups
//! can compare keys under the read lock without touching the frame.
//!
//! The lock order is chain > file record > frame. Lookups hold the chain
//! lock in read mode and upgrade to write only on a miss, which keeps
//! cache hits off the write lock entirely.

use std::sync::{Arc, RwLock};

use super::file_index::FileIndex;
use super::frame::{BlockKey, FrameFlags, FrameGuard, FrameId, FramePool};
use super::{HandleOps, Stats};

struct BucketEntry {
    key: BlockKey,
    id: FrameId,
}

pub struct BlockIndex {
    buckets: Box<[RwLock<Vec<BucketEntry>>]>,
    ops: Arc<dyn HandleOps>,
}

impl BlockIndex {
    pub fn new(nbuckets: usize, ops: Arc<dyn HandleOps>) -> Self {
        let buckets = (0..nbuckets)
            .map(|_| RwLock::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { buckets, ops }
    }

    fn bucket_of(&self, key: &BlockKey) -> usize {
        let h = self.ops.hash(&key.handle);
        let p = key.page as u64;
        let mixed = h ^ (p << 9) ^ (p >> 13) ^ (p << 3);
        (mixed % self.buckets.len() as u64) as usize
    }

    fn key_eq(&self, a: &BlockKey, b: &BlockKey) -> bool {
        a.page == b.page && self.ops.eq(&a.handle, &b.handle)
    }

    /// Look the block up, allocating and mapping a fresh frame on a miss.
    /// The returned frame is locked and fixed; a miss leaves it mapped but
    /// not uptodate. Frames marked invalid are skipped as if absent.
    ///
    /// A free frame is preallocated before any chain lock is taken, which
    /// keeps the write critical section small; on a hit it goes straight
    /// back to the free list.
    pub fn get<'a>(
        &self,
        pool: &'a FramePool,
        files: &FileIndex,
        key: &BlockKey,
        account_miss: bool,
        stats: &Stats,
    ) -> FrameGuard<'a> {
        let prealloc = pool.allocate();
        let mut pg = Some(pool.frame(prealloc).lock());

        let bi = self.bucket_of(key);

        // Read pass: the common hit path never contends the write lock.
        {
            let bucket = self.buckets[bi].read().unwrap();
            if let Some(g) = self.search(pool, &bucket, key, stats) {
                drop(bucket);
                drop(pg.take());
                pool.release(prealloc);
                stats.fix();
                return g;
            }
        }

        // Upgrade and re-search; someone may have inserted it while the
        // chain was unlocked.
        let mut bucket = self.buckets[bi].write().unwrap();
        if let Some(g) = self.search(pool, &bucket, key, stats) {
            drop(bucket);
            drop(pg.take());
            pool.release(prealloc);
            stats.fix();
            return g;
        }

        if account_miss {
            stats.miss();
        }

        // Still a miss: map the preallocated frame. It is unreachable, so
        // taking the file record lock while holding its lock cannot
        // deadlock. Index insertion precedes file-list insertion.
        let mut g = pg.take().unwrap();
        g.fix = 1;
        g.key = key.clone();
        g.flags.remove(FrameFlags::FREE | FrameFlags::INVALID | FrameFlags::UPTODATE);
        bucket.push(BucketEntry { key: key.clone(), id: prealloc });

        let rec = files.get(&key.handle);
        rec.lock().frames.push(prealloc);
        files.put(&rec);
        log::debug!("mapped frame {} -> page {}", prealloc, key.page);

        stats.fix();
        g
    }

    fn search<'a>(
        &self,
        pool: &'a FramePool,
        bucket: &[BucketEntry],
        key: &BlockKey,
        stats: &Stats,
    ) -> Option<FrameGuard<'a>> {
        for entry in bucket.iter() {
            if !self.key_eq(&entry.key, key) {
                continue;
            }
            let mut g = pool.frame(entry.id).lock();
            // An invalidated frame is still chained but dead; keep
            // searching as if it were not here.
            if g.flags.contains(FrameFlags::INVALID) {
                continue;
            }
            g.fix += 1;
            stats.hit();
            return Some(g);
        }
        None
    }

    /// Look the block up without mapping, fixing, or accounting anything.
    /// Used by peeks that must not disturb the cache.
    pub fn lookup<'a>(&self, pool: &'a FramePool, key: &BlockKey) -> Option<FrameGuard<'a>> {
        let bi = self.bucket_of(key);
        let bucket = self.buckets[bi].read().unwrap();
        for entry in bucket.iter() {
            if !self.key_eq(&entry.key, key) {
                continue;
            }
            let g = pool.frame(entry.id).lock();
            if g.flags.contains(FrameFlags::INVALID) {
                continue;
            }
            return Some(g);
        }
        None
    }

    /// Unhook a victim frame from the index.
    ///
    /// The caller must have dropped the frame lock: the chain lock is
    /// acquired first, then the frame is re-locked with `try` and its key
    /// re-checked. If either step fails the frame was re-homed in the
    /// window and the deletion is abandoned. `force` waits for the frame
    /// lock instead of trying it, but still honours the key check.
    ///
    /// On success the frame is returned locked and out of the index.
    pub fn del<'a>(
        &self,
        pool: &'a FramePool,
        id: FrameId,
        old_key: &BlockKey,
        force: bool,
    ) -> Result<FrameGuard<'a>, ()> {
        let bi = self.bucket_of(old_key);
        let mut bucket = self.buckets[bi].write().unwrap();

        let frame = pool.frame(id);
        let g = if force {
            frame.lock()
        } else {
            match frame.try_lock() {
                Some(g) => g,
                None => return Err(()),
            }
        };
        if !self.key_eq(&g.key, old_key) {
            return Err(());
        }

        match bucket.iter().position(|e| e.id == id) {
            Some(pos) => {
                bucket.remove(pos);
            }
            None => return Err(()),
        }
        Ok(g)
    }

    /// Run `f` over every mapped frame, bucket by bucket, with the frame
    /// locked and the chain held in read mode.
    pub fn for_each_frame<'a, F>(&self, pool: &'a FramePool, mut f: F)
    where
        F: FnMut(FrameGuard<'a>),
    {
        for bucket in self.buckets.iter() {
            let bucket = bucket.read().unwrap();
            for entry in bucket.iter() {
                f(pool.frame(entry.id).lock());
            }
        }
    }
}
