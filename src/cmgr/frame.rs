//! The frame pool: a fixed set of preallocated buffer frames plus the free
//! list they are recycled through.
//!
//! Frames are created once at pool init and never destroyed; they cycle
//! through Free -> Mapped-Invalid -> Mapped-Uptodate (clean or dirty) and
//! back. The pool mutex protects only the free list and its length; all
//! per-frame state sits behind the frame's own lock.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use bitflags::bitflags;

use crate::config::{CM_GCLOCK_REF, CM_MAGIC};

use super::regions::RegionSet;
use super::Stats;

pub type FrameId = usize;

bitflags! {
    pub struct FrameFlags: u32 {
        /// Holds modifications not yet written back.
        const DIRTY    = 0b0001;
        /// On the free list.
        const FREE     = 0b0010;
        /// Still reachable through the block index but logically dead;
        /// lookups skip it, the harvester reaps it.
        const INVALID  = 0b0100;
        /// Buffer content inside the valid regions is authoritative.
        const UPTODATE = 0b1000;
    }
}

/// The `(handle, page)` pair a frame currently backs. The handle buffer
/// has the fixed size configured at init; `page == -1` marks an unmapped
/// frame.
#[derive(Clone, Debug)]
pub struct BlockKey {
    pub handle: Box<[u8]>,
    pub page: i64,
}

impl BlockKey {
    pub fn unmapped(handle_size: usize) -> Self {
        Self { handle: vec![0u8; handle_size].into_boxed_slice(), page: -1 }
    }

    pub fn new(handle: &[u8], page: i64) -> Self {
        Self { handle: handle.to_vec().into_boxed_slice(), page }
    }
}

/// Everything mutable about a frame, guarded by the frame lock.
pub struct FrameInner {
    pub flags: FrameFlags,
    /// Count of active users; a fixed frame is never reclaimed.
    pub fix: u32,
    /// GCLOCK reference credit.
    pub gclock_ref: i32,
    /// Latched errno from an asynchronous writeback failure.
    pub error: i32,
    pub key: BlockKey,
    pub buf: Box<[u8]>,
    pub valid: RegionSet,
}

pub struct Frame {
    magic: u32,
    id: FrameId,
    inner: Mutex<FrameInner>,
}

impl Frame {
    fn new(id: FrameId, bsize: usize, handle_size: usize) -> Self {
        Self {
            magic: CM_MAGIC,
            id,
            inner: Mutex::new(FrameInner {
                flags: FrameFlags::FREE | FrameFlags::INVALID,
                fix: 0,
                gclock_ref: 0,
                error: 0,
                key: BlockKey::unmapped(handle_size),
                buf: vec![0u8; bsize].into_boxed_slice(),
                valid: RegionSet::new(),
            }),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn lock(&self) -> FrameGuard<'_> {
        log::trace!("LOCK frame[{}]", self.id);
        FrameGuard { frame: self, inner: self.inner.lock().unwrap() }
    }

    pub fn try_lock(&self) -> Option<FrameGuard<'_>> {
        match self.inner.try_lock() {
            Ok(inner) => Some(FrameGuard { frame: self, inner }),
            Err(_) => {
                log::trace!("TRYLOCK frame[{}] failed", self.id);
                None
            }
        }
    }
}

/// A locked frame. Dropping the guard unlocks it; going through
/// [`FramePool::unfix`] additionally runs the GCLOCK accounting.
pub struct FrameGuard<'a> {
    pub frame: &'a Frame,
    pub inner: MutexGuard<'a, FrameInner>,
}

impl FrameGuard<'_> {
    pub fn id(&self) -> FrameId {
        self.frame.id
    }
}

impl std::ops::Deref for FrameGuard<'_> {
    type Target = FrameInner;

    fn deref(&self) -> &FrameInner {
        &self.inner
    }
}

impl std::ops::DerefMut for FrameGuard<'_> {
    fn deref_mut(&mut self) -> &mut FrameInner {
        &mut self.inner
    }
}

/// The frame invariants checked before any I/O touches a frame. A
/// violation means corrupted cache state and takes the process down.
pub fn sanity_checks(g: &FrameGuard<'_>, bsize: usize) {
    assert_eq!(g.frame.magic(), CM_MAGIC, "frame {} magic mismatch", g.id());
    if g.flags.contains(FrameFlags::DIRTY) {
        assert!(g.valid.count() > 0, "dirty frame {} with no valid regions", g.id());
        assert!(g.valid.check(bsize), "frame {} regions out of bounds", g.id());
    }
}

struct PoolShared {
    free: VecDeque<FrameId>,
    num_free: usize,
}

/// The preallocated frame arena plus the free list.
pub struct FramePool {
    frames: Box<[Frame]>,
    bsize: usize,
    handle_size: usize,
    low_water: usize,
    shared: Mutex<PoolShared>,
    avail: Condvar,
    /// Nudges the harvester; bounded at one pending nudge.
    harvest_wake: crossbeam_channel::Sender<()>,
}

impl FramePool {
    pub fn new(
        bcount: usize,
        bsize: usize,
        handle_size: usize,
        low_water: usize,
        harvest_wake: crossbeam_channel::Sender<()>,
    ) -> Self {
        let frames: Box<[Frame]> = (0..bcount)
            .map(|id| Frame::new(id, bsize, handle_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free: VecDeque<FrameId> = (0..bcount).collect();
        log::debug!("frame pool initialized [{} frames of {} bytes]", bcount, bsize);
        Self {
            frames,
            bsize,
            handle_size,
            low_water,
            shared: Mutex::new(PoolShared { num_free: bcount, free }),
            avail: Condvar::new(),
            harvest_wake,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id]
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn num_free(&self) -> usize {
        self.shared.lock().unwrap().num_free
    }

    /// Take a frame off the free list, blocking until one is available.
    /// Running low on free frames signals the harvester before waiting.
    ///
    /// The returned frame is unreachable from any index, so the caller may
    /// lock and fill it without racing anyone.
    pub fn allocate(&self) -> FrameId {
        let mut shared = self.shared.lock().unwrap();
        if !shared.free.is_empty() && shared.num_free < self.low_water {
            let _ = self.harvest_wake.try_send(());
        }
        while shared.free.is_empty() {
            log::trace!("waiting for a free frame [{} < {}]", shared.num_free, self.low_water);
            let _ = self.harvest_wake.try_send(());
            shared = self.avail.wait(shared).unwrap();
        }
        let id = shared.free.pop_front().unwrap();
        shared.num_free -= 1;
        drop(shared);

        debug_assert!(self.frame(id).lock().flags.contains(FrameFlags::FREE));
        id
    }

    /// Return a frame to the free list. The frame must be unreachable
    /// (out of both indexes) and unlocked; its state is reset, the buffer
    /// zeroed, and one waiter woken.
    pub fn release(&self, id: FrameId) {
        {
            let mut g = self.frame(id).lock();
            g.fix = 0;
            g.gclock_ref = 0;
            g.error = 0;
            g.flags.remove(FrameFlags::DIRTY | FrameFlags::UPTODATE);
            g.flags.insert(FrameFlags::FREE | FrameFlags::INVALID);
            g.key = BlockKey::unmapped(self.handle_size);
            for b in g.buf.iter_mut() {
                *b = 0;
            }
            g.valid.clear();
        }
        let mut shared = self.shared.lock().unwrap();
        shared.free.push_back(id);
        shared.num_free += 1;
        self.avail.notify_one();
    }

    /// Drop a frame reference: grant the GCLOCK credit (dirty frames get
    /// double credit to delay their eviction), decrement the fix count and
    /// unlock.
    pub fn unfix(&self, mut g: FrameGuard<'_>, stats: &Stats) {
        if g.flags.contains(FrameFlags::DIRTY) {
            g.gclock_ref += 2 * CM_GCLOCK_REF;
        } else {
            g.gclock_ref += CM_GCLOCK_REF;
        }
        if g.fix > 0 {
            g.fix -= 1;
        }
        stats.unfix();
        log::trace!("UNLOCK frame[{}] ({})", g.id(), g.fix);
    }

    pub fn bsize(&self) -> usize {
        self.bsize
    }

    pub fn handle_size(&self) -> usize {
        self.handle_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(bcount: usize) -> FramePool {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        FramePool::new(bcount, 128, 16, bcount / 2 + 1, tx)
    }

    #[test]
    fn frames_start_free_and_invalid() {
        let pool = pool(4);
        assert_eq!(pool.num_free(), 4);
        for frame in pool.frames() {
            let g = frame.lock();
            assert!(g.flags.contains(FrameFlags::FREE));
            assert!(g.flags.contains(FrameFlags::INVALID));
            assert!(!g.flags.contains(FrameFlags::DIRTY));
            assert!(!g.flags.contains(FrameFlags::UPTODATE));
            assert_eq!(g.fix, 0);
            assert_eq!(g.gclock_ref, 0);
            assert_eq!(g.key.page, -1);
        }
    }

    #[test]
    fn allocate_release_roundtrip() {
        let pool = pool(2);
        let a = pool.allocate();
        let b = pool.allocate();
        assert_ne!(a, b);
        assert_eq!(pool.num_free(), 0);

        {
            let mut g = pool.frame(a).lock();
            g.flags.remove(FrameFlags::FREE | FrameFlags::INVALID);
            g.buf[0] = 0xff;
            g.valid.add(0, 16);
        }
        pool.release(a);
        assert_eq!(pool.num_free(), 1);

        let g = pool.frame(a).lock();
        assert!(g.flags.contains(FrameFlags::FREE | FrameFlags::INVALID));
        assert_eq!(g.buf[0], 0, "release must zero the payload");
        assert!(g.valid.is_empty());
    }

    #[test]
    fn free_list_length_matches_free_frames() {
        let pool = pool(8);
        let ids: Vec<_> = (0..3).map(|_| pool.allocate()).collect();
        assert_eq!(pool.num_free(), 5);
        let flagged_free = pool
            .frames()
            .filter(|f| f.lock().flags.contains(FrameFlags::FREE))
            .count();
        assert_eq!(flagged_free, 5);
        for id in ids {
            pool.release(id);
        }
        assert_eq!(pool.num_free(), 8);
    }
}
