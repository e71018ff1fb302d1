//! The generic block cache manager.
//!
//! Maps logical `(handle, page)` pairs onto a fixed pool of buffer frames,
//! tracks partially-valid frame contents for write coalescing, fetches
//! missing pages and writes dirty ones back through a caller-supplied
//! backend, and reclaims frames with a background GCLOCK harvester.
//!
//! Handles are opaque byte blobs; the cache compares and hashes them
//! through a caller-supplied [`HandleOps`]. Two organizations exist:
//! the full frame-backed cache (`CacheManager::new`) and an array-backed
//! variant (`CacheManager::new_simple`) where each file record directly
//! owns its chunk hash slots and eviction is whole-file.
//!
//! Lock order, everywhere: index chain > file record > frame > pool
//! mutex. A path that holds a lower lock and needs a higher one must drop
//! and reacquire in order, rechecking identity afterwards; the synch paths
//! below do exactly that with a try-lock on the frame side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::config::{self, CacheTuning, CM_BATCH_RATIO, CM_HIGH_WATER, CM_LOW_WATER};

pub mod block_index;
pub mod file_index;
pub mod frame;
pub mod harvester;
pub mod io;
pub mod regions;

use block_index::BlockIndex;
use file_index::FileIndex;
use frame::{BlockKey, FrameFlags, FrameGuard};
pub use frame::FramePool;
pub use io::{PageIo, PageRead, PageWrite};

/// Caller-supplied comparison and hashing over opaque handles.
pub trait HandleOps: Send + Sync {
    fn hash(&self, handle: &[u8]) -> u64;
    fn eq(&self, a: &[u8], b: &[u8]) -> bool;
}

/// Byte-blob handles: memcmp equality, SipHash-1-3 hashing.
pub struct DefaultHandleOps;

impl HandleOps for DefaultHandleOps {
    fn hash(&self, handle: &[u8]) -> u64 {
        use std::hash::Hasher;
        let mut hasher = siphasher::sip::SipHasher13::new();
        hasher.write(handle);
        hasher.finish()
    }

    fn eq(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("request of {pages} pages exceeds the pool size {bcount}")]
    TooLarge { pages: i64, bcount: usize },
    #[error("handle longer than the configured handle size")]
    HandleTooLong,
    #[error("i/o failed with errno {eno}")]
    Io { eno: i32 },
}

impl CacheError {
    pub fn errno(&self) -> i32 {
        match self {
            CacheError::Invalid(_) => libc::EINVAL,
            CacheError::TooLarge { .. } => libc::EINVAL,
            CacheError::HandleTooLong => libc::ENAMETOOLONG,
            CacheError::Io { eno } => *eno,
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Cache activity counters, dumped at finalize when `CMGR_STATS` is set.
#[derive(Default)]
pub struct Stats {
    fixes: AtomicU64,
    unfixes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    flushes: AtomicU64,
    invalidates: AtomicU64,
    evicts: AtomicU64,
    harvests: AtomicU64,
    scans: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Stats {
    counter!(fix, fixes);
    counter!(unfix, unfixes);
    counter!(hit, hits);
    counter!(miss, misses);
    counter!(fetch, fetches);
    counter!(flush, flushes);
    counter!(invalidate, invalidates);
    counter!(evict, evicts);
    counter!(harvest, harvests);
    counter!(scan, scans);

    pub fn snapshot(&self, reset: bool) -> StatsSnapshot {
        let take = |c: &AtomicU64| {
            if reset {
                c.swap(0, Ordering::Relaxed)
            } else {
                c.load(Ordering::Relaxed)
            }
        };
        StatsSnapshot {
            fixes: take(&self.fixes),
            unfixes: take(&self.unfixes),
            hits: take(&self.hits),
            misses: take(&self.misses),
            fetches: take(&self.fetches),
            flushes: take(&self.flushes),
            invalidates: take(&self.invalidates),
            evicts: take(&self.evicts),
            harvests: take(&self.harvests),
            scans: take(&self.scans),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub fixes: u64,
    pub unfixes: u64,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub flushes: u64,
    pub invalidates: u64,
    pub evicts: u64,
    pub harvests: u64,
    pub scans: u64,
}

/// What a synch operation should do with the affected frames.
#[derive(Clone, Copy, Debug)]
pub enum SynchOptions {
    /// Throw cached state away. For a range, frames *outside* the kept
    /// range are evicted and boundary remnants zeroed; for the whole file
    /// (`size == -1`) everything goes.
    Evict,
    /// Keep the frames, optionally writing dirty data back and/or marking
    /// them not-uptodate so the next reference refetches.
    Keep { writeback: bool, invalidate: bool },
}

pub struct CmgrOptions {
    pub tuning: CacheTuning,
    pub handle_ops: Arc<dyn HandleOps>,
    pub backend: Arc<dyn PageIo>,
}

pub(crate) struct ResolvedTuning {
    pub bsize: usize,
    pub bcount: usize,
    pub handle_size: usize,
    pub low_water: usize,
    pub high_water: usize,
    pub batch: usize,
    /// Shift for power-of-two frame sizes; otherwise page math divides.
    pub log_bsize: Option<u32>,
}

pub(crate) struct CmgrShared {
    pub tuning: ResolvedTuning,
    pub pool: FramePool,
    pub blocks: BlockIndex,
    pub files: FileIndex,
    pub backend: Arc<dyn PageIo>,
    pub stats: Stats,
}

impl CmgrShared {
    /// Write back every dirty frame in the cache.
    pub fn wb_all(&self) {
        self.blocks.for_each_frame(&self.pool, |mut g| {
            if g.flags.contains(FrameFlags::DIRTY) {
                log::debug!("flush-all writeback of frame {}", g.id());
            }
            io::wb_sync(
                std::slice::from_mut(&mut g),
                &*self.backend,
                self.tuning.bsize,
                &self.stats,
            );
        });
    }
}

/// The cache manager instance. One per mount (or per hash cache).
pub struct CacheManager {
    shared: Arc<CmgrShared>,
    harvester: Mutex<Option<harvester::Harvester>>,
    finalized: std::sync::atomic::AtomicBool,
    simple: bool,
}

impl CacheManager {
    /// Build the full frame-backed cache and start the harvester.
    pub fn new(opts: CmgrOptions) -> CacheResult<Self> {
        Self::build(opts, false, true)
    }

    #[cfg(test)]
    pub(crate) fn new_unharvested(opts: CmgrOptions) -> CacheResult<Self> {
        Self::build(opts, false, false)
    }

    /// Build the array-backed variant: no frame pool, no harvester, file
    /// records own their hash slots directly. Frame size must equal the
    /// hash size.
    pub fn new_simple(opts: CmgrOptions) -> CacheResult<Self> {
        if opts.tuning.bsize != crate::NULL_HASH.len() {
            return Err(CacheError::Invalid("array-backed cache requires hash-sized frames"));
        }
        Self::build(opts, true, false)
    }

    fn build(opts: CmgrOptions, simple: bool, with_harvester: bool) -> CacheResult<Self> {
        let t = &opts.tuning;
        if t.bsize == 0 || t.bcount == 0 || t.block_table_size == 0 || t.file_table_size == 0 {
            return Err(CacheError::Invalid("cache geometry must be non-zero"));
        }
        if t.handle_size == 0 {
            return Err(CacheError::Invalid("handle size must be non-zero"));
        }

        let tuning = ResolvedTuning {
            bsize: t.bsize,
            bcount: t.bcount,
            handle_size: t.handle_size,
            low_water: (CM_LOW_WATER * t.bcount as f64) as usize + 1,
            high_water: (CM_HIGH_WATER * t.bcount as f64) as usize + 1,
            batch: (CM_BATCH_RATIO * t.bcount as f64) as usize + 1,
            log_bsize: if t.bsize.is_power_of_two() {
                Some(t.bsize.trailing_zeros())
            } else {
                None
            },
        };

        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let pool_frames = if simple { 0 } else { t.bcount };
        let shared = Arc::new(CmgrShared {
            pool: FramePool::new(pool_frames, t.bsize, t.handle_size, tuning.low_water, wake_tx),
            blocks: BlockIndex::new(t.block_table_size, opts.handle_ops.clone()),
            files: FileIndex::new(t.file_table_size, opts.handle_ops.clone(), t.bcount, simple),
            backend: opts.backend,
            stats: Stats::default(),
            tuning,
        });

        let harvester = if simple || !with_harvester {
            None
        } else {
            Some(harvester::Harvester::spawn(shared.clone(), wake_rx))
        };
        log::debug!("cache manager initialized (simple = {})", simple);

        Ok(Self {
            shared,
            harvester: Mutex::new(harvester),
            finalized: std::sync::atomic::AtomicBool::new(false),
            simple,
        })
    }

    /// Pad an application handle out to the configured handle size.
    pub fn make_handle(&self, handle: &[u8]) -> CacheResult<Box<[u8]>> {
        let size = self.shared.tuning.handle_size;
        if handle.len() > size {
            return Err(CacheError::HandleTooLong);
        }
        let mut buf = vec![0u8; size];
        buf[..handle.len()].copy_from_slice(handle);
        Ok(buf.into_boxed_slice())
    }

    fn page_of(&self, byte: i64) -> i64 {
        match self.shared.tuning.log_bsize {
            Some(shift) => byte >> shift,
            None => byte / self.shared.tuning.bsize as i64,
        }
    }

    /// Read `buf.len()` bytes starting at `begin_byte` through the cache.
    /// Pages at or past `prefetch_index` (when `>= 0`) are read-ahead and
    /// do not count towards the hit/miss statistics.
    ///
    /// Returns the bytes actually delivered; a fetch that comes up short
    /// yields the prefix.
    pub fn get_region(
        &self,
        handle: &[u8],
        begin_byte: i64,
        buf: &mut [u8],
        prefetch_index: i64,
    ) -> CacheResult<i64> {
        let count = buf.len() as i64;
        if count == 0 {
            return Ok(0);
        }
        if begin_byte < 0 {
            return Err(CacheError::Invalid("negative file offset"));
        }
        let s = &self.shared;
        let bsize = s.tuning.bsize as i64;
        let begin_page = self.page_of(begin_byte);
        let end_page = self.page_of(begin_byte + count - 1);
        let total_pages = end_page - begin_page + 1;
        if total_pages > s.tuning.bcount as i64 {
            return Err(CacheError::TooLarge { pages: total_pages, bcount: s.tuning.bcount });
        }

        let where0 = (begin_byte - begin_page * bsize) as usize;
        let mut where1 = ((begin_byte + count) % bsize) as usize;
        if where1 == 0 {
            where1 = bsize as usize;
        }
        log::debug!("read: pages {}..={}", begin_page, end_page);

        let handle_buf = self.make_handle(handle)?;
        let n = total_pages as usize;
        let mut guards: Vec<FrameGuard> = Vec::with_capacity(n);
        let mut valid_start = vec![0usize; n];
        let mut valid_size = vec![0i64; n];
        for i in 0..n {
            let page = begin_page + i as i64;
            let account_miss = !(prefetch_index >= 0 && page >= prefetch_index);
            let (vs, vsz) = request_span(i, n, where0, where1, s.tuning.bsize);
            valid_start[i] = vs;
            valid_size[i] = vsz as i64;
            let key = BlockKey::new(&handle_buf, page);
            guards.push(s.blocks.get(&s.pool, &s.files, &key, account_miss, &s.stats));
        }
        let requested: Vec<i64> = valid_size.clone();

        let ret = io::fetch_sync(
            &mut guards,
            &valid_start,
            &mut valid_size,
            &*s.backend,
            s.tuning.bsize,
            &s.stats,
        );
        if ret < 0 {
            for g in guards {
                s.pool.unfix(g, &s.stats);
            }
            return Err(CacheError::Io { eno: (-ret) as i32 });
        }

        // Copy out, compacting: short pages shrink the result rather than
        // leaving holes.
        let mut out = 0usize;
        for (i, g) in guards.iter().enumerate() {
            let vs = valid_start[i];
            let want = requested[i] as usize;
            let take = if valid_size[i] == requested[i] {
                want
            } else {
                // Fetched page: bytes valid from the page start.
                (valid_size[i].max(0) as usize).saturating_sub(vs).min(want)
            };
            buf[out..out + take].copy_from_slice(&g.buf[vs..vs + take]);
            out += take;
        }
        for g in guards {
            s.pool.unfix(g, &s.stats);
        }
        log::debug!("read: delivered {} bytes", out);
        Ok(out as i64)
    }

    /// Write `buf` at `begin_byte` into the cache, marking the touched
    /// spans valid and dirty. With `sync_writeback` the data is flushed
    /// before the frames are released and the flushed byte count is
    /// returned.
    pub fn put_region(
        &self,
        handle: &[u8],
        begin_byte: i64,
        buf: &[u8],
        sync_writeback: bool,
    ) -> CacheResult<i64> {
        let count = buf.len() as i64;
        if count == 0 {
            return Ok(0);
        }
        if begin_byte < 0 {
            return Err(CacheError::Invalid("negative file offset"));
        }
        let s = &self.shared;
        let bsize = s.tuning.bsize as i64;
        let begin_page = self.page_of(begin_byte);
        let end_page = self.page_of(begin_byte + count - 1);
        let total_pages = end_page - begin_page + 1;
        if total_pages > s.tuning.bcount as i64 {
            return Err(CacheError::TooLarge { pages: total_pages, bcount: s.tuning.bcount });
        }

        let where0 = (begin_byte - begin_page * bsize) as usize;
        let mut where1 = ((begin_byte + count) % bsize) as usize;
        if where1 == 0 {
            where1 = bsize as usize;
        }
        log::debug!("write: pages {}..={}", begin_page, end_page);

        let handle_buf = self.make_handle(handle)?;
        let n = total_pages as usize;
        let mut guards: Vec<FrameGuard> = Vec::with_capacity(n);
        for i in 0..n {
            let key = BlockKey::new(&handle_buf, begin_page + i as i64);
            guards.push(s.blocks.get(&s.pool, &s.files, &key, false, &s.stats));
        }

        let mut total: i64 = 0;
        let mut src = 0usize;
        for (i, g) in guards.iter_mut().enumerate() {
            let (vs, vsz) = request_span(i, n, where0, where1, s.tuning.bsize);
            g.buf[vs..vs + vsz].copy_from_slice(&buf[src..src + vsz]);
            src += vsz;
            g.valid.add(vs, vsz);
            g.flags.insert(FrameFlags::UPTODATE | FrameFlags::DIRTY);
            total += vsz as i64;
        }

        if sync_writeback {
            let ret = io::wb_sync(&mut guards, &*s.backend, s.tuning.bsize, &s.stats);
            for g in guards {
                s.pool.unfix(g, &s.stats);
            }
            if ret < 0 {
                return Err(CacheError::Io { eno: (-ret) as i32 });
            }
            return Ok(ret);
        }
        for g in guards {
            s.pool.unfix(g, &s.stats);
        }
        Ok(total)
    }

    /// Synchronize the cached state of `[start, start + size)` (whole file
    /// when `size == -1`) with the server according to `opts`.
    ///
    /// `blocking` is advisory: callback-driven invalidations pass `false`,
    /// matching the manager-side calling convention; both variants take
    /// the same locks here since frame locks under the record are always
    /// try-acquired.
    pub fn synch_region(
        &self,
        handle: &[u8],
        start: i64,
        size: i64,
        opts: SynchOptions,
        blocking: bool,
    ) -> CacheResult<()> {
        let _ = blocking;
        let handle_buf = self.make_handle(handle)?;
        match opts {
            SynchOptions::Evict => self.evict_blocks(&handle_buf, start, size),
            SynchOptions::Keep { writeback, invalidate } => {
                self.synch_blocks(&handle_buf, start, size, writeback, invalidate)
            }
        }
    }

    fn range_of(&self, start: i64, size: i64) -> CacheResult<(i64, i64)> {
        if start == 0 && size == -1 {
            return Ok((0, -1));
        }
        if start < 0 || size < 0 {
            return Err(CacheError::Invalid("negative synch range"));
        }
        Ok((self.page_of(start), self.page_of(start + size - 1)))
    }

    /// Evict every frame of the file that falls outside the kept range
    /// and zero the out-of-range remnants of the boundary pages. The
    /// truncate path keeps `[start, start + size)`.
    fn evict_blocks(&self, handle_buf: &[u8], start: i64, size: i64) -> CacheResult<()> {
        let s = &self.shared;
        let bsize = s.tuning.bsize as i64;
        let (begin, end) = self.range_of(start, size)?;
        let whole = end == -1;
        let head_len = if whole { 0 } else { (start - begin * bsize) as usize };
        let tail_off = if whole { 0 } else { ((start + size) % bsize) as usize };

        let rec = s.files.get(handle_buf);
        let mut inner = rec.lock();
        let mut idx = 0usize;
        'next_frame: while idx < inner.frames.len() {
            let id = inner.frames[idx];
            // Frame lock under the record lock must not block: drop the
            // record, yield, and re-validate the slot on contention.
            let mut g = loop {
                match s.pool.frame(id).try_lock() {
                    Some(g) => break g,
                    None => {
                        drop(inner);
                        std::thread::yield_now();
                        inner = rec.lock();
                        if idx >= inner.frames.len() || inner.frames[idx] != id {
                            continue 'next_frame;
                        }
                    }
                }
            };
            let page = g.key.page;
            let mut removed = false;
            if whole || page < begin || page > end {
                log::debug!("evicting frame {} -> page {} from file list", id, page);
                g.flags.remove(FrameFlags::DIRTY);
                g.flags.insert(FrameFlags::INVALID);
                inner.frames.remove(idx);
                removed = true;
                s.stats.evict();
            }
            if !whole {
                if page == begin && head_len > 0 {
                    for b in &mut g.buf[..head_len] {
                        *b = 0;
                    }
                }
                if page == end && tail_off > 0 {
                    for b in &mut g.buf[tail_off..] {
                        *b = 0;
                    }
                }
            }
            drop(g);
            if !removed {
                idx += 1;
            }
        }
        drop(inner);
        s.files.put(&rec);
        Ok(())
    }

    /// Write back and/or invalidate the file's frames in the given range.
    /// Latched writeback errors surface here (the close/fsync path) and
    /// are cleared in the process.
    fn synch_blocks(
        &self,
        handle_buf: &[u8],
        start: i64,
        size: i64,
        writeback: bool,
        invalidate: bool,
    ) -> CacheResult<()> {
        if !writeback && !invalidate {
            return Ok(());
        }
        let s = &self.shared;
        let (begin, end) = self.range_of(start, size)?;

        let rec = s.files.get(handle_buf);
        let mut inner = rec.lock();

        let mut failed = false;
        let mut err: i32 = 0;
        if writeback && inner.error != 0 {
            failed = true;
            err = inner.error;
            inner.error = 0;
        }

        let mut batch: Vec<FrameGuard> = Vec::new();
        let mut idx = 0usize;
        'next_frame: while idx < inner.frames.len() {
            let id = inner.frames[idx];
            let mut g = loop {
                match s.pool.frame(id).try_lock() {
                    Some(g) => break g,
                    None => {
                        drop(inner);
                        std::thread::yield_now();
                        inner = rec.lock();
                        if idx >= inner.frames.len() || inner.frames[idx] != id {
                            continue 'next_frame;
                        }
                    }
                }
            };
            let page = g.key.page;
            let in_range = end == -1 || (page >= begin && page <= end);
            if in_range && writeback && g.flags.contains(FrameFlags::DIRTY) {
                batch.push(g);
            } else {
                if in_range && invalidate {
                    g.flags.remove(FrameFlags::DIRTY | FrameFlags::UPTODATE);
                    s.stats.invalidate();
                }
                drop(g);
            }
            idx += 1;
        }

        if writeback && !batch.is_empty() {
            let ret = io::wb_sync(&mut batch, &*s.backend, s.tuning.bsize, &s.stats);
            if ret < 0 {
                failed = true;
                err = ret as i32;
            } else {
                log::debug!("synch wrote back {} bytes", ret);
            }
            for mut g in batch {
                if invalidate {
                    g.flags.remove(FrameFlags::DIRTY | FrameFlags::UPTODATE);
                    s.stats.invalidate();
                }
            }
        }
        drop(inner);
        s.files.put(&rec);

        if failed {
            Err(CacheError::Io { eno: -err })
        } else {
            Ok(())
        }
    }

    /// Mark every frame clean and not-uptodate. Used after transport
    /// failures when nothing cached can be trusted anymore.
    pub fn invalidate(&self) {
        for frame in self.shared.pool.frames() {
            let mut g = frame.lock();
            g.flags.remove(FrameFlags::DIRTY | FrameFlags::UPTODATE);
        }
    }

    /// Write back every dirty frame.
    pub fn wb_all(&self) {
        self.shared.wb_all();
    }

    /// Look cached chunks up without triggering any fetch. Returns one
    /// entry per chunk: the cached bytes, or `None` where the cache has
    /// nothing authoritative.
    pub fn peek_pages(
        &self,
        handle: &[u8],
        begin_page: i64,
        npages: usize,
    ) -> CacheResult<Vec<Option<Vec<u8>>>> {
        let s = &self.shared;
        let handle_buf = self.make_handle(handle)?;
        let mut out = Vec::with_capacity(npages);
        for i in 0..npages {
            let key = BlockKey::new(&handle_buf, begin_page + i as i64);
            let slot = match s.blocks.lookup(&s.pool, &key) {
                Some(g)
                    if g.flags.contains(FrameFlags::UPTODATE)
                        && g.valid.contains(0, s.tuning.bsize) =>
                {
                    Some(g.buf.to_vec())
                }
                _ => None,
            };
            out.push(slot);
        }
        Ok(out)
    }

    pub fn stats(&self, reset: bool) -> StatsSnapshot {
        self.shared.stats.snapshot(reset)
    }

    /// Flush everything, stop the harvester and drop the indexes. Also
    /// runs from `Drop`; calling it twice is harmless.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.simple {
            self.shared.wb_all();
        }
        if let Some(mut h) = self.harvester.lock().unwrap().take() {
            h.shutdown();
        }
        self.shared.files.clear();
        if config::stats_enabled() {
            let stats = self.shared.stats.snapshot(false);
            log::info!(
                "cache manager: {} frames of {} bytes, hits {}, misses {}, \
                 fetches {}, flushes {}, invalidates {}, evicts {}, \
                 fixes {}, unfixes {}, harvests {}, scans {}",
                self.shared.tuning.bcount,
                self.shared.tuning.bsize,
                stats.hits,
                stats.misses,
                stats.fetches,
                stats.flushes,
                stats.invalidates,
                stats.evicts,
                stats.fixes,
                stats.unfixes,
                stats.harvests,
                stats.scans,
            );
        }
        log::debug!("cache manager finalized");
    }

    // --- Array-backed operations ------------------------------------

    /// Read `nchunks` hash slots into `out` (hash-sized entries, packed).
    /// Missing slots are fetched through the backend in one batch; the
    /// record lock is held across the fetch so a concurrent update cannot
    /// interleave.
    pub fn simple_get(
        &self,
        handle: &[u8],
        begin_chunk: i64,
        nchunks: i64,
        prefetch_index: i64,
        out: &mut [u8],
    ) -> CacheResult<i64> {
        let s = &self.shared;
        let bsize = s.tuning.bsize;
        if begin_chunk < 0 || nchunks <= 0 {
            return Err(CacheError::Invalid("bad chunk range"));
        }
        if out.len() < nchunks as usize * bsize {
            return Err(CacheError::Invalid("output buffer too small"));
        }
        let handle_buf = self.make_handle(handle)?;
        let rec = s.files.get(&handle_buf);
        let mut inner = rec.lock();
        inner.ensure_hashes((begin_chunk + nchunks) as usize, s.files.initial_hashes());

        let mut local_bytes: i64 = 0;
        let mut total_missing = 0usize;
        let mut transitions = 0usize;
        let mut seen_valid = false;
        let mut seen_missing = false;
        let mut start_miss: i64 = -1;
        {
            let hashes = inner.hashes.as_ref().unwrap();
            for i in 0..nchunks {
                let chunk = begin_chunk + i;
                let account = !(prefetch_index >= 0 && chunk >= prefetch_index);
                let slot = &hashes[chunk as usize];
                if !slot.valid {
                    if account {
                        s.stats.miss();
                    }
                    if start_miss < 0 {
                        start_miss = chunk;
                    }
                    total_missing += 1;
                    if seen_valid {
                        transitions += 1;
                    }
                    seen_missing = true;
                } else {
                    if account {
                        s.stats.hit();
                    }
                    if seen_missing {
                        transitions += 1;
                    }
                    local_bytes += bsize as i64;
                    seen_valid = true;
                    let at = i as usize * bsize;
                    out[at..at + bsize].copy_from_slice(&slot.hash);
                }
            }
        }

        if total_missing == 0 {
            drop(inner);
            s.files.put(&rec);
            return Ok(local_bytes);
        }

        // Same contiguity rule as the frame path: a single run of misses
        // is fetched alone, holes force a refetch of the whole range.
        let (fetch_start, nfetch, mut comp_size) = if transitions <= 1 {
            (start_miss, total_missing, local_bytes)
        } else {
            (begin_chunk, nchunks as usize, 0)
        };
        log::debug!("fetching {} hash slots from chunk {}", nfetch, fetch_start);

        s.stats.fetch();
        let mut temp = vec![0u8; nfetch * bsize];
        let comp = {
            let mut reqs: Vec<PageRead> = temp
                .chunks_mut(bsize)
                .enumerate()
                .map(|(i, buf)| PageRead {
                    offset: (fetch_start + i as i64) * bsize as i64,
                    size: bsize,
                    buf,
                })
                .collect();
            match s.backend.read_pages(&handle_buf, &mut reqs) {
                Ok(comp) => comp,
                Err(err) => {
                    let eno = io::errno_of(&err);
                    drop(inner);
                    s.files.put(&rec);
                    return Err(CacheError::Io { eno });
                }
            }
        };

        let hashes = inner.hashes.as_mut().unwrap();
        let mut failed = false;
        for i in 0..nfetch {
            if !failed && comp[i] >= 0 {
                if comp[i] > 0 {
                    let chunk = (fetch_start + i as i64) as usize;
                    let src = &temp[i * bsize..(i + 1) * bsize];
                    hashes[chunk].valid = true;
                    hashes[chunk].hash.copy_from_slice(src);
                    let at = (fetch_start - begin_chunk + i as i64) as usize * bsize;
                    out[at..at + bsize].copy_from_slice(src);
                }
                comp_size += comp[i];
            } else {
                failed = true;
                comp_size = comp[i];
            }
        }
        drop(inner);
        s.files.put(&rec);
        if comp_size < 0 {
            return Err(CacheError::Io { eno: (-comp_size) as i32 });
        }
        Ok(comp_size)
    }

    /// Install `data` (packed hash-sized entries) into the slot array,
    /// marking them valid.
    pub fn simple_put(
        &self,
        handle: &[u8],
        begin_chunk: i64,
        data: &[u8],
    ) -> CacheResult<i64> {
        let s = &self.shared;
        let bsize = s.tuning.bsize;
        if begin_chunk < 0 || data.is_empty() || data.len() % bsize != 0 {
            return Err(CacheError::Invalid("bad hash data"));
        }
        let nchunks = (data.len() / bsize) as i64;
        let handle_buf = self.make_handle(handle)?;
        let rec = s.files.get(&handle_buf);
        {
            let mut inner = rec.lock();
            inner.ensure_hashes((begin_chunk + nchunks) as usize, s.files.initial_hashes());
            let hashes = inner.hashes.as_mut().unwrap();
            for i in 0..nchunks as usize {
                let chunk = begin_chunk as usize + i;
                hashes[chunk].valid = true;
                hashes[chunk].hash.copy_from_slice(&data[i * bsize..(i + 1) * bsize]);
            }
        }
        s.files.put(&rec);
        Ok(nchunks * bsize as i64)
    }

    /// Peek at the slot array without fetching anything.
    pub fn simple_peek(
        &self,
        handle: &[u8],
        begin_chunk: i64,
        nchunks: usize,
    ) -> CacheResult<Vec<crate::HashSlot>> {
        let s = &self.shared;
        let handle_buf = self.make_handle(handle)?;
        let rec = s.files.get(&handle_buf);
        let out = {
            let inner = rec.lock();
            (0..nchunks)
                .map(|i| {
                    let chunk = begin_chunk as usize + i;
                    match &inner.hashes {
                        Some(hashes) if chunk < hashes.len() => hashes[chunk],
                        _ => crate::HashSlot::invalid(),
                    }
                })
                .collect()
        };
        s.files.put(&rec);
        Ok(out)
    }

    /// Invalidate a chunk range (`evict == false`) or free the whole slot
    /// array (`evict == true`).
    pub fn simple_synch_region(
        &self,
        handle: &[u8],
        begin_chunk: i64,
        nchunks: i64,
        evict: bool,
        blocking: bool,
    ) -> CacheResult<()> {
        let _ = blocking;
        let s = &self.shared;
        let handle_buf = self.make_handle(handle)?;
        let rec = s.files.get(&handle_buf);
        {
            let mut inner = rec.lock();
            if evict {
                inner.hashes = None;
            } else if let Some(hashes) = inner.hashes.as_mut() {
                for i in 0..nchunks {
                    let chunk = (begin_chunk + i) as usize;
                    if chunk < hashes.len() {
                        hashes[chunk].valid = false;
                    }
                }
            }
        }
        s.files.put(&rec);
        Ok(())
    }

    /// Free every record's slot array.
    pub fn simple_invalidate(&self) {
        self.shared.files.for_each(|rec| {
            rec.lock().hashes = None;
        });
    }

    #[cfg(test)]
    pub(crate) fn test_frame_regions(
        &self,
        handle: &[u8],
        page: i64,
    ) -> Option<Vec<(usize, usize)>> {
        let s = &self.shared;
        let handle_buf = self.make_handle(handle).ok()?;
        let key = BlockKey::new(&handle_buf, page);
        s.blocks
            .lookup(&s.pool, &key)
            .map(|g| g.valid.iter().map(|r| (r.start, r.size)).collect())
    }

    #[cfg(test)]
    pub(crate) fn test_shared(&self) -> &Arc<CmgrShared> {
        &self.shared
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// The sub-span of page `i` (of `n`) touched by a request with first-page
/// offset `where0` and last-page end `where1`.
fn request_span(i: usize, n: usize, where0: usize, where1: usize, bsize: usize) -> (usize, usize) {
    if i == 0 {
        if n == 1 {
            (where0, where1 - where0)
        } else {
            (where0, bsize - where0)
        }
    } else if i == n - 1 {
        (0, where1)
    } else {
        (0, bsize)
    }
}

#[cfg(test)]
mod tests;
