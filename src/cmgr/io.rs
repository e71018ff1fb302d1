//! Fetch and writeback plumbing between the cache and its backing store.
//!
//! The cache core is agnostic to where page data lives; callers supply a
//! [`PageIo`] backend. A batch of locked frames covering a contiguous page
//! range turns into at most one backend call per direction, and every
//! sub-request completes independently with a byte count or a negative
//! errno.

use anyhow::Error;

use super::frame::{sanity_checks, FrameFlags, FrameGuard};
use super::Stats;

/// One fetch sub-request: fill `buf` from `offset` in the file.
pub struct PageRead<'a> {
    pub offset: i64,
    pub size: usize,
    pub buf: &'a mut [u8],
}

/// One writeback sub-request: store `buf` at `offset` in the file.
pub struct PageWrite<'a> {
    pub offset: i64,
    pub size: usize,
    pub buf: &'a [u8],
}

/// Backing store interface.
///
/// Each call covers one batch and blocks until the transfer settles. The
/// returned vector has one entry per sub-request: bytes completed, or a
/// negative errno. Returning `Err` fails the batch as a whole before any
/// transfer started.
pub trait PageIo: Send + Sync {
    fn read_pages(&self, handle: &[u8], reqs: &mut [PageRead<'_>]) -> Result<Vec<i64>, Error>;
    fn write_pages(&self, handle: &[u8], reqs: &[PageWrite<'_>]) -> Result<Vec<i64>, Error>;
}

/// Best-effort errno extraction from a backend error.
pub fn errno_of(err: &Error) -> i32 {
    if let Some(rpc) = err.downcast_ref::<crate::wire::RpcError>() {
        return rpc.errno();
    }
    match err.downcast_ref::<std::io::Error>() {
        Some(io) => io.raw_os_error().unwrap_or(libc::EREMOTEIO),
        None => libc::EREMOTEIO,
    }
}

/// Decide whether a page needs a fetch to satisfy a read of
/// `[want_start, want_start + want_size)` within it.
///
/// A page that is not uptodate always fetches. A dirty page whose valid
/// regions contain the whole requested sub-range is served locally - the
/// dirty data is authoritative. A dirty page that cannot cover the range
/// is flushed first and refetched whole, which is the easy alternative to
/// applying diffs on top of fetched data.
fn check_for_local_reads(
    g: &mut FrameGuard<'_>,
    want_start: usize,
    want_size: usize,
    backend: &dyn PageIo,
    bsize: usize,
    stats: &Stats,
) -> Result<bool, i64> {
    if !g.flags.contains(FrameFlags::UPTODATE) {
        return Ok(true);
    }
    if g.flags.contains(FrameFlags::DIRTY) {
        assert!(g.valid.count() > 0);
        if !g.valid.contains(want_start, want_size) {
            log::debug!("correctness writeback of frame {}", g.id());
            let ret = wb_sync(std::slice::from_mut(g), backend, bsize, stats);
            if ret < 0 {
                return Err(ret);
            }
            g.flags.remove(FrameFlags::UPTODATE);
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fetch whatever part of a locked frame batch cannot be served locally.
///
/// `valid_start[i]`/`valid_size[i]` describe the sub-range of page `i` the
/// caller wants. On return, `valid_size[i]` holds the bytes actually
/// available for that page (fetched pages: bytes returned by the backend;
/// local pages: unchanged; pages past a failure: 0).
///
/// Returns the number of bytes fetched, or a negative errno.
pub fn fetch_sync(
    frames: &mut [FrameGuard<'_>],
    valid_start: &[usize],
    valid_size: &mut [i64],
    backend: &dyn PageIo,
    bsize: usize,
    stats: &Stats,
) -> i64 {
    let mut local_bytes: i64 = 0;
    let mut total_missing = 0;
    let mut transitions = 0;
    let mut seen_uptodate = false;
    let mut seen_missing = false;

    for (i, g) in frames.iter_mut().enumerate() {
        sanity_checks(g, bsize);
        match check_for_local_reads(g, valid_start[i], valid_size[i] as usize, backend, bsize, stats)
        {
            Err(err) => return err,
            Ok(true) => {
                valid_size[i] = 0;
                total_missing += 1;
                if seen_uptodate {
                    transitions += 1;
                }
                seen_missing = true;
            }
            Ok(false) => {
                local_bytes += valid_size[i];
                if seen_missing {
                    transitions += 1;
                }
                seen_uptodate = true;
            }
        }
    }

    if total_missing == 0 {
        return local_bytes;
    }

    // With at most one transition between uptodate and missing pages the
    // missing ones form a contiguous run and fit a single RPC. More than
    // one transition means holes; rather than scatter/gather over
    // disjoint requests, refetch the whole batch.
    let only_missing = transitions <= 1;
    if only_missing {
        log::debug!("fetching only the {} missing page frames", total_missing);
    } else {
        log::debug!("non-contiguous misses, fetching all {} page frames", frames.len());
    }

    complete_fetch(frames, only_missing, valid_size, backend, bsize, stats)
}

fn complete_fetch(
    frames: &mut [FrameGuard<'_>],
    only_missing: bool,
    valid_size: &mut [i64],
    backend: &dyn PageIo,
    bsize: usize,
    stats: &Stats,
) -> i64 {
    let fetch_mask: Vec<bool> = frames
        .iter()
        .map(|g| !only_missing || !g.flags.contains(FrameFlags::UPTODATE))
        .collect();
    let handle = frames[0].key.handle.clone();

    stats.fetch();
    let comp = {
        let mut reqs: Vec<PageRead<'_>> = Vec::new();
        for (i, g) in frames.iter_mut().enumerate() {
            if !fetch_mask[i] {
                continue;
            }
            let offset = g.key.page * bsize as i64;
            reqs.push(PageRead { offset, size: bsize, buf: &mut g.inner.buf[..] });
        }
        match backend.read_pages(&handle, &mut reqs) {
            Ok(comp) => comp,
            Err(err) => return -(errno_of(&err) as i64),
        }
    };

    let mut fetched: i64 = 0;
    let mut failed = false;
    let mut j = 0;
    for (i, g) in frames.iter_mut().enumerate() {
        if !fetch_mask[i] {
            continue;
        }
        if !failed && comp[j] >= 0 {
            if comp[j] > 0 {
                g.valid.add(0, comp[j] as usize);
                g.flags.insert(FrameFlags::UPTODATE);
            }
            fetched += comp[j];
            valid_size[i] = comp[j];
        } else {
            // First failure latches; everything after it stays empty.
            failed = true;
            fetched = comp[j];
        }
        j += 1;
    }
    fetched
}

/// Write the dirty members of a locked frame batch back to the store, one
/// sub-request per valid region. Clears the dirty bits; a failure latches
/// the errno on every frame of the batch.
///
/// Returns the bytes written or a negative errno.
pub fn wb_sync(
    frames: &mut [FrameGuard<'_>],
    backend: &dyn PageIo,
    bsize: usize,
    stats: &Stats,
) -> i64 {
    let mut dirty_mask = Vec::with_capacity(frames.len());
    for g in frames.iter() {
        sanity_checks(g, bsize);
        dirty_mask.push(g.flags.contains(FrameFlags::DIRTY));
    }
    if !dirty_mask.iter().any(|&d| d) {
        return 0;
    }
    let handle = frames[0].key.handle.clone();

    stats.flush();
    let result = {
        let mut reqs: Vec<PageWrite<'_>> = Vec::new();
        for (i, g) in frames.iter().enumerate() {
            if !dirty_mask[i] {
                continue;
            }
            let page_offset = g.key.page * bsize as i64;
            for r in g.valid.iter() {
                reqs.push(PageWrite {
                    offset: page_offset + r.start as i64,
                    size: r.size,
                    buf: &g.inner.buf[r.start..r.start + r.size],
                });
            }
        }
        backend.write_pages(&handle, &reqs)
    };

    let total = match result {
        Ok(comp) => {
            let mut total: i64 = 0;
            for c in comp {
                if c > 0 {
                    total += c;
                } else {
                    total = c;
                    break;
                }
            }
            total
        }
        Err(err) => -(errno_of(&err) as i64),
    };

    for g in frames.iter_mut() {
        if total < 0 {
            g.error = total as i32;
        }
        g.flags.remove(FrameFlags::DIRTY);
    }
    total
}
