//! The hash cache: per-file arrays of chunk hashes with pluggable fetch
//! backends.
//!
//! Files are keyed by their full name with the manager address embedded
//! (`capfs://host:port/path`). Two organizations sit behind one API:
//!
//! * **Simple** - each file record directly owns a growable slot array;
//!   eviction is whole-file. Fast, and the memory cost is proportional to
//!   the file set actually touched.
//! * **Complex** - every chunk hash lives in its own frame of the generic
//!   block cache, so the normal GCLOCK eviction and writeback machinery
//!   applies. Worth it when the set of cached hashes must stay bounded.
//!
//! Missing chunks are pulled through a [`HashFetch`] backend; in
//! production that backend issues `gethashes` RPCs to the manager.

use std::sync::Arc;

use anyhow::Error;

use crate::cmgr::{
    CacheError, CacheManager, CacheResult, CmgrOptions, DefaultHandleOps, PageIo, PageRead,
    PageWrite, StatsSnapshot, SynchOptions,
};
use crate::config::{CacheTuning, CAPFS_MAXHASHES};
use crate::{ChunkHash, HashSlot};

/// Fetches authoritative hash slots for a file. `name` is the full file
/// name including the manager address.
pub trait HashFetch: Send + Sync {
    fn fetch_hashes(
        &self,
        name: &str,
        begin_chunk: i64,
        nchunks: usize,
    ) -> Result<Vec<HashSlot>, Error>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HcacheMode {
    Simple,
    Complex,
}

pub struct HcacheOptions {
    pub mode: HcacheMode,
    pub tuning: CacheTuning,
    pub fetch: Arc<dyn HashFetch>,
}

impl HcacheOptions {
    pub fn new(mode: HcacheMode, fetch: Arc<dyn HashFetch>) -> Self {
        Self { mode, tuning: CacheTuning::for_hashes(), fetch }
    }
}

const HASH_LEN: usize = std::mem::size_of::<ChunkHash>();

pub struct HashCache {
    mode: HcacheMode,
    cm: CacheManager,
}

impl HashCache {
    pub fn new(opts: HcacheOptions) -> CacheResult<Self> {
        let mut tuning = opts.tuning;
        tuning.bsize = HASH_LEN;
        let cmgr_opts = CmgrOptions {
            tuning,
            handle_ops: Arc::new(DefaultHandleOps),
            backend: Arc::new(FetchBackend { fetch: opts.fetch }),
        };
        let cm = match opts.mode {
            HcacheMode::Simple => CacheManager::new_simple(cmgr_opts)?,
            HcacheMode::Complex => CacheManager::new(cmgr_opts)?,
        };
        log::debug!("hash cache initialized ({:?} mode)", opts.mode);
        Ok(Self { mode: opts.mode, cm })
    }

    /// Read `out.len()` chunk hashes starting at `begin_chunk`, fetching
    /// missing ones through the backend. Chunks at or past
    /// `prefetch_index` (when `>= 0`) do not count towards hit/miss
    /// accounting. Returns the number of hash bytes delivered.
    pub fn get(
        &self,
        name: &str,
        begin_chunk: i64,
        prefetch_index: i64,
        out: &mut [ChunkHash],
    ) -> CacheResult<i64> {
        let nchunks = out.len() as i64;
        if nchunks == 0 {
            return Ok(0);
        }
        let mut bytes = vec![0u8; out.len() * HASH_LEN];
        let ret = match self.mode {
            HcacheMode::Simple => self.cm.simple_get(
                name.as_bytes(),
                begin_chunk,
                nchunks,
                prefetch_index,
                &mut bytes,
            )?,
            HcacheMode::Complex => self.cm.get_region(
                name.as_bytes(),
                begin_chunk * HASH_LEN as i64,
                &mut bytes,
                prefetch_index,
            )?,
        };
        for (i, hash) in out.iter_mut().enumerate() {
            hash.copy_from_slice(&bytes[i * HASH_LEN..(i + 1) * HASH_LEN]);
        }
        Ok(ret)
    }

    /// Install hashes as valid cache content. Returns the bytes stored.
    pub fn put(&self, name: &str, begin_chunk: i64, hashes: &[ChunkHash]) -> CacheResult<i64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        let bytes: Vec<u8> = hashes.iter().flat_map(|h| h.iter().copied()).collect();
        match self.mode {
            HcacheMode::Simple => self.cm.simple_put(name.as_bytes(), begin_chunk, &bytes),
            HcacheMode::Complex => {
                self.cm
                    .put_region(name.as_bytes(), begin_chunk * HASH_LEN as i64, &bytes, false)
            }
        }
    }

    /// Snapshot cached slots without fetching anything; slots the cache
    /// knows nothing about come back invalid. This is what the write
    /// commit uses to gather its `old_hashes`.
    pub fn peek(
        &self,
        name: &str,
        begin_chunk: i64,
        nchunks: usize,
    ) -> CacheResult<Vec<HashSlot>> {
        match self.mode {
            HcacheMode::Simple => self.cm.simple_peek(name.as_bytes(), begin_chunk, nchunks),
            HcacheMode::Complex => {
                let pages = self.cm.peek_pages(name.as_bytes(), begin_chunk, nchunks)?;
                Ok(pages
                    .into_iter()
                    .map(|p| match p {
                        Some(bytes) => {
                            let mut hash = crate::NULL_HASH;
                            hash.copy_from_slice(&bytes[..HASH_LEN]);
                            HashSlot::new(hash)
                        }
                        None => HashSlot::invalid(),
                    })
                    .collect())
            }
        }
    }

    /// Drop everything cached for the file.
    pub fn clear(&self, name: &str) -> CacheResult<()> {
        match self.mode {
            HcacheMode::Simple => {
                self.cm.simple_synch_region(name.as_bytes(), 0, -1, true, true)
            }
            HcacheMode::Complex => {
                self.cm
                    .synch_region(name.as_bytes(), 0, -1, SynchOptions::Evict, true)
            }
        }
    }

    /// Invalidate a chunk range of the file. Idempotent.
    pub fn clear_range(&self, name: &str, begin_chunk: i64, nchunks: i64) -> CacheResult<()> {
        if nchunks <= 0 || begin_chunk < 0 {
            return Err(CacheError::Invalid("bad chunk range"));
        }
        match self.mode {
            HcacheMode::Simple => {
                self.cm
                    .simple_synch_region(name.as_bytes(), begin_chunk, nchunks, false, false)
            }
            HcacheMode::Complex => self.cm.synch_region(
                name.as_bytes(),
                begin_chunk * HASH_LEN as i64,
                nchunks * HASH_LEN as i64,
                SynchOptions::Keep { writeback: false, invalidate: true },
                false,
            ),
        }
    }

    /// Drop every cached hash of every file. Used when the manager lost
    /// track of us (restart) and nothing cached can be trusted.
    pub fn invalidate_all(&self) {
        match self.mode {
            HcacheMode::Simple => self.cm.simple_invalidate(),
            HcacheMode::Complex => self.cm.invalidate(),
        }
    }

    pub fn stats(&self, reset: bool) -> StatsSnapshot {
        self.cm.stats(reset)
    }

    pub fn finalize(&self) {
        self.cm.finalize();
    }
}

/// Adapts a [`HashFetch`] backend to the page-I/O interface of the cache
/// core. Offsets arrive in hash-sized units from a contiguous run, so one
/// backend call covers the whole batch; hash "writeback" is a no-op since
/// the manager is updated through the commit path, never from the cache.
struct FetchBackend {
    fetch: Arc<dyn HashFetch>,
}

impl PageIo for FetchBackend {
    fn read_pages(&self, handle: &[u8], reqs: &mut [PageRead<'_>]) -> Result<Vec<i64>, Error> {
        let name = handle_to_name(handle)?;
        if reqs.is_empty() {
            return Ok(Vec::new());
        }
        let begin_chunk = reqs[0].offset / HASH_LEN as i64;
        let nchunks = reqs.len();
        if nchunks > CAPFS_MAXHASHES {
            log::error!(
                "hash fetch of {} chunks exceeds the {} per-call bound",
                nchunks,
                CAPFS_MAXHASHES
            );
            return Ok(vec![-(libc::EINVAL as i64); nchunks]);
        }
        log::debug!("hash fetch: {} chunk {} + {}", name, begin_chunk, nchunks);

        match self.fetch.fetch_hashes(&name, begin_chunk, nchunks) {
            Ok(slots) => Ok(reqs
                .iter_mut()
                .enumerate()
                .map(|(i, req)| match slots.get(i) {
                    Some(slot) if slot.valid => {
                        req.buf[..HASH_LEN].copy_from_slice(&slot.hash);
                        HASH_LEN as i64
                    }
                    _ => 0,
                })
                .collect()),
            Err(err) => {
                log::error!("hash fetch failed for {} - {}", name, err);
                let eno = crate::cmgr::io::errno_of(&err) as i64;
                Ok(vec![-eno; nchunks])
            }
        }
    }

    fn write_pages(&self, _handle: &[u8], reqs: &[PageWrite<'_>]) -> Result<Vec<i64>, Error> {
        Ok(reqs.iter().map(|r| r.size as i64).collect())
    }
}

fn handle_to_name(handle: &[u8]) -> Result<String, Error> {
    let end = handle.iter().position(|&b| b == 0).unwrap_or(handle.len());
    Ok(std::str::from_utf8(&handle[..end])?.to_string())
}
