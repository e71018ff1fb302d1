//! The write-commit engine.
//!
//! A write becomes visible to other clients as one atomic swap of the
//! affected recipe entries. The committer snapshots what it believes the
//! current hashes are, hashes the new chunk contents locally (rebuilding
//! edge chunks from current data first), and proposes the pair to the
//! manager. Losing the race costs nothing but a retry with the winner's
//! hashes; no lock is ever held at the client.

use std::sync::Arc;

use anyhow::Error;

use crate::config::{CAPFS_MAXHASHES, WCOMMIT_MAX_ATTEMPTS};
use crate::hcache::HashCache;
use crate::wire::RpcError;
use crate::{ChunkHash, HashSlot};

use super::manager::{ManagerClient, WcommitOutcome};

/// Source of current chunk contents for read-modify-write of edge chunks.
/// In production this reads from the I/O servers keyed by the cached
/// hashes; a chunk may come back short or empty at end of file.
pub trait ChunkData: Send + Sync {
    fn read_chunk(&self, name: &str, chunk: i64) -> Result<Vec<u8>, Error>;
}

#[derive(Clone, Copy, Debug)]
pub struct CommitOptions {
    /// Skip the compare step at the manager. For sole writers this also
    /// skips the old-hash snapshot entirely.
    pub force: bool,
    /// Ask the manager to push UPDATE callbacks to other caching clients.
    pub desire_coherence: bool,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self { force: false, desire_coherence: true }
    }
}

pub struct WriteCommitter {
    client: Arc<ManagerClient>,
    hcache: Arc<HashCache>,
    data: Arc<dyn ChunkData>,
    chunk_size: usize,
}

impl WriteCommitter {
    pub fn new(
        client: Arc<ManagerClient>,
        hcache: Arc<HashCache>,
        data: Arc<dyn ChunkData>,
        chunk_size: usize,
    ) -> Self {
        Self { client, hcache, data, chunk_size }
    }

    /// Commit a write of `data` at byte `offset` of `name`. Returns the
    /// authoritative hashes of the affected chunk range.
    ///
    /// A `STALE` answer is not surfaced: the current hashes are installed
    /// locally, the edge chunks are rebuilt against the winner's data and
    /// the commit is retried, up to a bound, after which the caller gets
    /// `EAGAIN`.
    pub async fn commit(
        &self,
        name: &str,
        offset: i64,
        data: &[u8],
        opts: CommitOptions,
    ) -> Result<Vec<ChunkHash>, Error> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if offset < 0 {
            return Err(RpcError::Server(libc::EINVAL).into());
        }
        let cs = self.chunk_size as i64;
        let begin_chunk = offset / cs;
        let end_chunk = (offset + data.len() as i64 - 1) / cs;
        let nchunks = (end_chunk - begin_chunk + 1) as usize;
        if nchunks > CAPFS_MAXHASHES {
            return Err(RpcError::Server(libc::EINVAL).into());
        }

        for attempt in 1..=WCOMMIT_MAX_ATTEMPTS {
            let new_hashes = self.hash_chunks(name, begin_chunk, nchunks, offset, data)?;
            let old_hashes = if opts.force {
                Vec::new()
            } else {
                self.hcache.peek(name, begin_chunk, nchunks).map_err(rpc_of)?
            };

            log::debug!(
                "wcommit {}: chunks {}..{} attempt {}",
                name,
                begin_chunk,
                end_chunk,
                attempt
            );
            let outcome = self
                .client
                .wcommit(
                    name,
                    begin_chunk,
                    data.len() as i64,
                    old_hashes,
                    new_hashes.iter().map(|h| HashSlot::new(h.hash)).collect(),
                    opts.force,
                    opts.desire_coherence,
                )
                .await?;

            match outcome {
                WcommitOutcome::Committed(current) => {
                    let hashes = valid_hashes(&current);
                    self.install(name, begin_chunk, &current);
                    return Ok(hashes);
                }
                WcommitOutcome::Stale(current) => {
                    log::debug!("wcommit {} lost the race, reconciling", name);
                    self.install(name, begin_chunk, &current);
                    // Loop around: the edge chunks get rebuilt against
                    // the winner's data and the snapshot refreshed.
                }
            }
        }
        log::warn!("wcommit {} still conflicting after {} attempts", name, WCOMMIT_MAX_ATTEMPTS);
        Err(RpcError::Server(libc::EAGAIN).into())
    }

    /// Write the authoritative slots into the local cache; invalid slots
    /// (chunks that do not exist) invalidate their cache entries instead.
    fn install(&self, name: &str, begin_chunk: i64, slots: &[HashSlot]) {
        for (i, slot) in slots.iter().enumerate() {
            let chunk = begin_chunk + i as i64;
            let result = if slot.valid {
                self.hcache.put(name, chunk, &[slot.hash]).map(|_| ())
            } else {
                self.hcache.clear_range(name, chunk, 1)
            };
            if let Err(err) = result {
                log::warn!("cannot install hash for {} chunk {} - {}", name, chunk, err);
            }
        }
    }

    /// SHA-1 over the post-write contents of every affected chunk. Chunks
    /// only partially covered by the write are rebuilt from the current
    /// data first; writes smaller than a chunk are not striped any finer.
    fn hash_chunks(
        &self,
        name: &str,
        begin_chunk: i64,
        nchunks: usize,
        offset: i64,
        data: &[u8],
    ) -> Result<Vec<HashSlot>, Error> {
        let cs = self.chunk_size as i64;
        let write_end = offset + data.len() as i64;
        let mut out = Vec::with_capacity(nchunks);
        for i in 0..nchunks {
            let chunk = begin_chunk + i as i64;
            let chunk_begin = chunk * cs;
            let chunk_end = chunk_begin + cs;
            let ws = offset.max(chunk_begin);
            let we = write_end.min(chunk_end);

            let content = if ws == chunk_begin && we == chunk_end {
                data[(ws - offset) as usize..(we - offset) as usize].to_vec()
            } else {
                let mut base = self.data.read_chunk(name, chunk)?;
                let need = (we - chunk_begin) as usize;
                if base.len() < need {
                    base.resize(need, 0);
                }
                base.truncate(self.chunk_size);
                base[(ws - chunk_begin) as usize..(we - chunk_begin) as usize]
                    .copy_from_slice(&data[(ws - offset) as usize..(we - offset) as usize]);
                base
            };
            out.push(HashSlot::new(openssl::sha::sha1(&content)));
        }
        Ok(out)
    }
}

fn valid_hashes(slots: &[HashSlot]) -> Vec<ChunkHash> {
    slots.iter().filter(|s| s.valid).map(|s| s.hash).collect()
}

fn rpc_of(err: crate::cmgr::CacheError) -> RpcError {
    RpcError::Server(err.errno())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoData;

    impl ChunkData for NoData {
        fn read_chunk(&self, _name: &str, _chunk: i64) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }
    }

    fn committer(chunk_size: usize) -> WriteCommitter {
        use crate::hcache::{HashCache, HashFetch, HcacheMode, HcacheOptions};

        struct NoFetch;
        impl HashFetch for NoFetch {
            fn fetch_hashes(
                &self,
                _name: &str,
                _begin: i64,
                n: usize,
            ) -> Result<Vec<HashSlot>, Error> {
                Ok(vec![HashSlot::invalid(); n])
            }
        }

        let hcache = Arc::new(
            HashCache::new(HcacheOptions::new(HcacheMode::Simple, Arc::new(NoFetch))).unwrap(),
        );
        WriteCommitter::new(Arc::new(ManagerClient::new()), hcache, Arc::new(NoData), chunk_size)
    }

    #[test]
    fn full_chunk_hash_is_plain_sha1() {
        let wc = committer(16);
        let data = [0xa5u8; 16];
        let hashes = wc.hash_chunks("capfs://m:1/f", 0, 1, 0, &data).unwrap();
        assert_eq!(hashes[0].hash, openssl::sha::sha1(&data));
    }

    #[test]
    fn edge_chunk_is_rebuilt_with_zero_fill() {
        let wc = committer(16);
        // Write 4 bytes at offset 6 of an empty chunk: the rebuilt chunk
        // covers [0, 10) with the written range overlaid.
        let hashes = wc.hash_chunks("capfs://m:1/f", 0, 1, 6, &[1, 2, 3, 4]).unwrap();
        let mut expect = vec![0u8; 10];
        expect[6..10].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(hashes[0].hash, openssl::sha::sha1(&expect));
    }

    #[test]
    fn straddling_write_hashes_both_chunks() {
        let wc = committer(16);
        let data = [7u8; 16];
        // [8, 24) covers the tail of chunk 0 and the head of chunk 1.
        let hashes = wc.hash_chunks("capfs://m:1/f", 0, 2, 8, &data).unwrap();
        let mut chunk0 = vec![0u8; 16];
        chunk0[8..].copy_from_slice(&data[..8]);
        let mut chunk1 = vec![0u8; 8];
        chunk1.copy_from_slice(&data[8..]);
        assert_eq!(hashes[0].hash, openssl::sha::sha1(&chunk0));
        assert_eq!(hashes[1].hash, openssl::sha::sha1(&chunk1));
    }
}
