//! The file hash index: `handle -> file record`.
//!
//! A file record owns its handle, a reference count, the error latch for
//! asynchronous writeback failures, the list of frame ids caching its
//! pages, and (for the array-backed hash cache mode) the per-chunk hash
//! slots. Records are created on first access and die only once they are
//! unreferenced, frameless, error-free and unpinned.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::HashSlot;

use super::frame::FrameId;
use super::HandleOps;

pub struct FileInner {
    /// Holders of a record reference; the index's own entry is not
    /// counted, so a record with `refs == 1` has exactly one user.
    pub refs: i32,
    /// Errno latched by a failed writeback on a harvested frame; reported
    /// and cleared by the next writeback-synch on this file.
    pub error: i32,
    /// Pinned records never leave the index (array-backed hash cache).
    pub pin: bool,
    /// Frames of this file currently in the cache.
    pub frames: Vec<FrameId>,
    /// Chunk hash slots of the array-backed mode; `None` until first use
    /// or after a whole-file eviction.
    pub hashes: Option<Vec<HashSlot>>,
}

pub struct FileRecord {
    handle: Box<[u8]>,
    inner: Mutex<FileInner>,
}

impl FileRecord {
    pub fn handle(&self) -> &[u8] {
        &self.handle
    }

    pub fn lock(&self) -> MutexGuard<'_, FileInner> {
        log::trace!("LOCK file record");
        self.inner.lock().unwrap()
    }
}

impl FileInner {
    /// Make sure the hash array covers `nchunks` slots, growing by
    /// doubling so repeated extensions stay amortized.
    pub fn ensure_hashes(&mut self, nchunks: usize, initial: usize) {
        let want = nchunks + 1;
        match &mut self.hashes {
            Some(hashes) => {
                if hashes.len() < want {
                    let grown = std::cmp::max(hashes.len() * 2, want);
                    hashes.resize(grown, HashSlot::invalid());
                }
            }
            None => {
                let len = std::cmp::max(initial, want);
                self.hashes = Some(vec![HashSlot::invalid(); len]);
            }
        }
    }
}

pub struct FileIndex {
    buckets: Box<[RwLock<Vec<Arc<FileRecord>>>]>,
    ops: Arc<dyn HandleOps>,
    /// Initial hash-array size handed to new records.
    initial_hashes: usize,
    /// Whether new records are pinned (array-backed hash cache mode).
    pin_records: bool,
}

impl FileIndex {
    pub fn new(
        nbuckets: usize,
        ops: Arc<dyn HandleOps>,
        initial_hashes: usize,
        pin_records: bool,
    ) -> Self {
        let buckets = (0..nbuckets)
            .map(|_| RwLock::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { buckets, ops, initial_hashes, pin_records }
    }

    fn bucket_of(&self, handle: &[u8]) -> usize {
        (self.ops.hash(handle) % self.buckets.len() as u64) as usize
    }

    fn find(&self, bucket: &[Arc<FileRecord>], handle: &[u8]) -> Option<Arc<FileRecord>> {
        bucket
            .iter()
            .find(|rec| self.ops.eq(rec.handle(), handle))
            .cloned()
    }

    /// Look the record up, allocating one on a miss, and take a reference
    /// on it. Every `get` must be paired with a [`FileIndex::put`].
    pub fn get(&self, handle: &[u8]) -> Arc<FileRecord> {
        let bi = self.bucket_of(handle);

        {
            let bucket = self.buckets[bi].read().unwrap();
            if let Some(rec) = self.find(&bucket, handle) {
                rec.lock().refs += 1;
                return rec;
            }
        }

        let mut bucket = self.buckets[bi].write().unwrap();
        if let Some(rec) = self.find(&bucket, handle) {
            rec.lock().refs += 1;
            return rec;
        }

        let rec = Arc::new(FileRecord {
            handle: handle.to_vec().into_boxed_slice(),
            inner: Mutex::new(FileInner {
                refs: 1,
                error: 0,
                pin: self.pin_records,
                frames: Vec::new(),
                hashes: None,
            }),
        });
        log::trace!("file record allocated");
        bucket.push(rec.clone());
        rec
    }

    /// Drop a reference. A record that is now unreferenced, frameless,
    /// error-free and unpinned is removed from the index; the record lock
    /// has to be dropped and re-acquired after the chain write lock, so
    /// the removability check is repeated to close the race window.
    pub fn put(&self, rec: &Arc<FileRecord>) {
        let removable = {
            let inner = rec.lock();
            inner.refs == 1 && inner.error == 0 && inner.frames.is_empty() && !inner.pin
        };
        if !removable {
            rec.lock().refs -= 1;
            return;
        }

        let bi = self.bucket_of(rec.handle());
        let mut bucket = self.buckets[bi].write().unwrap();
        let mut inner = rec.lock();
        if inner.refs == 1 && inner.error == 0 && inner.frames.is_empty() && !inner.pin {
            bucket.retain(|r| !Arc::ptr_eq(r, rec));
            log::trace!("file record released");
        }
        inner.refs -= 1;
    }

    /// Unhook a harvested frame from its file's list, latching any failed
    /// writeback errno on the record. Called with the frame unlocked; the
    /// removal itself is covered by the record lock.
    pub fn remove_frame(&self, id: FrameId, handle: &[u8], failed_wb: i32) {
        let rec = self.get(handle);
        {
            let mut inner = rec.lock();
            if failed_wb < 0 {
                inner.error = failed_wb;
            }
            if let Some(pos) = inner.frames.iter().position(|&f| f == id) {
                inner.frames.remove(pos);
                log::debug!("unhooked frame {} from file list", id);
            } else {
                log::debug!("frame {} already off the file list", id);
            }
        }
        self.put(&rec);
    }

    /// Run `f` over every record in the index.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<FileRecord>),
    {
        for bucket in self.buckets.iter() {
            let bucket = bucket.read().unwrap();
            for rec in bucket.iter() {
                f(rec);
            }
        }
    }

    pub fn initial_hashes(&self) -> usize {
        self.initial_hashes
    }

    /// Drop every record regardless of state; finalize only.
    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.write().unwrap().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmgr::DefaultHandleOps;

    fn index(pin: bool) -> FileIndex {
        FileIndex::new(17, Arc::new(DefaultHandleOps), 8, pin)
    }

    fn handle(tag: u8) -> Vec<u8> {
        let mut h = vec![0u8; 16];
        h[0] = tag;
        h
    }

    #[test]
    fn get_allocates_and_put_frees() {
        let idx = index(false);
        let h = handle(1);
        let rec = idx.get(&h);
        assert_eq!(rec.lock().refs, 1);
        idx.put(&rec);
        drop(rec);

        let mut seen = 0;
        idx.for_each(|_| seen += 1);
        assert_eq!(seen, 0, "unpinned empty record must leave the index");
    }

    #[test]
    fn pinned_records_stay() {
        let idx = index(true);
        let h = handle(2);
        let rec = idx.get(&h);
        idx.put(&rec);
        drop(rec);

        let mut seen = 0;
        idx.for_each(|_| seen += 1);
        assert_eq!(seen, 1);
    }

    #[test]
    fn latched_error_keeps_record_alive() {
        let idx = index(false);
        let h = handle(3);
        let rec = idx.get(&h);
        rec.lock().error = -libc::EIO;
        idx.put(&rec);
        drop(rec);

        let mut seen = 0;
        idx.for_each(|_| seen += 1);
        assert_eq!(seen, 1, "record with a pending error must survive");
    }

    #[test]
    fn hash_array_grows_by_doubling() {
        let idx = index(true);
        let rec = idx.get(&handle(4));
        {
            let mut inner = rec.lock();
            inner.ensure_hashes(4, idx.initial_hashes());
            assert_eq!(inner.hashes.as_ref().unwrap().len(), 8);
            inner.ensure_hashes(9, idx.initial_hashes());
            assert_eq!(inner.hashes.as_ref().unwrap().len(), 16);
            inner.ensure_hashes(40, idx.initial_hashes());
            assert_eq!(inner.hashes.as_ref().unwrap().len(), 41);
        }
        idx.put(&rec);
    }

    #[test]
    fn same_handle_same_record() {
        let idx = index(false);
        let h = handle(5);
        let a = idx.get(&h);
        let b = idx.get(&h);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.lock().refs, 2);
        idx.put(&a);
        idx.put(&b);
    }
}
