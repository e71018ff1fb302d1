//! Client-side core of CAPFS, a content-addressable parallel filesystem.
//!
//! # Data model
//!
//! CAPFS stripes every file across a set of I/O servers and names each
//! chunk-sized piece of it by the SHA-1 hash of its contents. The ordered
//! list of chunk hashes (the *recipe*) is the only mutable per-file state;
//! it lives on a metadata manager, one per mountpoint. Clients cache
//! recipes locally and read or write data chunks on the I/O servers keyed
//! by those hashes.
//!
//! A write never updates the recipe in place. Instead the client sends the
//! manager a `wcommit` carrying both the hashes it believes are current and
//! the hashes of the data it just wrote. The manager compares the old
//! hashes against its authoritative copy under a file-level lock: on a
//! match it installs the new hashes and notifies other caching clients, on
//! a mismatch it rejects the commit and returns the winning hashes so the
//! caller can reconcile and retry. Consistency is therefore tunable from
//! loose (forced commits) to sequential (compare-and-swap with coherence
//! callbacks) without any client-held locks.
//!
//! # Crate layout
//!
//! * [`cmgr`] - the generic block cache manager: a fixed pool of buffer
//!   frames, hashed block and file indexes, per-frame valid-region
//!   tracking, batched fetch/writeback plumbing and a background harvester
//!   running a GCLOCK sweep.
//! * [`hcache`] - the hash cache built on top of it, mapping file names to
//!   per-chunk hash arrays with pluggable fetch backends.
//! * [`client`] - typed RPC wrappers for every manager operation, the
//!   connection cache, and the write-commit engine.
//! * [`callback`] - the local TCP service through which managers revoke or
//!   update cached hashes.
//! * [`server`] - the manager service itself (recipe table, client
//!   registry, commit arbitration, callback fan-out).
//! * [`wire`] - the message types shared by all of the above.

use serde::{Deserialize, Serialize};

pub mod config;
pub mod tools;
pub mod wire;

pub mod cmgr;
pub mod hcache;

pub mod callback;
pub mod client;
pub mod server;

/// A SHA-1 chunk content hash.
pub type ChunkHash = [u8; 20];

/// The all-zero hash used wherever a slot has no content yet.
pub const NULL_HASH: ChunkHash = [0u8; 20];

/// One entry of a hash recipe: a chunk hash plus a validity bit.
///
/// Invalid slots act as "unknown" markers - a client that never fetched a
/// chunk's hash snapshots it as invalid, and the manager treats an invalid
/// slot in its own recipe as "chunk never written".
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HashSlot {
    pub valid: bool,
    pub hash: ChunkHash,
}

impl HashSlot {
    pub fn new(hash: ChunkHash) -> Self {
        Self { valid: true, hash }
    }

    pub fn invalid() -> Self {
        Self { valid: false, hash: NULL_HASH }
    }
}
