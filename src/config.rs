//! Tunables, defaults, and environment handling.
//!
//! Everything the cache core used to read from process-wide globals is
//! collected here into explicit option structs that get passed into the
//! constructors. The `CMGR_*` environment variables keep their historic
//! meaning.

use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;

/// Magic number stamped into every cache frame.
pub const CM_MAGIC: u32 = 0x1234_5678;

/// Default frame size in bytes; also the chunk size of the filesystem.
pub const CM_BSIZE: usize = 16384;
/// Default number of frames in the pool.
pub const CM_BCOUNT: usize = 1024;
/// Default bucket count of the block and file indexes (prime).
pub const CM_TABLE_SIZE: usize = 1023;
/// GCLOCK reference credit granted on every unfix.
pub const CM_GCLOCK_REF: i32 = 10;
/// GCLOCK age subtracted by every harvester sweep.
pub const CM_GCLOCK_AGE: i32 = 10;
/// Default size of an opaque file handle in bytes.
pub const CM_HANDLE_SIZE: usize = 64;

/// Harvester wakes when the free list drops below this fraction of the pool.
pub const CM_LOW_WATER: f64 = 0.5;
/// Harvester idles once the free list climbs back above this fraction.
pub const CM_HIGH_WATER: f64 = 0.7;
/// Fraction of the pool the harvester frees or cleans before yielding.
pub const CM_BATCH_RATIO: f64 = 0.1;

/// Handle size used by the hash cache, sized for a path with the manager
/// address embedded (`capfs://host:port/path`).
pub const CAPFS_MAXNAMELEN: usize = 256;

/// Upper bound on hashes carried by one `gethashes`/`wcommit` exchange.
pub const CAPFS_MAXHASHES: usize = 64;

/// RPC timeout towards the manager.
pub const MGR_CLNT_TIMEOUT: Duration = Duration::from_secs(25);

/// How often a conflicted write commit is retried before `EAGAIN`.
pub const WCOMMIT_MAX_ATTEMPTS: usize = 5;

/// Cache-manager geometry, resolved from the environment with compiled-in
/// fallbacks. A variable that fails to parse falls back to its default,
/// matching the old strtol guards.
#[derive(Clone, Debug)]
pub struct CacheTuning {
    /// Frame payload size (`CMGR_BSIZE`).
    pub bsize: usize,
    /// Number of frames in the pool (`CMGR_BCOUNT`).
    pub bcount: usize,
    /// Block index bucket count (`CMGR_BTSIZE`).
    pub block_table_size: usize,
    /// File index bucket count (`CMGR_BFTSIZE`).
    pub file_table_size: usize,
    /// Opaque handle size in bytes.
    pub handle_size: usize,
    /// Unit of content hashing (`CMGR_CHUNK_SIZE`).
    pub chunk_size: usize,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            bsize: CM_BSIZE,
            bcount: CM_BCOUNT,
            block_table_size: CM_TABLE_SIZE,
            file_table_size: CM_TABLE_SIZE,
            handle_size: CM_HANDLE_SIZE,
            chunk_size: CM_BSIZE,
        }
    }
}

impl CacheTuning {
    pub fn from_env() -> Self {
        let def = Self::default();
        Self {
            bsize: env_usize("CMGR_BSIZE", def.bsize),
            bcount: env_usize("CMGR_BCOUNT", def.bcount),
            block_table_size: env_usize("CMGR_BTSIZE", def.block_table_size),
            file_table_size: env_usize("CMGR_BFTSIZE", def.file_table_size),
            handle_size: def.handle_size,
            chunk_size: env_usize("CMGR_CHUNK_SIZE", def.chunk_size),
        }
    }

    /// Tuning used by the hash cache: a frame holds exactly one SHA-1
    /// hash, and handles are full file names.
    pub fn for_hashes() -> Self {
        let mut tuning = Self::from_env();
        tuning.bsize = crate::NULL_HASH.len();
        tuning.handle_size = CAPFS_MAXNAMELEN;
        tuning
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(val) => match val.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => default,
        },
        Err(_) => default,
    }
}

lazy_static! {
    static ref STATS_ENABLED: bool = std::env::var_os("CMGR_STATS").is_some();
}

/// Whether cache statistics should be dumped at finalize (`CMGR_STATS`).
pub fn stats_enabled() -> bool {
    *STATS_ENABLED
}

/// Path of the mount table (`CAPFSTAB_ENV` overrides the default). The
/// table itself is parsed by the shim layer, not by this crate.
pub fn capfstab_path() -> PathBuf {
    match std::env::var_os("CAPFSTAB_ENV") {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from("/etc/capfstab"),
    }
}

/// Wire `CMGR_DEBUG` / `CMGR_LOCK_DEBUG` / `CMGR_OUTPUT` into the logger.
///
/// `CMGR_DEBUG` enables debug tracing, `CMGR_LOCK_DEBUG` additionally
/// enables the (very chatty) lock traces, and `CMGR_OUTPUT` redirects the
/// whole stream into a file. Safe to call more than once.
pub fn init_logging() {
    let mut builder = env_logger::Builder::new();

    if std::env::var_os("CMGR_LOCK_DEBUG").is_some() {
        builder.filter_level(log::LevelFilter::Trace);
    } else if std::env::var_os("CMGR_DEBUG").is_some() {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }

    if let Some(path) = std::env::var_os("CMGR_OUTPUT") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => {
                eprintln!("cannot redirect trace output to {:?} - {}", path, err);
            }
        }
    }

    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults() {
        let tuning = CacheTuning::default();
        assert_eq!(tuning.bsize, 16384);
        assert_eq!(tuning.bcount, 1024);
        assert_eq!(tuning.block_table_size, 1023);
        assert_eq!(tuning.handle_size, 64);
    }

    #[test]
    fn hash_tuning_uses_sha1_frames() {
        let tuning = CacheTuning::for_hashes();
        assert_eq!(tuning.bsize, 20);
        assert_eq!(tuning.handle_size, CAPFS_MAXNAMELEN);
    }
}
