//! Client-side assembly: the manager RPC client, the write-commit engine,
//! and the context tying them to the hash cache and callback service.

use std::sync::Arc;

use anyhow::Error;

use crate::callback::CallbackServer;
use crate::config::{CacheTuning, CM_BSIZE};
use crate::hcache::{HashCache, HcacheMode, HcacheOptions};

pub mod manager;
pub mod wcommit;

pub use manager::{parse_name, ManagerClient, ManagerFetcher, WcommitOutcome};
pub use wcommit::{ChunkData, CommitOptions, WriteCommitter};

pub struct ClientOptions {
    pub hcache_mode: HcacheMode,
    pub tuning: CacheTuning,
    /// Unit of content hashing.
    pub chunk_size: usize,
    /// Source of current chunk contents for edge-chunk rebuilds.
    pub chunk_data: Arc<dyn ChunkData>,
}

impl ClientOptions {
    pub fn new(chunk_data: Arc<dyn ChunkData>) -> Self {
        let tuning = CacheTuning::for_hashes();
        let chunk_size = std::cmp::max(tuning.chunk_size, 1);
        Self { hcache_mode: HcacheMode::Simple, tuning, chunk_size, chunk_data }
    }
}

/// One CAPFS client context: everything the former process-wide state
/// used to be. Build with [`CapfsClient::init`], tear down with
/// [`CapfsClient::finalize`].
pub struct CapfsClient {
    pub manager: Arc<ManagerClient>,
    pub hcache: Arc<HashCache>,
    pub committer: WriteCommitter,
    callbacks: Option<CallbackServer>,
}

impl CapfsClient {
    pub async fn init(opts: ClientOptions) -> Result<Self, Error> {
        let manager = Arc::new(ManagerClient::new());

        let mut tuning = opts.tuning.clone();
        tuning.bsize = crate::NULL_HASH.len();
        let hcache = Arc::new(HashCache::new(HcacheOptions {
            mode: opts.hcache_mode,
            tuning,
            fetch: Arc::new(ManagerFetcher::new(manager.clone())),
        })?);
        manager.set_hcache(hcache.clone());

        let callbacks = CallbackServer::spawn(hcache.clone()).await?;
        manager.set_callback_port(callbacks.port());
        log::info!("capfs client ready, callback service on port {}", callbacks.port());

        let chunk_size = if opts.chunk_size > 0 { opts.chunk_size } else { CM_BSIZE };
        let committer =
            WriteCommitter::new(manager.clone(), hcache.clone(), opts.chunk_data, chunk_size);

        Ok(Self { manager, hcache, committer, callbacks: Some(callbacks) })
    }

    /// Port the callback service listens on; managers route REVOKE and
    /// UPDATE callbacks here.
    pub fn callback_port(&self) -> u16 {
        self.callbacks.as_ref().map(|cb| cb.port()).unwrap_or(0)
    }

    pub async fn finalize(mut self) {
        if let Some(callbacks) = self.callbacks.take() {
            callbacks.shutdown().await;
        }
        self.hcache.finalize();
        log::info!("capfs client finalized");
    }
}
