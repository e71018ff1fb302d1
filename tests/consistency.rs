//! End-to-end consistency scenarios: a real manager service on a TCP
//! socket, real clients with callback services, real races.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;

use capfs_client::client::{CapfsClient, ChunkData, ClientOptions, CommitOptions};
use capfs_client::server::{ManagerOptions, ManagerService};
use capfs_client::NULL_HASH;

const CHUNK: usize = 32;

/// Edge chunks rebuild against nothing; every test writes whole chunks or
/// into previously-unwritten space.
struct ZeroChunks;

impl ChunkData for ZeroChunks {
    fn read_chunk(&self, _name: &str, _chunk: i64) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }
}

fn force() -> CommitOptions {
    CommitOptions { force: true, desire_coherence: false }
}

fn checked() -> CommitOptions {
    CommitOptions { force: false, desire_coherence: false }
}

fn coherent() -> CommitOptions {
    CommitOptions { force: false, desire_coherence: true }
}

async fn spawn_manager_at(bind: SocketAddr) -> ManagerService {
    let mut opts = ManagerOptions::new(bind);
    opts.chunk_size = CHUNK;
    ManagerService::spawn(opts).await.expect("manager spawn")
}

async fn spawn_manager() -> ManagerService {
    spawn_manager_at("127.0.0.1:0".parse().unwrap()).await
}

async fn spawn_client() -> CapfsClient {
    let mut opts = ClientOptions::new(Arc::new(ZeroChunks));
    opts.chunk_size = CHUNK;
    opts.tuning.bcount = 128;
    CapfsClient::init(opts).await.expect("client init")
}

fn name_on(mgr: &ManagerService, path: &str) -> String {
    format!("capfs://{}{}", mgr.local_addr(), path)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hash_fetch_miss_then_hit() {
    let mgr = spawn_manager().await;
    let client = spawn_client().await;
    let name = name_on(&mgr, "/f");

    client.manager.open(&name, 0, 0o644).await.unwrap();
    let committed = client
        .committer
        .commit(&name, 0, &vec![0x11u8; CHUNK], force())
        .await
        .unwrap();
    assert_eq!(committed.len(), 1);

    // Drop the locally installed hash so the next read goes to the wire.
    client.hcache.clear(&name).unwrap();
    client.hcache.stats(true);

    let mut out = [NULL_HASH; 1];
    let ret = client.hcache.get(&name, 0, -1, &mut out).unwrap();
    assert_eq!(ret, 20);
    assert_eq!(out[0], committed[0]);

    let stats = client.hcache.stats(false);
    assert_eq!(stats.fetches, 1);
    assert_eq!(stats.misses, 1);

    let mut again = [NULL_HASH; 1];
    client.hcache.get(&name, 0, -1, &mut again).unwrap();
    assert_eq!(again[0], committed[0]);

    let stats = client.hcache.stats(false);
    assert_eq!(stats.fetches, 1, "hit must not refetch");
    assert_eq!(stats.hits, 1);

    client.finalize().await;
    mgr.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_commits_resolve_by_retry() {
    let mgr = spawn_manager().await;
    let a = spawn_client().await;
    let b = spawn_client().await;
    let name = name_on(&mgr, "/shared");

    a.manager.open(&name, 0, 0o644).await.unwrap();
    a.committer
        .commit(&name, 0, &vec![1u8; CHUNK], force())
        .await
        .unwrap();

    // Both clients cache the current hash of chunk 0.
    let mut out = [NULL_HASH; 1];
    a.hcache.get(&name, 0, -1, &mut out).unwrap();
    b.hcache.get(&name, 0, -1, &mut out).unwrap();

    // A wins the race; B's snapshot goes stale.
    let ha = a
        .committer
        .commit(&name, 0, &vec![2u8; CHUNK], checked())
        .await
        .unwrap();
    let hb = b
        .committer
        .commit(&name, 0, &vec![3u8; CHUNK], checked())
        .await
        .unwrap();
    assert_ne!(ha[0], hb[0]);

    // Last successful commit wins: the manager's recipe is B's.
    let (slots, _meta) = a.manager.get_hashes(&name, 0, 1).await.unwrap();
    assert!(slots[0].valid);
    assert_eq!(slots[0].hash, hb[0]);

    a.finalize().await;
    b.finalize().await;
    mgr.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coherent_commit_pushes_updates_to_peers() {
    let mgr = spawn_manager().await;
    let a = spawn_client().await;
    let b = spawn_client().await;
    let name = name_on(&mgr, "/coherent");

    a.manager.open(&name, 0, 0o644).await.unwrap();
    a.committer
        .commit(&name, 0, &vec![1u8; 2 * CHUNK], force())
        .await
        .unwrap();

    // B caches chunks 0..2, registering its interest with the manager.
    let mut out = [NULL_HASH; 2];
    b.hcache.get(&name, 0, -1, &mut out).unwrap();
    let fetches_before = b.hcache.stats(false).fetches;

    let ha = a
        .committer
        .commit(&name, 0, &vec![7u8; 2 * CHUNK], coherent())
        .await
        .unwrap();

    // The UPDATE callback lands asynchronously.
    let mut updated = false;
    for _ in 0..100 {
        let slots = b.hcache.peek(&name, 0, 2).unwrap();
        if slots.iter().enumerate().all(|(i, s)| s.valid && s.hash == ha[i]) {
            updated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(updated, "peer cache must converge on the committed hashes");

    // And the converged hashes serve without another wire fetch.
    let mut after = [NULL_HASH; 2];
    b.hcache.get(&name, 0, -1, &mut after).unwrap();
    assert_eq!(after[0], ha[0]);
    assert_eq!(after[1], ha[1]);
    assert_eq!(b.hcache.stats(false).fetches, fetches_before);

    a.finalize().await;
    b.finalize().await;
    mgr.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manager_restart_forces_reregistration() {
    let mgr = spawn_manager().await;
    let addr = mgr.local_addr();
    let client = spawn_client().await;
    let name = format!("capfs://{}/f", addr);

    client.manager.open(&name, 0, 0o644).await.unwrap();
    let cb_before = client.manager.cb_id().await;
    assert!(cb_before >= 0);

    client
        .committer
        .commit(&name, 0, &vec![5u8; CHUNK], force())
        .await
        .unwrap();
    assert!(client.hcache.peek(&name, 0, 1).unwrap()[0].valid);

    mgr.shutdown().await;
    let mgr2 = spawn_manager_at(addr).await;

    // Another client takes the first callback id of the new instance, so
    // a re-registration is observable as a different id.
    let other = spawn_client().await;
    other.manager.noop(addr).await.unwrap();

    // Any RPC completes on the retry path: dead connection, reconnect,
    // fresh registration, reissue.
    client.manager.open(&name, 0, 0o644).await.unwrap();
    let cb_after = client.manager.cb_id().await;
    assert_ne!(cb_before, cb_after, "restarted manager must hand out a fresh cb_id");

    // The manager lost track of what we cached, so the cache was dropped.
    assert!(!client.hcache.peek(&name, 0, 1).unwrap()[0].valid);

    client.finalize().await;
    other.finalize().await;
    mgr2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unlink_revokes_peer_caches() {
    let mgr = spawn_manager().await;
    let a = spawn_client().await;
    let b = spawn_client().await;
    let name = name_on(&mgr, "/doomed");

    a.manager.open(&name, 0, 0o644).await.unwrap();
    a.committer
        .commit(&name, 0, &vec![4u8; CHUNK], force())
        .await
        .unwrap();

    let mut out = [NULL_HASH; 1];
    b.hcache.get(&name, 0, -1, &mut out).unwrap();
    assert!(b.hcache.peek(&name, 0, 1).unwrap()[0].valid);

    a.manager.unlink(&name).await.unwrap();

    let mut revoked = false;
    for _ in 0..100 {
        if !b.hcache.peek(&name, 0, 1).unwrap()[0].valid {
            revoked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(revoked, "unlink must revoke peer hash caches");

    a.finalize().await;
    b.finalize().await;
    mgr.shutdown().await;
}
