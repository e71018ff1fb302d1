//! Typed client for the manager protocol.
//!
//! Connections are cached per manager address and reused across calls; a
//! transport failure discards the handle, flags the client for
//! re-registration and throws the whole hash cache away, since a manager
//! that restarted has no record of what we cached. Every call runs under
//! the protocol timeout and is retried at most once by the `*_retry`
//! entry points.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::{CAPFS_MAXHASHES, MGR_CLNT_TIMEOUT};
use crate::hcache::HashCache;
use crate::wire::{
    self, CloseArgs, FileMeta, GetHashesArgs, HashIdent, MgrConnection, MgrReply, MgrReplyBody,
    MgrRequest, OpenArgs, RegisterArgs, RpcError, WcommitArgs, WCOMMIT_STALE,
};
use crate::HashSlot;

/// Split a `capfs://host:port/path` name into the manager address and the
/// server-side path.
pub fn parse_name(name: &str) -> Result<(SocketAddr, String), RpcError> {
    let parsed = url::Url::parse(name)
        .map_err(|err| RpcError::Transport(format!("bad file name {} - {}", name, err)))?;
    if parsed.scheme() != "capfs" {
        return Err(RpcError::Transport(format!("bad scheme in {}", name)));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| RpcError::Transport(format!("no manager host in {}", name)))?;
    let port = parsed
        .port()
        .ok_or_else(|| RpcError::Transport(format!("no manager port in {}", name)))?;
    use std::net::ToSocketAddrs;
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|err| RpcError::Transport(format!("cannot resolve {} - {}", host, err)))?
        .next()
        .ok_or_else(|| RpcError::Transport(format!("cannot resolve {}", host)))?;
    Ok((addr, parsed.path().to_string()))
}

/// Outcome of a write commit.
#[derive(Debug)]
pub enum WcommitOutcome {
    /// The recipe was updated; these are the new authoritative hashes.
    Committed(Vec<HashSlot>),
    /// Someone else won the race; these are the current hashes.
    Stale(Vec<HashSlot>),
}

struct ClientState {
    conns: HashMap<SocketAddr, MgrConnection>,
    cb_id: i32,
    needs_register: bool,
}

pub struct ManagerClient {
    state: Mutex<ClientState>,
    callback_port: OnceCell<u16>,
    hcache: OnceCell<Arc<HashCache>>,
}

impl ManagerClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClientState {
                conns: HashMap::new(),
                cb_id: -1,
                needs_register: true,
            }),
            callback_port: OnceCell::new(),
            hcache: OnceCell::new(),
        }
    }

    /// Wire in the callback service port used during registration.
    pub fn set_callback_port(&self, port: u16) {
        let _ = self.callback_port.set(port);
    }

    /// Wire in the hash cache invalidated on transport failures.
    pub fn set_hcache(&self, hcache: Arc<HashCache>) {
        let _ = self.hcache.set(hcache);
    }

    pub async fn cb_id(&self) -> i32 {
        self.state.lock().await.cb_id
    }

    async fn connect(addr: SocketAddr) -> Result<MgrConnection, RpcError> {
        let stream = tokio::time::timeout(MGR_CLNT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::TimedOut)?
            .map_err(|err| RpcError::Transport(format!("connect to {} - {}", addr, err)))?;
        Ok(wire::frame(stream))
    }

    /// One request/reply exchange on the cached connection, connecting
    /// first if necessary. A failure drops the handle so the next call
    /// reconnects.
    async fn transact(
        state: &mut ClientState,
        addr: SocketAddr,
        req: &MgrRequest,
    ) -> Result<MgrReply, RpcError> {
        if !state.conns.contains_key(&addr) {
            let conn = Self::connect(addr).await?;
            state.conns.insert(addr, conn);
        }
        let conn = state.conns.get_mut(&addr).unwrap();

        let result = async {
            wire::send_msg(conn, req)
                .await
                .map_err(|err| RpcError::Transport(err.to_string()))?;
            match tokio::time::timeout(MGR_CLNT_TIMEOUT, wire::recv_msg::<MgrReply>(conn)).await {
                Err(_) => Err(RpcError::TimedOut),
                Ok(Err(err)) => Err(RpcError::Transport(err.to_string())),
                Ok(Ok(reply)) => Ok(reply),
            }
        }
        .await;

        if result.is_err() {
            state.conns.remove(&addr);
        }
        result
    }

    /// Issue a request. The manager may have restarted since we last
    /// talked to it, so registration (a fresh `cb_id`) happens first
    /// whenever the previous exchange failed.
    ///
    /// A transport failure throws the whole hash cache away - the manager
    /// has no record of what we cached. The invalidation runs after the
    /// client lock is released: a fetch holding hash-cache locks may be
    /// queued on that lock, and invalidating under it would close a cycle.
    pub async fn call(&self, addr: SocketAddr, req: MgrRequest) -> Result<MgrReply, RpcError> {
        let result = self.call_locked(addr, req).await;
        if let Err(err) = &result {
            if err.is_transport() {
                if let Some(hcache) = self.hcache.get() {
                    log::warn!("transport failure ({}), invalidating the hash cache", err);
                    hcache.invalidate_all();
                }
            }
        }
        result
    }

    async fn call_locked(
        &self,
        addr: SocketAddr,
        mut req: MgrRequest,
    ) -> Result<MgrReply, RpcError> {
        let mut state = self.state.lock().await;

        if state.needs_register || state.cb_id < 0 {
            let port = self.callback_port.get().copied().unwrap_or(0);
            log::info!("registering callback service (port {}) with {}", port, addr);
            let reg = MgrRequest::Register(RegisterArgs { callback_port: port });
            match Self::transact(&mut state, addr, &reg).await {
                Ok(reply) if reply.status == 0 => match reply.body {
                    MgrReplyBody::Register { cb_id } => {
                        log::info!("registered with {} as callback id {}", addr, cb_id);
                        state.cb_id = cb_id;
                        state.needs_register = false;
                    }
                    _ => return Err(RpcError::Transport("malformed register reply".into())),
                },
                Ok(reply) => return Err(RpcError::Server(reply.eno)),
                Err(err) => {
                    state.needs_register = true;
                    return Err(err);
                }
            }
        }

        // Stamp our callback id into the requests that carry one.
        let cb_id = state.cb_id;
        match &mut req {
            MgrRequest::Open(args) => args.cb_id = cb_id,
            MgrRequest::Close(args) => args.cb_id = cb_id,
            MgrRequest::Truncate { cb_id: c, .. } => *c = cb_id,
            MgrRequest::Unlink { cb_id: c, .. } => *c = cb_id,
            MgrRequest::GetHashes(args) => args.cb_id = cb_id,
            MgrRequest::Wcommit(args) => args.cb_id = cb_id,
            _ => {}
        }

        match Self::transact(&mut state, addr, &req).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                state.needs_register = true;
                Err(err)
            }
        }
    }

    /// Like [`ManagerClient::call`], but a transport failure is retried
    /// once (after re-registration). Never more.
    pub async fn call_retry(
        &self,
        addr: SocketAddr,
        req: MgrRequest,
    ) -> Result<MgrReply, RpcError> {
        match self.call(addr, req.clone()).await {
            Err(err) if err.is_transport() => {
                log::warn!("rpc to {} failed ({}), retrying once", addr, err);
                self.call(addr, req).await
            }
            other => other,
        }
    }

    fn expect_ok(reply: MgrReply) -> Result<MgrReplyBody, RpcError> {
        if reply.status != 0 {
            return Err(RpcError::Server(reply.eno));
        }
        Ok(reply.body)
    }

    fn expect_meta(reply: MgrReply) -> Result<FileMeta, RpcError> {
        match Self::expect_ok(reply)? {
            MgrReplyBody::Meta(meta) => Ok(meta),
            _ => Err(RpcError::Transport("malformed reply".into())),
        }
    }

    // --- Typed wrappers ----------------------------------------------

    pub async fn noop(&self, addr: SocketAddr) -> Result<(), RpcError> {
        Self::expect_ok(self.call_retry(addr, MgrRequest::Noop).await?).map(|_| ())
    }

    pub async fn mount(&self, addr: SocketAddr, dir: &str) -> Result<(), RpcError> {
        let req = MgrRequest::Mount { dir: dir.to_string() };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn umount(&self, addr: SocketAddr, dir: &str) -> Result<(), RpcError> {
        let req = MgrRequest::Umount { dir: dir.to_string() };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn open(&self, name: &str, flags: i32, mode: u32) -> Result<FileMeta, RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Open(OpenArgs { name: path, flags, mode, cb_id: -1 });
        Self::expect_meta(self.call_retry(addr, req).await?)
    }

    pub async fn close(&self, name: &str, wrote: bool) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Close(CloseArgs { name: path, wrote, cb_id: -1 });
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn stat(&self, name: &str) -> Result<FileMeta, RpcError> {
        let (addr, path) = parse_name(name)?;
        Self::expect_meta(self.call_retry(addr, MgrRequest::Stat { name: path }).await?)
    }

    pub async fn lstat(&self, name: &str) -> Result<FileMeta, RpcError> {
        let (addr, path) = parse_name(name)?;
        Self::expect_meta(self.call_retry(addr, MgrRequest::Lstat { name: path }).await?)
    }

    pub async fn fstat(&self, name: &str) -> Result<FileMeta, RpcError> {
        let (addr, path) = parse_name(name)?;
        Self::expect_meta(self.call_retry(addr, MgrRequest::Fstat { name: path }).await?)
    }

    pub async fn chmod(&self, name: &str, mode: u32) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Chmod { name: path, mode };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn fchmod(&self, name: &str, mode: u32) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Fchmod { name: path, mode };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn chown(&self, name: &str, uid: u32, gid: u32) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Chown { name: path, uid, gid };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn fchown(&self, name: &str, uid: u32, gid: u32) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Fchown { name: path, uid, gid };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn access(&self, name: &str, mode: u32) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Access { name: path, mode };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn truncate(&self, name: &str, size: i64) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Truncate { name: path, size, cb_id: -1 };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn utime(&self, name: &str, atime: i64, mtime: i64) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Utime { name: path, atime, mtime };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn ctime(&self, name: &str, ctime: i64) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Ctime { name: path, ctime };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn lookup(&self, name: &str) -> Result<bool, RpcError> {
        let (addr, path) = parse_name(name)?;
        match Self::expect_ok(self.call_retry(addr, MgrRequest::Lookup { name: path }).await?)? {
            MgrReplyBody::Lookup { exists } => Ok(exists),
            _ => Err(RpcError::Transport("malformed reply".into())),
        }
    }

    pub async fn statfs(&self, addr: SocketAddr) -> Result<(i64, i64), RpcError> {
        match Self::expect_ok(self.call_retry(addr, MgrRequest::Statfs).await?)? {
            MgrReplyBody::Statfs { total, free } => Ok((total, free)),
            _ => Err(RpcError::Transport("malformed reply".into())),
        }
    }

    pub async fn unlink(&self, name: &str) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Unlink { name: path, cb_id: -1 };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), RpcError> {
        let (addr, from_path) = parse_name(from)?;
        let (_, to_path) = parse_name(to)?;
        let req = MgrRequest::Rename { from: from_path, to: to_path };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn link(&self, from: &str, to: &str) -> Result<(), RpcError> {
        let (addr, from_path) = parse_name(from)?;
        let (_, to_path) = parse_name(to)?;
        let req = MgrRequest::Link { from: from_path, to: to_path };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn readlink(&self, name: &str) -> Result<String, RpcError> {
        let (addr, path) = parse_name(name)?;
        match Self::expect_ok(self.call_retry(addr, MgrRequest::Readlink { name: path }).await?)? {
            MgrReplyBody::Readlink { target } => Ok(target),
            _ => Err(RpcError::Transport("malformed reply".into())),
        }
    }

    pub async fn mkdir(&self, name: &str, mode: u32) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Mkdir { name: path, mode };
        Self::expect_ok(self.call_retry(addr, req).await?).map(|_| ())
    }

    pub async fn rmdir(&self, name: &str) -> Result<(), RpcError> {
        let (addr, path) = parse_name(name)?;
        Self::expect_ok(self.call_retry(addr, MgrRequest::Rmdir { name: path }).await?).map(|_| ())
    }

    pub async fn getdents(
        &self,
        name: &str,
        offset: i64,
        count: i64,
    ) -> Result<Vec<String>, RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Getdents { name: path, offset, count };
        match Self::expect_ok(self.call_retry(addr, req).await?)? {
            MgrReplyBody::Dents { names } => Ok(names),
            _ => Err(RpcError::Transport("malformed reply".into())),
        }
    }

    pub async fn iod_info(&self, addr: SocketAddr) -> Result<Vec<String>, RpcError> {
        match Self::expect_ok(self.call_retry(addr, MgrRequest::IodInfo).await?)? {
            MgrReplyBody::IodInfo { iods } => Ok(iods),
            _ => Err(RpcError::Transport("malformed reply".into())),
        }
    }

    /// Fetch up to `CAPFS_MAXHASHES` recipe entries. Registers the caller
    /// for coherence callbacks on the file as a side effect.
    pub async fn get_hashes(
        &self,
        name: &str,
        begin_chunk: i64,
        nchunks: usize,
    ) -> Result<(Vec<HashSlot>, FileMeta), RpcError> {
        if nchunks > CAPFS_MAXHASHES {
            log::error!(
                "gethashes of {} chunks exceeds the {} per-call bound",
                nchunks,
                CAPFS_MAXHASHES
            );
            return Err(RpcError::Server(libc::EINVAL));
        }
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::GetHashes(GetHashesArgs {
            ident: HashIdent::ByName(path),
            begin_chunk,
            nchunks: nchunks as i64,
            cb_id: -1,
        });
        match Self::expect_ok(self.call_retry(addr, req).await?)? {
            MgrReplyBody::Hashes { hashes, meta } => {
                if hashes.len() > nchunks {
                    log::error!(
                        "manager returned more hashes ({}) than requested ({})",
                        hashes.len(),
                        nchunks
                    );
                    return Err(RpcError::Server(libc::EINVAL));
                }
                Ok((hashes, meta))
            }
            _ => Err(RpcError::Transport("malformed reply".into())),
        }
    }

    /// Propose a recipe update. `Ok` covers both protocol outcomes; only
    /// transport and server errors become `Err`.
    pub async fn wcommit(
        &self,
        name: &str,
        begin_chunk: i64,
        write_size: i64,
        old_hashes: Vec<HashSlot>,
        new_hashes: Vec<HashSlot>,
        force: bool,
        desire_coherence: bool,
    ) -> Result<WcommitOutcome, RpcError> {
        let (addr, path) = parse_name(name)?;
        let req = MgrRequest::Wcommit(WcommitArgs {
            name: path,
            begin_chunk,
            write_size,
            old_hashes,
            new_hashes,
            force,
            desire_coherence,
            cb_id: -1,
        });
        let reply = self.call_retry(addr, req).await?;
        let current = match reply.body {
            MgrReplyBody::Wcommit { current_hashes } => current_hashes,
            _ => return Err(RpcError::Transport("malformed reply".into())),
        };
        if reply.status == 0 {
            Ok(WcommitOutcome::Committed(current))
        } else if reply.status == WCOMMIT_STALE {
            Ok(WcommitOutcome::Stale(current))
        } else {
            Err(RpcError::Server(reply.eno))
        }
    }
}

impl Default for ManagerClient {
    fn default() -> Self {
        Self::new()
    }
}

/// The production hash-fetch backend: `gethashes` against the manager,
/// bridged onto the synchronous cache path.
pub struct ManagerFetcher {
    client: Arc<ManagerClient>,
}

impl ManagerFetcher {
    pub fn new(client: Arc<ManagerClient>) -> Self {
        Self { client }
    }
}

impl crate::hcache::HashFetch for ManagerFetcher {
    fn fetch_hashes(
        &self,
        name: &str,
        begin_chunk: i64,
        nchunks: usize,
    ) -> Result<Vec<HashSlot>, anyhow::Error> {
        let client = self.client.clone();
        let name = name.to_string();
        let (mut slots, _meta) = crate::tools::runtime::block_on(async move {
            client.get_hashes(&name, begin_chunk, nchunks).await
        })?;
        // The manager may return fewer slots than asked; the rest simply
        // do not exist yet.
        slots.resize(nchunks, HashSlot::invalid());
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_name_splits_manager_and_path() {
        let (addr, path) = parse_name("capfs://127.0.0.1:7000/dir/file").unwrap();
        assert_eq!(addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(path, "/dir/file");
    }

    #[test]
    fn parse_name_rejects_foreign_schemes() {
        assert!(parse_name("http://127.0.0.1:7000/f").is_err());
        assert!(parse_name("capfs://127.0.0.1/f").is_err(), "missing port");
    }
}
