//! The metadata manager service.
//!
//! One manager is authoritative per mountpoint: it owns the hash recipe
//! of every file, arbitrates write commits with a compare-and-swap under
//! a per-file lock, and keeps client caches coherent by pushing UPDATE
//! and REVOKE callbacks to everyone registered as caching a file.
//!
//! State is all in memory; durability of file data is the I/O servers'
//! business and the recipes can be rebuilt from them.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::wire::{
    self, CbReply, CbRequest, FileMeta, GetHashesArgs, HashIdent, MgrConnection, MgrReply,
    MgrReplyBody, MgrRequest, WcommitArgs, CAPFS_MAXHASHES, WCOMMIT_STALE,
};
use crate::HashSlot;

pub struct ManagerOptions {
    pub bind: SocketAddr,
    /// Unit of content hashing; used to account file sizes on commit.
    pub chunk_size: usize,
}

impl ManagerOptions {
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind, chunk_size: crate::config::CM_BSIZE }
    }
}

struct MgrFileData {
    meta: FileMeta,
    recipe: Vec<HashSlot>,
    /// Callback ids of clients caching hashes of this file.
    interest: HashSet<i32>,
}

struct MgrFile {
    data: RwLock<MgrFileData>,
}

struct MgrState {
    chunk_size: usize,
    /// `host:port` clients name this manager by; callbacks carry fully
    /// qualified names so they hit the right hash-cache entries.
    advertised: String,
    files: Mutex<HashMap<String, Arc<MgrFile>>>,
    /// Registered clients: callback id to callback service address.
    clients: Mutex<HashMap<i32, SocketAddr>>,
    next_cb_id: AtomicI32,
    /// Live per-connection tasks, killed on shutdown so a restarted
    /// instance on the same port cannot be confused with this one.
    serving: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

pub struct ManagerService {
    local_addr: SocketAddr,
    state: Arc<MgrState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ManagerService {
    pub async fn spawn(opts: ManagerOptions) -> Result<Self, Error> {
        let socket = match opts.bind {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        // The service must be restartable on the same port while old
        // connections linger.
        socket.set_reuseaddr(true)?;
        socket.bind(opts.bind)?;
        let listener = socket.listen(64)?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(MgrState {
            chunk_size: opts.chunk_size,
            advertised: local_addr.to_string(),
            files: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            next_cb_id: AtomicI32::new(1),
            serving: std::sync::Mutex::new(Vec::new()),
        });
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, state.clone(), rx));
        log::info!("manager listening on {}", local_addr);
        Ok(Self { local_addr, state, shutdown: Some(tx), task: Some(task) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        let serving: Vec<_> = self.state.serving.lock().unwrap().drain(..).collect();
        for task in serving {
            task.abort();
            let _ = task.await;
        }
        log::info!("manager shut down");
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<MgrState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let task =
                        tokio::spawn(serve_conn(wire::frame(stream), state.clone(), peer));
                    state.serving.lock().unwrap().push(task);
                }
                Err(err) => {
                    log::warn!("manager accept failed - {}", err);
                }
            },
        }
    }
}

async fn serve_conn(mut conn: MgrConnection, state: Arc<MgrState>, peer: SocketAddr) {
    loop {
        let req = match wire::recv_msg::<MgrRequest>(&mut conn).await {
            Ok(req) => req,
            Err(_) => break,
        };
        let reply = handle_request(&state, peer, req).await;
        if wire::send_msg(&mut conn, &reply).await.is_err() {
            break;
        }
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn new_meta(mode: u32) -> FileMeta {
    let t = now();
    FileMeta { size: 0, mode, uid: 0, gid: 0, nlink: 1, atime: t, mtime: t, ctime: t }
}

impl MgrState {
    async fn file(&self, name: &str, create: bool) -> Option<Arc<MgrFile>> {
        let mut files = self.files.lock().await;
        match files.get(name) {
            Some(file) => Some(file.clone()),
            None if create => {
                let file = Arc::new(MgrFile {
                    data: RwLock::new(MgrFileData {
                        meta: new_meta(0o644),
                        recipe: Vec::new(),
                        interest: HashSet::new(),
                    }),
                });
                files.insert(name.to_string(), file.clone());
                Some(file)
            }
            None => None,
        }
    }

    /// The name a client knows this file by.
    fn full_name(&self, path: &str) -> String {
        format!("capfs://{}{}", self.advertised, path)
    }

    async fn callback_targets(&self, interest: &HashSet<i32>, except: i32) -> Vec<SocketAddr> {
        let clients = self.clients.lock().await;
        interest
            .iter()
            .filter(|&&id| id != except)
            .filter_map(|id| clients.get(id).copied())
            .collect()
    }
}

/// Fire-and-forget a callback at a client; a client that cannot be
/// reached simply misses the notification and refetches later.
fn post_callback(addr: SocketAddr, req: CbRequest) {
    tokio::spawn(async move {
        let result = async {
            let stream = TcpStream::connect(addr).await?;
            let mut conn = wire::frame(stream);
            wire::send_msg(&mut conn, &req).await?;
            wire::recv_msg::<CbReply>(&mut conn).await?;
            Ok::<(), Error>(())
        }
        .await;
        if let Err(err) = result {
            log::warn!("callback to {} failed - {}", addr, err);
        }
    });
}

async fn handle_request(state: &Arc<MgrState>, peer: SocketAddr, req: MgrRequest) -> MgrReply {
    match req {
        MgrRequest::Register(args) => {
            let cb_id = state.next_cb_id.fetch_add(1, Ordering::SeqCst);
            let cb_addr = SocketAddr::new(peer.ip(), args.callback_port);
            state.clients.lock().await.insert(cb_id, cb_addr);
            log::info!("registered client {} with callback endpoint {}", cb_id, cb_addr);
            MgrReply::ok(MgrReplyBody::Register { cb_id })
        }

        MgrRequest::Noop | MgrRequest::Mount { .. } | MgrRequest::Umount { .. }
        | MgrRequest::Shutdown => MgrReply::ok(MgrReplyBody::Empty),

        MgrRequest::Open(args) => {
            let file = state.file(&args.name, true).await.unwrap();
            let data = file.data.read().await;
            MgrReply::ok(MgrReplyBody::Meta(data.meta))
        }

        MgrRequest::Close(args) => {
            match state.file(&args.name, false).await {
                Some(file) => {
                    if args.wrote {
                        // A dirty close means the recipe may have moved
                        // without coherence traffic; revoke peer caches.
                        let data = file.data.read().await;
                        let targets = state.callback_targets(&data.interest, args.cb_id).await;
                        let full = state.full_name(&args.name);
                        for addr in targets {
                            post_callback(addr, CbRequest::Revoke { name: full.clone() });
                        }
                    }
                    MgrReply::ok(MgrReplyBody::Empty)
                }
                None => MgrReply::error(libc::ENOENT),
            }
        }

        MgrRequest::Stat { name } | MgrRequest::Lstat { name } | MgrRequest::Fstat { name } => {
            match state.file(&name, false).await {
                Some(file) => MgrReply::ok(MgrReplyBody::Meta(file.data.read().await.meta)),
                None => MgrReply::error(libc::ENOENT),
            }
        }

        MgrRequest::Chmod { name, mode } | MgrRequest::Fchmod { name, mode } => {
            match state.file(&name, false).await {
                Some(file) => {
                    let mut data = file.data.write().await;
                    data.meta.mode = mode;
                    data.meta.ctime = now();
                    MgrReply::ok(MgrReplyBody::Empty)
                }
                None => MgrReply::error(libc::ENOENT),
            }
        }

        MgrRequest::Chown { name, uid, gid } | MgrRequest::Fchown { name, uid, gid } => {
            match state.file(&name, false).await {
                Some(file) => {
                    let mut data = file.data.write().await;
                    data.meta.uid = uid;
                    data.meta.gid = gid;
                    data.meta.ctime = now();
                    MgrReply::ok(MgrReplyBody::Empty)
                }
                None => MgrReply::error(libc::ENOENT),
            }
        }

        MgrRequest::Access { name, mode: _ } => match state.file(&name, false).await {
            Some(_) => MgrReply::ok(MgrReplyBody::Empty),
            None => MgrReply::error(libc::ENOENT),
        },

        MgrRequest::Truncate { name, size, cb_id } => {
            match state.file(&name, false).await {
                Some(file) => {
                    let mut data = file.data.write().await;
                    if size < 0 {
                        return MgrReply::error(libc::EINVAL);
                    }
                    let chunk_size = state.chunk_size as i64;
                    let keep = ((size + chunk_size - 1) / chunk_size) as usize;
                    data.recipe.truncate(keep);
                    data.meta.size = size;
                    data.meta.mtime = now();
                    // Cached hashes past (and at) the boundary are stale
                    // everywhere; cheapest correct move is a full revoke.
                    let targets = state.callback_targets(&data.interest, cb_id).await;
                    let full = state.full_name(&name);
                    for addr in targets {
                        post_callback(addr, CbRequest::Revoke { name: full.clone() });
                    }
                    MgrReply::ok(MgrReplyBody::Empty)
                }
                None => MgrReply::error(libc::ENOENT),
            }
        }

        MgrRequest::Utime { name, atime, mtime } => match state.file(&name, false).await {
            Some(file) => {
                let mut data = file.data.write().await;
                data.meta.atime = atime;
                data.meta.mtime = mtime;
                MgrReply::ok(MgrReplyBody::Empty)
            }
            None => MgrReply::error(libc::ENOENT),
        },

        MgrRequest::Ctime { name, ctime } => match state.file(&name, false).await {
            Some(file) => {
                file.data.write().await.meta.ctime = ctime;
                MgrReply::ok(MgrReplyBody::Empty)
            }
            None => MgrReply::error(libc::ENOENT),
        },

        MgrRequest::Lookup { name } => {
            let exists = state.files.lock().await.contains_key(&name);
            MgrReply::ok(MgrReplyBody::Lookup { exists })
        }

        MgrRequest::Statfs => {
            MgrReply::ok(MgrReplyBody::Statfs { total: i64::MAX / 2, free: i64::MAX / 4 })
        }

        MgrRequest::Unlink { name, cb_id } => {
            let removed = state.files.lock().await.remove(&name);
            match removed {
                Some(file) => {
                    let data = file.data.read().await;
                    let targets = state.callback_targets(&data.interest, cb_id).await;
                    let full = state.full_name(&name);
                    for addr in targets {
                        post_callback(addr, CbRequest::Revoke { name: full.clone() });
                    }
                    MgrReply::ok(MgrReplyBody::Empty)
                }
                None => MgrReply::error(libc::ENOENT),
            }
        }

        MgrRequest::Rename { from, to } => {
            let mut files = state.files.lock().await;
            match files.remove(&from) {
                Some(file) => {
                    files.insert(to, file);
                    MgrReply::ok(MgrReplyBody::Empty)
                }
                None => MgrReply::error(libc::ENOENT),
            }
        }

        MgrRequest::Link { from, to } => {
            let mut files = state.files.lock().await;
            match files.get(&from) {
                Some(file) => {
                    let file = file.clone();
                    file.data.write().await.meta.nlink += 1;
                    files.insert(to, file);
                    MgrReply::ok(MgrReplyBody::Empty)
                }
                None => MgrReply::error(libc::ENOENT),
            }
        }

        MgrRequest::Readlink { name } => match state.file(&name, false).await {
            Some(_) => MgrReply::error(libc::EINVAL),
            None => MgrReply::error(libc::ENOENT),
        },

        MgrRequest::Mkdir { name, mode } => {
            let mut files = state.files.lock().await;
            if files.contains_key(&name) {
                return MgrReply::error(libc::EEXIST);
            }
            let file = Arc::new(MgrFile {
                data: RwLock::new(MgrFileData {
                    meta: new_meta(mode | libc::S_IFDIR),
                    recipe: Vec::new(),
                    interest: HashSet::new(),
                }),
            });
            files.insert(name, file);
            MgrReply::ok(MgrReplyBody::Empty)
        }

        MgrRequest::Rmdir { name } => {
            let mut files = state.files.lock().await;
            match files.get(&name) {
                Some(file) => {
                    let is_dir = file.data.read().await.meta.mode & libc::S_IFDIR != 0;
                    if !is_dir {
                        return MgrReply::error(libc::ENOTDIR);
                    }
                    files.remove(&name);
                    MgrReply::ok(MgrReplyBody::Empty)
                }
                None => MgrReply::error(libc::ENOENT),
            }
        }

        MgrRequest::Getdents { name, offset, count } => {
            let files = state.files.lock().await;
            let prefix = if name.ends_with('/') { name } else { format!("{}/", name) };
            let mut names: Vec<String> = files
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            names.sort();
            let names = names
                .into_iter()
                .skip(offset.max(0) as usize)
                .take(count.max(0) as usize)
                .collect();
            MgrReply::ok(MgrReplyBody::Dents { names })
        }

        MgrRequest::IodInfo => MgrReply::ok(MgrReplyBody::IodInfo { iods: Vec::new() }),

        MgrRequest::GetHashes(args) => get_hashes(state, args).await,

        MgrRequest::Wcommit(args) => wcommit(state, args).await,
    }
}

async fn get_hashes(state: &Arc<MgrState>, args: GetHashesArgs) -> MgrReply {
    if args.nchunks <= 0 || args.begin_chunk < 0 || args.nchunks as usize > CAPFS_MAXHASHES {
        return MgrReply::error(libc::EINVAL);
    }
    let name = match &args.ident {
        HashIdent::ByName(name) => name.clone(),
        HashIdent::ByHandle(handle) => match String::from_utf8(handle.clone()) {
            Ok(name) => name,
            Err(_) => return MgrReply::error(libc::EINVAL),
        },
    };
    match state.file(&name, false).await {
        Some(file) => {
            let mut data = file.data.write().await;
            if args.cb_id >= 0 {
                data.interest.insert(args.cb_id);
            }
            let begin = args.begin_chunk as usize;
            let hashes: Vec<HashSlot> = if begin >= data.recipe.len() {
                Vec::new()
            } else {
                let end = std::cmp::min(begin + args.nchunks as usize, data.recipe.len());
                data.recipe[begin..end].to_vec()
            };
            log::debug!("gethashes {}: {} of {} slots", name, hashes.len(), args.nchunks);
            MgrReply::ok(MgrReplyBody::Hashes { hashes, meta: data.meta })
        }
        None => MgrReply::error(libc::ENOENT),
    }
}

fn slot_matches(old: &HashSlot, cur: &HashSlot) -> bool {
    if old.valid != cur.valid {
        return false;
    }
    !old.valid || old.hash == cur.hash
}

async fn wcommit(state: &Arc<MgrState>, args: WcommitArgs) -> MgrReply {
    let nchunks = args.new_hashes.len();
    if args.begin_chunk < 0 || nchunks == 0 || nchunks > CAPFS_MAXHASHES {
        return MgrReply::error(libc::EINVAL);
    }
    if !args.force && args.old_hashes.len() != nchunks {
        return MgrReply::error(libc::EINVAL);
    }

    let file = state.file(&args.name, true).await.unwrap();
    let mut data = file.data.write().await;

    let begin = args.begin_chunk as usize;
    if data.recipe.len() < begin + nchunks {
        data.recipe.resize(begin + nchunks, HashSlot::invalid());
    }

    if !args.force {
        let current = &data.recipe[begin..begin + nchunks];
        let matches = args
            .old_hashes
            .iter()
            .zip(current.iter())
            .all(|(old, cur)| slot_matches(old, cur));
        if !matches {
            log::debug!("wcommit {}: stale proposal for chunks {}+{}", args.name, begin, nchunks);
            return MgrReply {
                status: WCOMMIT_STALE,
                eno: libc::EAGAIN,
                body: MgrReplyBody::Wcommit { current_hashes: current.to_vec() },
            };
        }
    }

    data.recipe[begin..begin + nchunks].copy_from_slice(&args.new_hashes);
    let end_byte = args.begin_chunk * state.chunk_size as i64 + args.write_size;
    if end_byte > data.meta.size {
        data.meta.size = end_byte;
    }
    data.meta.mtime = now();
    log::debug!("wcommit {}: committed chunks {}+{}", args.name, begin, nchunks);

    if args.desire_coherence {
        let update_hashes: Vec<crate::ChunkHash> =
            args.new_hashes.iter().map(|s| s.hash).collect();
        let targets = state.callback_targets(&data.interest, args.cb_id).await;
        let full = state.full_name(&args.name);
        for addr in targets {
            post_callback(
                addr,
                CbRequest::Update {
                    name: full.clone(),
                    begin_chunk: args.begin_chunk,
                    hashes: update_hashes.clone(),
                },
            );
        }
    }

    MgrReply::ok(MgrReplyBody::Wcommit {
        current_hashes: data.recipe[begin..begin + nchunks].to_vec(),
    })
}
