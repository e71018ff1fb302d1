//! Message types and framing shared by the manager client, the manager
//! service, and the callback service.
//!
//! Every endpoint speaks length-delimited frames (4-byte big-endian length
//! prefix) carrying one JSON-encoded message. Connections are strictly
//! request/reply: one outstanding request per connection, replies in
//! order, so no sequence numbers are needed.

use anyhow::{format_err, Error};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::HashSlot;

pub use crate::config::CAPFS_MAXHASHES;

/// `wcommit` reply status: the proposed old hashes no longer match the
/// recipe and the commit was rejected.
pub const WCOMMIT_STALE: i32 = 1;

/// RPC failure categories, each mapping onto the errno the caller sees.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    /// The transport died under the call; the connection is discarded and
    /// the client re-registers before its next request.
    #[error("remote i/o error - {0}")]
    Transport(String),
    #[error("rpc timed out")]
    TimedOut,
    /// The server processed the call and returned an errno.
    #[error("server returned errno {0}")]
    Server(i32),
}

impl RpcError {
    pub fn errno(&self) -> i32 {
        match self {
            RpcError::Transport(_) => libc::EREMOTEIO,
            RpcError::TimedOut => libc::ETIMEDOUT,
            RpcError::Server(eno) => *eno,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::TimedOut)
    }
}

pub type MgrConnection = Framed<TcpStream, LengthDelimitedCodec>;

pub fn frame(stream: TcpStream) -> MgrConnection {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .new_framed(stream)
}

pub async fn send_msg<T: Serialize>(conn: &mut MgrConnection, msg: &T) -> Result<(), Error> {
    let data = serde_json::to_vec(msg)?;
    conn.send(Bytes::from(data)).await?;
    Ok(())
}

pub async fn recv_msg<T: DeserializeOwned>(conn: &mut MgrConnection) -> Result<T, Error> {
    let frame = conn
        .next()
        .await
        .ok_or_else(|| format_err!("connection closed"))??;
    Ok(serde_json::from_slice(&frame)?)
}

/// File metadata as the manager reports it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileMeta {
    pub size: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// How a file is identified in hash operations.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum HashIdent {
    ByName(String),
    ByHandle(Vec<u8>),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RegisterArgs {
    /// TCP port of the caller's callback service; the manager combines it
    /// with the peer address of the registering connection.
    pub callback_port: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OpenArgs {
    pub name: String,
    pub flags: i32,
    pub mode: u32,
    pub cb_id: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CloseArgs {
    pub name: String,
    /// Whether this descriptor wrote; a dirty close revokes peer caches.
    pub wrote: bool,
    pub cb_id: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GetHashesArgs {
    pub ident: HashIdent,
    pub begin_chunk: i64,
    pub nchunks: i64,
    /// Registers the caller for coherence callbacks on this file.
    pub cb_id: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WcommitArgs {
    pub name: String,
    pub begin_chunk: i64,
    pub write_size: i64,
    pub old_hashes: Vec<HashSlot>,
    pub new_hashes: Vec<HashSlot>,
    /// Skip the compare step; sole-writer fast path.
    pub force: bool,
    /// Fan UPDATE callbacks out to other caching clients on success.
    pub desire_coherence: bool,
    pub cb_id: i32,
}

/// The manager protocol. Every method except `Wcommit`, `Unlink`,
/// `Rename`, `Link`, `Truncate`, `Mkdir` and `Rmdir` is idempotent.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum MgrRequest {
    Register(RegisterArgs),
    Noop,
    Mount { dir: String },
    Umount { dir: String },
    Shutdown,
    Open(OpenArgs),
    Close(CloseArgs),
    Stat { name: String },
    Lstat { name: String },
    Fstat { name: String },
    Chmod { name: String, mode: u32 },
    Fchmod { name: String, mode: u32 },
    Chown { name: String, uid: u32, gid: u32 },
    Fchown { name: String, uid: u32, gid: u32 },
    Access { name: String, mode: u32 },
    Truncate { name: String, size: i64, cb_id: i32 },
    Utime { name: String, atime: i64, mtime: i64 },
    Ctime { name: String, ctime: i64 },
    Lookup { name: String },
    Statfs,
    Unlink { name: String, cb_id: i32 },
    Rename { from: String, to: String },
    Link { from: String, to: String },
    Readlink { name: String },
    Mkdir { name: String, mode: u32 },
    Rmdir { name: String },
    Getdents { name: String, offset: i64, count: i64 },
    IodInfo,
    GetHashes(GetHashesArgs),
    Wcommit(WcommitArgs),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum MgrReplyBody {
    Empty,
    Register { cb_id: i32 },
    Meta(FileMeta),
    Lookup { exists: bool },
    Readlink { target: String },
    Dents { names: Vec<String> },
    Statfs { total: i64, free: i64 },
    IodInfo { iods: Vec<String> },
    Hashes { hashes: Vec<HashSlot>, meta: FileMeta },
    Wcommit { current_hashes: Vec<HashSlot> },
}

/// `(status, eno)` plus the operation-specific payload. `status == 0`
/// means success; any other value carries a unix errno in `eno` (with
/// [`WCOMMIT_STALE`] as the one protocol-level status).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MgrReply {
    pub status: i32,
    pub eno: i32,
    pub body: MgrReplyBody,
}

impl MgrReply {
    pub fn ok(body: MgrReplyBody) -> Self {
        Self { status: 0, eno: 0, body }
    }

    pub fn error(eno: i32) -> Self {
        Self { status: -1, eno, body: MgrReplyBody::Empty }
    }
}

/// Manager-to-client callback methods.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum CbRequest {
    /// Drop every cached hash of the file.
    Revoke { name: String },
    /// Install fresh authoritative hashes for a chunk range.
    Update {
        name: String,
        begin_chunk: i64,
        hashes: Vec<crate::ChunkHash>,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CbReply {
    pub status: i32,
    pub eno: i32,
}

impl CbReply {
    pub fn ok() -> Self {
        Self { status: 0, eno: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = MgrRequest::Wcommit(WcommitArgs {
            name: "capfs://localhost:7000/f".to_string(),
            begin_chunk: 3,
            write_size: 16384,
            old_hashes: vec![HashSlot::invalid()],
            new_hashes: vec![HashSlot::new([0xab; 20])],
            force: false,
            desire_coherence: true,
            cb_id: 7,
        });
        let data = serde_json::to_vec(&req).unwrap();
        let back: MgrRequest = serde_json::from_slice(&data).unwrap();
        match back {
            MgrRequest::Wcommit(args) => {
                assert_eq!(args.begin_chunk, 3);
                assert_eq!(args.new_hashes[0].hash, [0xab; 20]);
                assert!(!args.old_hashes[0].valid);
            }
            other => panic!("decoded wrong variant: {:?}", other),
        }
    }

    #[test]
    fn reply_roundtrip() {
        let reply = MgrReply::ok(MgrReplyBody::Hashes {
            hashes: vec![HashSlot::new([1; 20]), HashSlot::invalid()],
            meta: FileMeta { size: 4096, ..Default::default() },
        });
        let data = serde_json::to_vec(&reply).unwrap();
        let back: MgrReply = serde_json::from_slice(&data).unwrap();
        assert_eq!(back.status, 0);
        match back.body {
            MgrReplyBody::Hashes { hashes, meta } => {
                assert_eq!(hashes.len(), 2);
                assert!(hashes[0].valid && !hashes[1].valid);
                assert_eq!(meta.size, 4096);
            }
            other => panic!("decoded wrong variant: {:?}", other),
        }
    }
}
