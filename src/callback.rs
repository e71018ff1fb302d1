//! The callback service: the local TCP endpoint managers push cache
//! coherence traffic to.
//!
//! The service binds a dynamically assigned port which the client reports
//! to every manager it registers with. Each inbound connection runs in
//! its own task, so a REVOKE against one file never blocks an UPDATE for
//! another. Handlers enter the hash cache exclusively through its public
//! API and run on the blocking pool since cache internals take plain
//! mutexes.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::hcache::HashCache;
use crate::wire::{self, CbReply, CbRequest, MgrConnection};

pub struct CallbackServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    pub async fn spawn(hcache: Arc<HashCache>) -> Result<Self, Error> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, hcache, rx));
        log::info!("callback service listening on {}", local_addr);
        Ok(Self { local_addr, shutdown: Some(tx), task: Some(task) })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    hcache: Arc<HashCache>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!("callback connection from {}", peer);
                    tokio::spawn(serve_conn(wire::frame(stream), hcache.clone()));
                }
                Err(err) => {
                    log::warn!("callback accept failed - {}", err);
                }
            },
        }
    }
    log::debug!("callback service shut down");
}

async fn serve_conn(mut conn: MgrConnection, hcache: Arc<HashCache>) {
    loop {
        let req = match wire::recv_msg::<CbRequest>(&mut conn).await {
            Ok(req) => req,
            Err(_) => break,
        };
        let reply = dispatch(req, &hcache).await;
        if wire::send_msg(&mut conn, &reply).await.is_err() {
            break;
        }
    }
}

async fn dispatch(req: CbRequest, hcache: &Arc<HashCache>) -> CbReply {
    let hcache = hcache.clone();
    let result = tokio::task::spawn_blocking(move || match req {
        CbRequest::Revoke { name } => {
            log::debug!("callback: revoke {}", name);
            hcache.clear(&name).map(|_| ())
        }
        CbRequest::Update { name, begin_chunk, hashes } => {
            log::debug!("callback: update {} chunks {}+{}", name, begin_chunk, hashes.len());
            hcache.put(&name, begin_chunk, &hashes).map(|_| ())
        }
    })
    .await;

    match result {
        Ok(Ok(())) => CbReply::ok(),
        Ok(Err(err)) => CbReply { status: -1, eno: err.errno() },
        Err(_) => CbReply { status: -1, eno: libc::EIO },
    }
}
