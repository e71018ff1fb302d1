//! Standalone metadata manager daemon.

use anyhow::{format_err, Error};

use capfs_client::config;
use capfs_client::server::{ManagerOptions, ManagerService};

#[tokio::main]
async fn main() -> Result<(), Error> {
    config::init_logging();

    let bind = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CAPFS_MANAGER_BIND").ok())
        .unwrap_or_else(|| "0.0.0.0:7000".to_string());
    let bind = bind
        .parse()
        .map_err(|err| format_err!("bad bind address {} - {}", bind, err))?;

    let mut opts = ManagerOptions::new(bind);
    opts.chunk_size = config::CacheTuning::from_env().chunk_size;

    let service = ManagerService::spawn(opts).await?;
    log::info!("capfs manager serving on {}", service.local_addr());

    tokio::signal::ctrl_c().await?;
    service.shutdown().await;
    Ok(())
}
