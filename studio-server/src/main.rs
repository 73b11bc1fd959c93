//! Standalone collaboration server.
//!
//! Configuration comes from `STUDIO_COLLAB_*` environment variables and log
//! verbosity from `RUST_LOG`. Ctrl-C stops accepting and exits.

use log::{error, info};
use studio_collab::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    info!(
        "Starting studio-server on {} (outbound capacity {}, reap every {:?})",
        config.bind_addr, config.outbound_capacity, config.reap_interval
    );

    let server = SyncServer::new(config);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };

    if let Err(e) = server.run_until(shutdown).await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
    info!("studio-server stopped");
}
