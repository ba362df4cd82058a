//! VCLU server entry point.
//!
//! Loads the TOML configuration, wires the production collaborators into the
//! protocol engine, starts the dual-listener server, and blocks until
//! Ctrl-C.

use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use clu_server::collaborators::{BuiltinScriptEngine, LocalTftpd, TomlKeyStore};
use clu_server::config;
use clu_server::CluServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config()?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.server.log_level.clone())),
        )
        .init();

    info!(
        serial = cfg.device.serial,
        address = %cfg.device.address,
        port = cfg.network.command_port,
        "VCLU server starting"
    );

    let server = CluServer::start(
        &cfg,
        Box::new(BuiltinScriptEngine::new(cfg.device.serial)),
        Box::new(TomlKeyStore::new(PathBuf::from(&cfg.server.key_file))),
        Box::new(LocalTftpd::new()),
    )?;

    info!("VCLU server ready. Press Ctrl-C to exit.");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    server.shutdown();
    Ok(())
}
