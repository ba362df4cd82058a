//! The dual-listener server assembly.
//!
//! Two receive loops run on dedicated threads, one bound to the broadcast
//! address and one to the device's unicast address, both on the command
//! port. Each loop does a blocking receive with a short timeout so it can
//! observe the shutdown flag, and forwards raw datagrams to the single
//! dispatcher thread over a channel. Packets on one loop are processed
//! strictly sequentially; the reply for a packet is sent before the next
//! packet is dispatched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use clu_core::transport::{CluSocket, TransportError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::collaborators::{FileTransfer, KeyStore, ScriptEngine};
use crate::config::{ConfigError, ServerConfig};
use crate::dispatch::{DeviceIdentity, Dispatcher, Inbound, Scope};

/// How long a listener blocks in one receive before re-checking the running
/// flag. Also bounds how long a reply send can wait for the socket lock.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Capacity of the listener-to-dispatcher queue.
const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to spawn server thread: {0}")]
    Spawn(std::io::Error),
}

/// Handle to a running VCLU server.
pub struct CluServer {
    running: Arc<AtomicBool>,
    broadcast_addr: std::net::SocketAddr,
    unicast_addr: std::net::SocketAddr,
    workers: Vec<JoinHandle<()>>,
}

impl CluServer {
    /// Binds both listeners, derives the project key from the config, and
    /// starts the listener and dispatcher threads.
    pub fn start(
        config: &ServerConfig,
        script_engine: Box<dyn ScriptEngine>,
        key_store: Box<dyn KeyStore>,
        file_transfer: Box<dyn FileTransfer>,
    ) -> Result<Self, ServerError> {
        let project_key = config.project_key()?;
        let device = DeviceIdentity {
            serial: config.device.serial,
            mac: config.mac_bytes()?,
            address: config.device_address()?,
            default_iv: config.default_iv_bytes()?,
            pin: config.device.pin.clone(),
        };

        let broadcast_socket = Arc::new(CluSocket::bind(config.broadcast_bind_addr()?, false)?);
        let unicast_socket = Arc::new(CluSocket::bind(config.unicast_bind_addr()?, false)?);
        let broadcast_addr = broadcast_socket.local_addr()?;
        let unicast_addr = unicast_socket.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        let mut workers = Vec::with_capacity(3);
        workers.push(spawn_listener(
            "clu-broadcast-listen",
            Scope::Broadcast,
            broadcast_socket,
            tx.clone(),
            Arc::clone(&running),
        )?);
        workers.push(spawn_listener(
            "clu-unicast-listen",
            Scope::Unicast,
            unicast_socket,
            tx,
            Arc::clone(&running),
        )?);

        let dispatcher = Dispatcher::new(device, project_key, script_engine, key_store, file_transfer);
        workers.push(
            std::thread::Builder::new()
                .name("clu-dispatch".to_string())
                .spawn(move || dispatcher.run(rx))
                .map_err(ServerError::Spawn)?,
        );

        info!(%broadcast_addr, %unicast_addr, "VCLU server listening");
        Ok(Self {
            running,
            broadcast_addr,
            unicast_addr,
            workers,
        })
    }

    /// Address the broadcast listener actually bound (resolves port 0).
    pub fn broadcast_addr(&self) -> std::net::SocketAddr {
        self.broadcast_addr
    }

    /// Address the unicast listener actually bound.
    pub fn unicast_addr(&self) -> std::net::SocketAddr {
        self.unicast_addr
    }

    /// Cooperative shutdown: clears the running flag and joins every worker.
    /// Listeners exit within one receive timeout; the dispatcher exits when
    /// both listener senders are gone.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("server worker panicked during shutdown");
            }
        }
        info!("VCLU server stopped");
    }
}

fn spawn_listener(
    name: &str,
    scope: Scope,
    socket: Arc<CluSocket>,
    tx: mpsc::Sender<Inbound>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, ServerError> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || listen_loop(scope, socket, tx, running))
        .map_err(ServerError::Spawn)
}

/// One receive loop. Timeouts drive the shutdown check; an OS-level socket
/// fault is fatal to this loop only, and the owning process decides whether
/// to restart the server.
fn listen_loop(
    scope: Scope,
    socket: Arc<CluSocket>,
    tx: mpsc::Sender<Inbound>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match socket.try_receive(RECV_TIMEOUT) {
            Ok(None) => continue,
            Ok(Some(payload)) => {
                let inbound = Inbound {
                    scope,
                    payload,
                    socket: Arc::clone(&socket),
                };
                if tx.blocking_send(inbound).is_err() {
                    // Dispatcher gone; nothing left to feed.
                    break;
                }
            }
            Err(e) => {
                error!(?scope, error = %e, "listener socket failed, loop exiting");
                break;
            }
        }
    }
    info!(?scope, "listener stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BuiltinScriptEngine, LocalTftpd, TomlKeyStore};

    fn loopback_config() -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.device.address = "127.0.0.1".to_string();
        cfg.network.broadcast_bind = "127.0.0.1".to_string();
        cfg.network.command_port = 0;
        cfg
    }

    fn start_server(cfg: &ServerConfig) -> Result<CluServer, ServerError> {
        CluServer::start(
            cfg,
            Box::new(BuiltinScriptEngine::new(cfg.device.serial)),
            Box::new(TomlKeyStore::new(
                std::env::temp_dir().join(format!("clu_listener_{}.toml", std::process::id())),
            )),
            Box::new(LocalTftpd::new()),
        )
    }

    #[test]
    fn test_start_binds_both_listeners_on_distinct_ephemeral_ports() {
        // Arrange / Act
        let server = start_server(&loopback_config()).expect("server must start");

        // Assert
        let broadcast = server.broadcast_addr();
        let unicast = server.unicast_addr();
        assert_ne!(broadcast.port(), 0);
        assert_ne!(unicast.port(), 0);
        assert_ne!(broadcast.port(), unicast.port());

        server.shutdown();
    }

    #[test]
    fn test_both_listeners_share_one_fixed_command_port() {
        // The protocol uses a single command port; the two listeners can
        // coexist on it because they bind different addresses. Loopback
        // carries its own subnet broadcast address for this.
        let mut cfg = loopback_config();
        cfg.network.broadcast_bind = "127.255.255.255".to_string();
        cfg.network.command_port = 47911;

        let server = start_server(&cfg).expect("both listeners must bind the shared port");

        assert_eq!(server.broadcast_addr().port(), 47911);
        assert_eq!(server.unicast_addr().port(), 47911);
        assert_ne!(server.broadcast_addr().ip(), server.unicast_addr().ip());

        server.shutdown();
    }

    #[test]
    fn test_shutdown_joins_all_workers_promptly() {
        // Arrange
        let server = start_server(&loopback_config()).unwrap();

        // Act
        let started = std::time::Instant::now();
        server.shutdown();

        // Assert: bounded by a few receive timeouts, not an unbounded wait.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_start_fails_on_an_unroutable_bind_address() {
        let mut cfg = loopback_config();
        cfg.network.broadcast_bind = "192.0.2.1".to_string();

        let result = start_server(&cfg);

        assert!(matches!(result, Err(ServerError::Transport(_))));
    }
}
