//! Core server implementation.
//!
//! [`GameServer`] binds the listening sockets and runs the main loop: a
//! single task that owns [`ServerState`] and reacts to new connections,
//! connection events, jobs posted through [`MainHandle`] and the shutdown
//! token, one at a time.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bundle::DirectoryBundle;
use crate::config::ServerConfig;
use crate::engine::dispatchers::host_handlers;
use crate::error::ServerError;
use crate::server::auth::OpenAuthenticator;
use crate::server::discovery::run_discovery;
use crate::server::handle::{MainHandle, MainJob};
use crate::server::lobby::BasicLobby;
use crate::server::state::{Collaborators, ServerState};

/// The tabletop game server.
///
/// # Architecture
///
/// * **Main loop**: owns every registry; nothing else mutates them
/// * **Connections**: one reader and one writer task per client socket
/// * **Schedulers**: worker threads, each with its own rule engine process
/// * **Discovery**: a UDP responder for LAN server lists
///
/// The server knows nothing about game rules. Rooms are created on behalf of
/// the [`Lobby`](crate::server::Lobby) and their traffic is forwarded to the
/// rule engine that hosts them.
pub struct GameServer {
    config: ServerConfig,
    collaborators: Collaborators,
    main: MainHandle,
    jobs: Mutex<Option<mpsc::UnboundedReceiver<MainJob>>>,
    shutdown: CancellationToken,
}

impl GameServer {
    /// Creates a server with the stock collaborators: a directory bundle,
    /// an authenticator that admits any non-empty name and the basic lobby.
    pub fn new(config: ServerConfig) -> Self {
        let collaborators = Collaborators {
            bundle: Arc::new(DirectoryBundle::new(config.bundle_directory.clone())),
            authenticator: Arc::new(OpenAuthenticator::new()),
            lobby: Arc::new(BasicLobby),
        };
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(config: ServerConfig, collaborators: Collaborators) -> Self {
        let (main, jobs) = MainHandle::new(config.main_call_timeout);
        Self {
            config,
            collaborators,
            main,
            jobs: Mutex::new(Some(jobs)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle for posting work onto the main loop.
    pub fn main_handle(&self) -> MainHandle {
        self.main.clone()
    }

    /// Runs the server until [`GameServer::shutdown`] is called.
    ///
    /// # Startup Sequence
    ///
    /// 1. Load the settings document and fingerprint the rule bundle
    /// 2. Bind the TCP listener and the UDP discovery socket
    /// 3. Run the main loop
    /// 4. Close every connection and retire every scheduler
    ///
    /// Settings, bundle and bind failures abort startup.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| ServerError::Internal("server was already started".to_string()))?;

        info!("🚀 Starting tabletop server on {}", self.config.bind_address);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut state = ServerState::new(
            self.config.clone(),
            self.collaborators.clone(),
            self.main.clone(),
            events_tx,
            host_handlers(self.main.clone()),
        )?;

        let listener = bind_listener(self.config.bind_address)?;
        info!("✅ Listening on tcp://{}", self.config.bind_address);

        let discovery = UdpSocket::bind(self.config.discovery_address)
            .await
            .map_err(|e| ServerError::Network(format!("Discovery bind failed: {e}")))?;
        tokio::spawn(run_discovery(
            discovery,
            self.main.clone(),
            self.shutdown.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => state.accept(stream, peer),
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                Some(event) = events.recv() => state.handle_event(event),
                Some(job) = jobs.recv() => job(&mut state),
            }
        }

        info!("🧹 Performing server cleanup...");
        state.shutdown().await;
        info!("✅ Server stopped");
        Ok(())
    }

    /// Asks a running (or about to run) server to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn bind_listener(address: SocketAddr) -> Result<TcpListener, ServerError> {
    let domain = if address.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("Failed to set SO_REUSEADDR: {}", e);
    }
    socket
        .bind(&address.into())
        .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
    socket
        .listen(1024)
        .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ServerError::Network(format!("Nonblocking mode failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    TcpListener::from_std(std_listener)
        .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &tempfile::TempDir) -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            discovery_address: "127.0.0.1:0".parse().unwrap(),
            settings_path: dir.path().join("settings.json"),
            bundle_directory: dir.path().to_path_buf(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_shutdown_before_start_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let server = GameServer::new(test_config(&dir));
        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), server.start())
            .await
            .unwrap()
            .unwrap();

        // the main loop receiver is gone for good
        assert!(matches!(server.start().await, Err(ServerError::Internal(_))));
    }

    #[tokio::test]
    async fn test_bad_settings_abort_startup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "{ not json").unwrap();
        let server = GameServer::new(test_config(&dir));
        assert!(matches!(server.start().await, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_bundle_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.bundle_directory = dir.path().join("nowhere");
        let server = GameServer::new(config);
        assert!(matches!(server.start().await, Err(ServerError::Bundle(_))));
    }

    #[tokio::test]
    async fn test_main_handle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(GameServer::new(test_config(&dir)));
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };

        let summary = server
            .main_handle()
            .call(|state| state.summary())
            .await
            .unwrap();
        assert_eq!(summary.online, 0);
        assert_eq!(summary.capacity, 100);

        server.shutdown();
        running.await.unwrap().unwrap();
    }
}
