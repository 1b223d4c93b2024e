//! Rule engine subprocess bridge.
//!
//! The game rules run in a child process that talks RPC over its stdin and
//! stdout. [`EngineBridge`] launches the child inside the rule bundle
//! directory, waits for its greeting line, and then exposes one-way calls into
//! the engine while dispatching the engine's own calls through a
//! [`HandlerTable`].
//!
//! A bridge must be created and used on a single thread inside a `LocalSet`;
//! each scheduler thread owns exactly one.

pub mod dispatchers;
pub mod rpc;

pub use rpc::{HandlerTable, RpcEndpoint};

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::BridgeError;
use crate::protocol::rpc::RpcValue;

/// Host to engine method names.
pub mod methods {
    pub const HANDLE_REQUEST: &str = "HandleRequest";
    pub const RESUME_ROOM: &str = "ResumeRoom";
    pub const SET_PLAYER_STATE: &str = "SetPlayerState";
    pub const ADD_OBSERVER: &str = "AddObserver";
    pub const REMOVE_OBSERVER: &str = "RemoveObserver";
    pub const BYE: &str = "bye";
}

/// A running rule engine process and its RPC channel.
pub struct EngineBridge {
    child: Child,
    endpoint: RpcEndpoint,
    shutdown_timeout: Duration,
}

impl EngineBridge {
    /// Launches the engine in `directory` and completes the handshake.
    ///
    /// Fails when the program cannot be started, or when it exits or stays
    /// silent instead of printing a greeting line within the handshake
    /// timeout.
    pub async fn spawn(
        config: &EngineConfig,
        directory: &Path,
        handlers: HandlerTable,
    ) -> Result<Self, BridgeError> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .current_dir(directory)
            .env(&config.rpc_mode_var, &config.rpc_mode_value)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{}: {e}", config.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Spawn("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn("child stdout not captured".to_string()))?;

        let mut stdout = BufReader::new(stdout);
        let mut greeting = Vec::new();
        match tokio::time::timeout(
            config.handshake_timeout,
            stdout.read_until(b'\n', &mut greeting),
        )
        .await
        {
            Err(_) => {
                let _ = child.start_kill();
                return Err(BridgeError::Handshake(format!(
                    "no greeting within {:?}",
                    config.handshake_timeout
                )));
            }
            Ok(Err(e)) => return Err(BridgeError::Io(e)),
            Ok(Ok(0)) => {
                return Err(BridgeError::Handshake(
                    "engine exited before greeting".to_string(),
                ))
            }
            Ok(Ok(_)) => {}
        }

        debug!(
            "Engine {:?} greeted with {:?}",
            child.id(),
            String::from_utf8_lossy(&greeting).trim_end()
        );

        // The BufReader keeps anything already read past the greeting.
        let endpoint = RpcEndpoint::spawn(stdout, stdin, handlers);

        Ok(Self {
            child,
            endpoint,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Sends a one-way call into the engine. Failures are logged; the caller
    /// observes them through [`EngineBridge::is_alive`].
    pub fn call(&self, method: &str, params: Vec<RpcValue>) {
        if let Err(e) = self.endpoint.send(method, params) {
            warn!("Engine call '{}' not delivered: {}", method, e);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.endpoint.is_alive()
    }

    /// Cancelled when the engine closes its end of the pipes without being
    /// asked to.
    pub fn lost(&self) -> CancellationToken {
        self.endpoint.lost()
    }

    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.endpoint.alive_flag()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Says goodbye, waits a bounded time for the child to exit and kills it
    /// otherwise.
    pub async fn shutdown(mut self) -> Option<ExitStatus> {
        let pid = self.child.id();
        self.call(methods::BYE, Vec::new());
        self.endpoint.close(self.shutdown_timeout).await;

        match tokio::time::timeout(self.shutdown_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("🛑 Engine {:?} exited with {}", pid, status);
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for engine {:?}: {}", pid, e);
                None
            }
            Err(_) => {
                warn!("⏳ Engine {:?} ignored bye, killing it", pid);
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill engine {:?}: {}", pid, e);
                }
                self.child.try_wait().ok().flatten()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::rpc::RpcCall;
    use tokio::sync::mpsc;
    use tokio::task::LocalSet;

    fn sh(script: &str) -> EngineConfig {
        EngineConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            handshake_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_silent_exit_fails_handshake() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let result = EngineBridge::spawn(&sh("exit 0"), dir.path(), HandlerTable::new()).await;
                assert!(matches!(result, Err(BridgeError::Handshake(_))));
            })
            .await;
    }

    #[tokio::test]
    async fn test_missing_program_fails_spawn() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let config = EngineConfig {
                    program: "/nonexistent/engine".to_string(),
                    ..EngineConfig::default()
                };
                let result = EngineBridge::spawn(&config, dir.path(), HandlerTable::new()).await;
                assert!(matches!(result, Err(BridgeError::Spawn(_))));
            })
            .await;
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let config = EngineConfig {
                    handshake_timeout: Duration::from_millis(100),
                    ..sh("sleep 5")
                };
                let result = EngineBridge::spawn(&config, dir.path(), HandlerTable::new()).await;
                assert!(matches!(result, Err(BridgeError::Handshake(_))));
            })
            .await;
    }

    #[tokio::test]
    async fn test_echo_engine_round_trip() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let (tx, mut rx) = mpsc::unbounded_channel();

                // `cat` sends every call straight back, so the host's own
                // handler table receives it.
                let mut handlers = HandlerTable::new();
                handlers.register(methods::RESUME_ROOM, move |call: RpcCall| {
                    let _ = tx.send(call.params);
                    async { Ok(RpcValue::Null) }
                });

                let bridge = EngineBridge::spawn(&sh("echo ready; exec cat"), dir.path(), handlers)
                    .await
                    .unwrap();
                assert!(bridge.is_alive());
                assert!(bridge.pid().is_some());

                bridge.call(methods::RESUME_ROOM, vec![RpcValue::Int(3), "delay_done".into()]);
                let params = rx.recv().await.unwrap();
                assert_eq!(params, vec![RpcValue::Int(3), RpcValue::Text("delay_done".into())]);

                let status = bridge.shutdown().await;
                assert!(status.is_some());
            })
            .await;
    }

    #[tokio::test]
    async fn test_engine_sees_working_directory_and_env() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                std::fs::write(dir.path().join("marker"), "x").unwrap();
                let config = sh("test -f marker && test \"$RPC_MODE\" = cbor && echo ok");
                let bridge = EngineBridge::spawn(&config, dir.path(), HandlerTable::new()).await;
                assert!(bridge.is_ok());
            })
            .await;
    }

    #[tokio::test]
    async fn test_stubborn_engine_is_killed() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let config = sh("trap '' TERM; echo ready; exec sleep 30");
                let bridge = EngineBridge::spawn(&config, dir.path(), HandlerTable::new())
                    .await
                    .unwrap();
                let started = std::time::Instant::now();
                bridge.shutdown().await;
                assert!(started.elapsed() < Duration::from_secs(5));
            })
            .await;
    }
}
