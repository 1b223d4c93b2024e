//! Server configuration types and defaults.
//!
//! [`ServerConfig`] holds the parameters fixed at startup. The operator-facing
//! settings that may change while the server runs (capacity, ban words, motd)
//! live in the JSON [`ServerSettings`] document instead.

pub mod settings;

pub use settings::ServerSettings;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Startup configuration for the game server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP address for client connections
    pub bind_address: SocketAddr,

    /// UDP address answering discovery probes
    pub discovery_address: SocketAddr,

    /// How long a fresh connection may take to send a valid `Setup`
    pub signup_timeout: Duration,

    /// Upper bound for a round trip to the main loop
    pub main_call_timeout: Duration,

    /// Path of the JSON settings document
    pub settings_path: PathBuf,

    /// Directory holding the active rule bundle
    pub bundle_directory: PathBuf,

    /// How rule engine subprocesses are launched
    pub engine: EngineConfig,
}

/// Launch parameters for one rule engine subprocess.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Program to execute
    pub program: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Environment variable selecting binary RPC mode
    pub rpc_mode_var: String,
    /// Value assigned to `rpc_mode_var`
    pub rpc_mode_value: String,
    /// How long the child has to print its greeting line
    pub handshake_timeout: Duration,
    /// How long the child has to exit after `bye` before it is killed
    pub shutdown_timeout: Duration,
    /// How long a new scheduler thread may take to come up
    pub startup_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "lua5.4".to_string(),
            args: vec!["server/rpc/entry.lua".to_string()],
            rpc_mode_var: "RPC_MODE".to_string(),
            rpc_mode_value: "cbor".to_string(),
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(3),
            startup_timeout: Duration::from_secs(15),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 9527)),
            discovery_address: SocketAddr::from(([0, 0, 0, 0], 9527)),
            signup_timeout: Duration::from_secs(30),
            main_call_timeout: Duration::from_secs(10),
            settings_path: PathBuf::from("server_settings.json"),
            bundle_directory: PathBuf::from("packages"),
            engine: EngineConfig::default(),
        }
    }
}
