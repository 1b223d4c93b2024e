//! Application configuration for the tabletop server.
//!
//! Loads the TOML file, applies defaults for missing keys, validates the
//! result and converts it into the library's [`ServerConfig`].

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabletop_server::{EngineConfig, ServerConfig};
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network and registry settings
    #[serde(default)]
    pub server: ServerSection,
    /// Rule engine subprocess settings
    #[serde(default)]
    pub engine: EngineSection,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// TCP address clients connect to
    pub bind_address: String,
    /// UDP address answering LAN discovery probes
    pub discovery_address: String,
    /// Seconds a new connection has to complete sign-up
    pub signup_timeout: u64,
    /// Seconds a worker thread waits for the main loop to answer
    pub main_call_timeout: u64,
    /// JSON settings document (capacity, ban words, motd, ...)
    pub settings_path: String,
    /// Directory holding the rule bundle
    pub bundle_directory: String,
}

/// How rule engine processes are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub program: String,
    pub args: Vec<String>,
    /// Environment variable that switches the engine into binary RPC mode
    pub rpc_mode_var: String,
    pub rpc_mode_value: String,
    /// Seconds the engine has to print its greeting
    pub handshake_timeout: u64,
    /// Seconds the engine has to exit after being asked to
    pub shutdown_timeout: u64,
    /// Seconds a scheduler thread has to come up
    pub startup_timeout: u64,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind_address: defaults.bind_address.to_string(),
            discovery_address: defaults.discovery_address.to_string(),
            signup_timeout: defaults.signup_timeout.as_secs(),
            main_call_timeout: defaults.main_call_timeout.as_secs(),
            settings_path: defaults.settings_path.to_string_lossy().into_owned(),
            bundle_directory: defaults.bundle_directory.to_string_lossy().into_owned(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            program: defaults.program,
            args: defaults.args,
            rpc_mode_var: defaults.rpc_mode_var,
            rpc_mode_value: defaults.rpc_mode_value,
            handshake_timeout: defaults.handshake_timeout.as_secs(),
            shutdown_timeout: defaults.shutdown_timeout.as_secs(),
            startup_timeout: defaults.startup_timeout.as_secs(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there and
    /// returns it.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the application configuration to the library configuration.
    pub fn to_server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        Ok(ServerConfig {
            bind_address: self.server.bind_address.parse()?,
            discovery_address: self.server.discovery_address.parse()?,
            signup_timeout: Duration::from_secs(self.server.signup_timeout),
            main_call_timeout: Duration::from_secs(self.server.main_call_timeout),
            settings_path: PathBuf::from(&self.server.settings_path),
            bundle_directory: PathBuf::from(&self.server.bundle_directory),
            engine: EngineConfig {
                program: self.engine.program.clone(),
                args: self.engine.args.clone(),
                rpc_mode_var: self.engine.rpc_mode_var.clone(),
                rpc_mode_value: self.engine.rpc_mode_value.clone(),
                handshake_timeout: Duration::from_secs(self.engine.handshake_timeout),
                shutdown_timeout: Duration::from_secs(self.engine.shutdown_timeout),
                startup_timeout: Duration::from_secs(self.engine.startup_timeout),
            },
        })
    }

    /// Checks addresses, paths, timeouts and the log level.
    pub fn validate(&self) -> Result<(), String> {
        for (name, address) in [
            ("bind", &self.server.bind_address),
            ("discovery", &self.server.discovery_address),
        ] {
            if address.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid {name} address: {address}"));
            }
        }

        if self.server.settings_path.is_empty() {
            return Err("Settings path cannot be empty".to_string());
        }
        if self.server.bundle_directory.is_empty() {
            return Err("Bundle directory cannot be empty".to_string());
        }
        if self.engine.program.is_empty() {
            return Err("Engine program cannot be empty".to_string());
        }

        let timeouts = [
            ("server.signup_timeout", self.server.signup_timeout),
            ("server.main_call_timeout", self.server.main_call_timeout),
            ("engine.handshake_timeout", self.engine.handshake_timeout),
            ("engine.shutdown_timeout", self.engine.shutdown_timeout),
            ("engine.startup_timeout", self.engine.startup_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(format!("{name} must be at least one second"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
