//! Tabletop server entry point.
//!
//! Parses the command line, loads and validates the TOML configuration, sets
//! up logging and runs the server until a termination signal arrives.

mod cli;
mod config;
mod signals;

use std::sync::Arc;
use tabletop_server::GameServer;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::CliArgs;
use crate::config::{AppConfig, LoggingSettings};

/// Initializes the global subscriber. `RUST_LOG` wins over the configured level.
fn setup_logging(config: &LoggingSettings) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

/// Folds command-line overrides into the loaded configuration.
fn apply_overrides(config: &mut AppConfig, args: CliArgs) {
    if let Some(bind_address) = args.bind_address {
        config.server.bind_address = bind_address;
    }
    if let Some(discovery_address) = args.discovery_address {
        config.server.discovery_address = discovery_address;
    }
    if let Some(bundle_dir) = args.bundle_dir {
        config.server.bundle_directory = bundle_dir.to_string_lossy().into_owned();
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
}

pub struct Application {
    config: AppConfig,
    server: GameServer,
}

impl Application {
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = args.config_path.clone();
        let mut config = AppConfig::load_from_file(&config_path).await?;
        apply_overrides(&mut config, args);

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }

        setup_logging(&config.logging)?;

        let server = GameServer::new(config.to_server_config()?);

        info!(
            "🎲 Tabletop Server v{} | Config: {}",
            env!("CARGO_PKG_VERSION"),
            config_path.display()
        );

        Ok(Self { config, server })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!("  📡 Discovery address: {}", self.config.server.discovery_address);
        info!("  📦 Bundle directory: {}", self.config.server.bundle_directory);
        info!(
            "  ⚙️ Engine: {} {}",
            self.config.engine.program,
            self.config.engine.args.join(" ")
        );

        let server = Arc::new(self.server);
        let main = server.main_handle();
        let mut running = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };

        info!("🛑 Press Ctrl+C to gracefully shutdown, send SIGHUP to reload");

        tokio::select! {
            result = &mut running => {
                // the server stopped without being asked to
                return Ok(result??);
            }
            signal = signals::wait_for_shutdown(main) => {
                if let Err(e) = signal {
                    error!("❌ Signal handling failed: {}", e);
                }
            }
        }

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        server.shutdown();
        running.await??;

        info!("✅ Tabletop server shutdown complete");
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {e}");
            std::process::exit(1);
        }
    }

    Ok(())
}
