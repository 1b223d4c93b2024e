//! Command-line interface handling for the tabletop server.
//!
//! Every option here overrides the matching value from the TOML
//! configuration file.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the TCP bind address
    pub bind_address: Option<String>,
    /// Optional override for the UDP discovery address
    pub discovery_address: Option<String>,
    /// Optional override for the rule bundle directory
    pub bundle_dir: Option<PathBuf>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses the process arguments. Exits with a usage message on bad input.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            discovery_address: matches.get_one::<String>("discovery").cloned(),
            bundle_dir: matches.get_one::<String>("bundle").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn command() -> Command {
    Command::new("Tabletop Server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multiplayer tabletop game server backed by external rule engines")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("TCP bind address (e.g., 0.0.0.0:9527)"),
        )
        .arg(
            Arg::new("discovery")
                .short('d')
                .long("discovery")
                .value_name("ADDRESS")
                .help("UDP discovery address (e.g., 0.0.0.0:9527)"),
        )
        .arg(
            Arg::new("bundle")
                .long("bundle")
                .value_name("DIR")
                .help("Rule bundle directory"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
}
