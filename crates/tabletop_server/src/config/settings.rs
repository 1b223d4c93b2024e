//! The JSON server settings document.
//!
//! Unknown keys are ignored and missing keys take their defaults, so an older
//! or partial document still loads.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ServerError;

/// Operator-tunable settings, reloadable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Substrings a player name may not contain (case-insensitive)
    pub ban_words: Vec<String>,
    pub description: String,
    pub icon_url: String,
    /// Maximum number of signed-up players
    pub capacity: usize,
    /// Minutes an address stays banned after a temporary ban; 0 disables bans
    pub temp_ban_time: u64,
    pub motd: String,
    pub hidden_packs: Vec<String>,
    pub enable_bots: bool,
    /// Rooms a single scheduler thread may host
    pub room_count_per_thread: usize,
    pub max_players_per_device: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ban_words: Vec::new(),
            description: "Tabletop Server".to_string(),
            icon_url: "default".to_string(),
            capacity: 100,
            temp_ban_time: 0,
            motd: "Welcome!".to_string(),
            hidden_packs: Vec::new(),
            enable_bots: true,
            room_count_per_thread: 2000,
            max_players_per_device: 1000,
        }
    }
}

impl ServerSettings {
    /// Parses a settings document.
    pub fn from_json(text: &str) -> Result<Self, ServerError> {
        serde_json::from_str(text)
            .map_err(|e| ServerError::Config(format!("Invalid settings document: {e}")))
    }

    /// Loads the document at `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ServerError::Config(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Whether `name` contains any banned word.
    pub fn is_banned_name(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.ban_words
            .iter()
            .filter(|word| !word.is_empty())
            .any(|word| name.contains(&word.to_lowercase()))
    }

    /// Room capacity of one scheduler; never zero.
    pub fn rooms_per_scheduler(&self) -> usize {
        self.room_count_per_thread.max(1)
    }
}
