//! Signed-up players.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::connection::ConnectionId;
use crate::messaging::Router;

/// Room id of the lobby pseudo-room.
pub const LOBBY_ROOM: i32 = 0;

/// Connection state of a player as the game rules see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Online,
    Trust,
    Run,
    Leave,
    Robot,
    Offline,
}

impl PlayerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerState::Online => "online",
            PlayerState::Trust => "trust",
            PlayerState::Run => "run",
            PlayerState::Leave => "leave",
            PlayerState::Robot => "robot",
            PlayerState::Offline => "offline",
        }
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A player who completed `Setup`.
pub struct Session {
    pub router: Arc<Router>,
    pub player_id: i32,
    pub name: String,
    pub avatar: String,
    pub device: String,
    pub state: PlayerState,
    /// [`LOBBY_ROOM`] while unseated
    pub room_id: i32,
    pub observing: Option<i32>,
    pub thinking: bool,
    pub died: bool,
}

impl Session {
    pub fn connection_id(&self) -> ConnectionId {
        self.router.connection_id()
    }

    pub fn in_lobby(&self) -> bool {
        self.room_id == LOBBY_ROOM && self.observing.is_none()
    }

    pub fn is_online(&self) -> bool {
        self.state != PlayerState::Offline
    }

    /// JSON description handed to the game rules.
    pub fn describe(&self) -> String {
        serde_json::json!({
            "connId": self.connection_id().0,
            "id": self.player_id,
            "name": self.name,
            "avatar": self.avatar,
            "state": self.state,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(PlayerState::Offline.as_str(), "offline");
        assert_eq!(serde_json::to_string(&PlayerState::Robot).unwrap(), "\"robot\"");
        assert_eq!(PlayerState::Trust.to_string(), "trust");
    }
}
