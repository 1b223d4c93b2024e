//! Lobby collaborator.
//!
//! Players who are not seated in a room live in the lobby (room id 0). Their
//! messages are handed to a [`Lobby`] implementation, which acts on the
//! server through the [`MainHandle`].

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::connection::ConnectionId;
use crate::error::ServerError;
use crate::protocol::payload::{as_i32, as_string, decode_array};
use crate::server::handle::MainHandle;

#[async_trait]
pub trait Lobby: Send + Sync {
    /// A player finished sign-up and entered the lobby.
    async fn on_enter(&self, _main: MainHandle, _connection: ConnectionId) {}

    /// A message from a player in the lobby.
    async fn on_message(
        &self,
        main: MainHandle,
        connection: ConnectionId,
        command: Bytes,
        payload: Bytes,
    );
}

/// Minimal lobby: create, join and watch rooms.
///
/// * `CreateRoom` with payload `[name]`
/// * `EnterRoom` with payload `[roomId]`
/// * `ObserveRoom` with payload `[roomId]`
#[derive(Debug, Default)]
pub struct BasicLobby;

#[async_trait]
impl Lobby for BasicLobby {
    async fn on_enter(&self, _main: MainHandle, connection: ConnectionId) {
        debug!("{} entered the lobby", connection);
    }

    async fn on_message(
        &self,
        main: MainHandle,
        connection: ConnectionId,
        command: Bytes,
        payload: Bytes,
    ) {
        let args = decode_array(&payload).unwrap_or_default();
        let outcome = match &command[..] {
            b"CreateRoom" => {
                let name = args
                    .first()
                    .and_then(as_string)
                    .unwrap_or_else(|| format!("{}'s room", connection));
                main.call(move |state| state.create_room(connection, name).map(|_| ()))
                    .await
            }
            b"EnterRoom" => match args.first().and_then(as_i32) {
                Some(room_id) => main.call(move |state| state.seat_player(connection, room_id)).await,
                None => Ok(Err(ServerError::Refused(
                    "EnterRoom needs a room id".to_string(),
                ))),
            },
            b"ObserveRoom" => match args.first().and_then(as_i32) {
                Some(room_id) => main.call(move |state| state.observe_room(connection, room_id)).await,
                None => Ok(Err(ServerError::Refused(
                    "ObserveRoom needs a room id".to_string(),
                ))),
            },
            other => {
                debug!(
                    "Lobby ignores '{}' from {}",
                    String::from_utf8_lossy(other),
                    connection
                );
                return;
            }
        };

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                info!("🚫 Lobby request from {} refused: {}", connection, e);
                let message = e.to_string();
                main.post(move |state| state.show_error(connection, &message));
            }
            Err(e) => info!("Lobby request from {} failed: {}", connection, e),
        }
    }
}
