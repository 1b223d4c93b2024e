//! Server orchestration.
//!
//! * [`core`] binds the sockets and runs the main loop.
//! * [`state`] holds the registries the main loop owns.
//! * [`handle`] lets other threads post work onto the main loop.
//! * [`auth`] and [`lobby`] are the sign-up and lobby collaborator seams.
//! * [`discovery`] answers LAN discovery probes.

pub mod auth;
pub mod core;
pub mod discovery;
pub mod handle;
pub mod lobby;
pub mod state;

pub use self::core::GameServer;
pub use auth::{AuthOutcome, Authenticator, OpenAuthenticator, SetupData};
pub use discovery::ServerSummary;
pub use handle::MainHandle;
pub use lobby::{BasicLobby, Lobby};
pub use state::{Collaborators, Room, ServerState};
