//! # Tabletop Server - Transport, Routing and Scheduling Core
//!
//! The network core of a multiplayer tabletop game server. It accepts client
//! connections, decodes the self-framed binary protocol, multiplexes
//! request/reply/notification traffic per connection and spreads rooms across
//! a pool of worker threads, each of which hands game-rule execution to an
//! external rule engine process over a private RPC pipe.
//!
//! ## Design Philosophy
//!
//! The server contains **no game rules**. It provides the substrate rules run on:
//!
//! * **Streaming codec** - CBOR records decoded from arbitrary TCP chunks
//! * **Per-connection routing** - request ids, reply deadlines, notifications
//! * **Scheduler pool** - worker threads with capacity, versioning and retirement
//! * **Engine bridge** - bidirectional RPC with a rule engine subprocess
//!
//! Authentication, the lobby and the rule bundle are collaborators behind
//! traits ([`Authenticator`], [`Lobby`], [`BundleProvider`]); the stock
//! implementations are deliberately simple.
//!
//! ## Architecture Overview
//!
//! ### Threads
//!
//! * **Main loop** - a single task owning every registry (sessions, rooms,
//!   schedulers). Other threads reach it through [`MainHandle`].
//! * **Connection tasks** - one reader and one writer per client socket.
//! * **Scheduler threads** - a current-thread runtime each, running room
//!   requests against their own rule engine process.
//!
//! ### Message Flow
//!
//! 1. Client sends `[requestId, typeMask, command, payload]`
//! 2. The connection's [`Router`](messaging::Router) classifies it
//! 3. Lobby traffic goes to the [`Lobby`]; room traffic is queued on the
//!    room's scheduler and forwarded to the rule engine as `HandleRequest`
//! 4. The engine calls back (`Player_doNotify`, `Player_doRequest`, ...) and
//!    those effects are applied on the main loop in the order they were made
//!
//! ## Configuration
//!
//! * [`ServerConfig`] - fixed at startup: addresses, timeouts, engine launch
//! * [`ServerSettings`] - JSON document, reloadable: capacity, ban words, motd
//!
//! ## Error Handling
//!
//! [`ServerError`] is the top-level error; [`CodecError`], [`BridgeError`] and
//! [`SchedulerError`] cover the layers below it.

pub use bundle::{BundleProvider, DirectoryBundle};
pub use config::{EngineConfig, ServerConfig, ServerSettings};
pub use error::{BridgeError, CodecError, SchedulerError, ServerError};
pub use server::{
    AuthOutcome, Authenticator, BasicLobby, Collaborators, GameServer, Lobby, MainHandle,
    OpenAuthenticator, ServerState, ServerSummary, SetupData,
};

pub mod bundle;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod messaging;
pub mod player;
pub mod protocol;
pub mod scheduler;
pub mod server;
