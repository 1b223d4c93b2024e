//! Error types for the tabletop server.
//!
//! Each layer has its own error enum; [`ServerError`] is the top-level type
//! returned from the public server API and wraps the others.

use std::time::Duration;

/// Top-level error type for server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Network-related error (bind failures, closed connections, etc.)
    #[error("Network error: {0}")]
    Network(String),
    /// Internal server error (registry inconsistencies, lost channels, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
    /// A player action that the current server state does not allow
    #[error("{0}")]
    Refused(String),
    /// Configuration or settings document could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
    /// Rule bundle could not be read or fingerprinted
    #[error("Bundle error: {0}")]
    Bundle(String),
    /// A cross-thread round trip to the main loop did not complete in time
    #[error("Main loop did not answer within {0:?}")]
    MainLoopTimeout(Duration),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Wire decoding and encoding failures. All of them are fatal to the stream
/// they occur on.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid frame arity {0}")]
    InvalidArity(usize),
    #[error("unexpected item at position {position}: {found}")]
    UnexpectedItem { position: usize, found: String },
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the rule engine subprocess bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to spawn engine: {0}")]
    Spawn(String),
    #[error("engine handshake failed: {0}")]
    Handshake(String),
    #[error("engine channel closed")]
    Closed,
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a scheduler thread.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("engine bridge failed: {0}")]
    Bridge(#[from] BridgeError),
    #[error("scheduler {0} did not start in time")]
    StartupTimeout(i32),
    #[error("failed to spawn scheduler thread: {0}")]
    ThreadSpawn(String),
    #[error("scheduler {0} loop is gone")]
    LoopGone(i32),
}
