//! Sign-up handshake.
//!
//! A new connection gets a `NetworkDelayTest` notification carrying the
//! authenticator's public key, and must answer with a `Setup` notification
//! whose payload is a CBOR array of strings:
//! `[name, password, md5, version, uuid]`. Checking the credentials is up to
//! the [`Authenticator`]; the server only validates the shape.

use bytes::Bytes;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::protocol::packet_type::*;
use crate::protocol::payload::{as_string, decode_array};
use crate::protocol::{Record, NOTIFICATION_ID};

pub const INVALID_SETUP: &str = "INVALID SETUP STRING";

/// Fields of a `Setup` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupData {
    pub name: String,
    pub password: String,
    pub md5: String,
    pub version: String,
    pub uuid: String,
}

impl SetupData {
    /// Validates the record shape and decodes the payload.
    pub fn parse(record: &Record) -> Result<Self, &'static str> {
        let shape_ok = record.timing.is_none()
            && record.request_id == NOTIFICATION_ID
            && record.type_mask == NOTIFICATION | SRC_CLIENT | DEST_SERVER
            && &record.command[..] == b"Setup";
        if !shape_ok {
            return Err(INVALID_SETUP);
        }

        let items = decode_array(&record.payload).ok_or(INVALID_SETUP)?;
        if items.len() < 5 {
            return Err(INVALID_SETUP);
        }
        let mut fields = items.iter().take(5).map(as_string);
        let mut next = || fields.next().flatten().ok_or(INVALID_SETUP);

        Ok(Self {
            name: next()?,
            password: next()?,
            md5: next()?,
            version: next()?,
            uuid: next()?,
        })
    }
}

/// Result of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub player_id: i32,
    pub avatar: String,
}

/// Credential checking collaborator.
pub trait Authenticator: Send + Sync {
    /// Payload of the `NetworkDelayTest` notification.
    fn public_key(&self) -> Bytes;

    /// Accepts or rejects a sign-up. The error string is shown to the user.
    fn authenticate(&self, setup: &SetupData) -> Result<AuthOutcome, String>;
}

/// Accepts any non-empty name and hands out sequential player ids.
pub struct OpenAuthenticator {
    next_id: AtomicI32,
    public_key: Bytes,
}

impl OpenAuthenticator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI32::new(1),
            public_key: Bytes::new(),
        }
    }

    pub fn with_public_key(public_key: impl Into<Bytes>) -> Self {
        Self {
            public_key: public_key.into(),
            ..Self::new()
        }
    }
}

impl Default for OpenAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for OpenAuthenticator {
    fn public_key(&self) -> Bytes {
        self.public_key.clone()
    }

    fn authenticate(&self, setup: &SetupData) -> Result<AuthOutcome, String> {
        if setup.name.trim().is_empty() {
            return Err("invalid user name".to_string());
        }
        Ok(AuthOutcome {
            player_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            avatar: "liubei".to_string(),
        })
    }
}
