//! Client wire protocol.
//!
//! Every message on a client connection is one self-framed CBOR array:
//!
//! ```text
//! [requestId, typeMask, command, payload]
//! [requestId, typeMask, command, payload, timeoutMs, timestampMs]
//! ```
//!
//! There is no length prefix; the array header and the item headers are the
//! framing. `command` and `payload` are opaque byte strings.

pub mod cbor;
pub mod codec;
pub mod payload;
pub mod rpc;

use bytes::{Bytes, BytesMut};

use crate::error::CodecError;
use crate::protocol::cbor::{Item, ItemWriter};
use crate::protocol::codec::{expect_int, expect_string, FrameAssembler, FrameCodec};

/// Bits of a record's type mask. They are OR-combined.
pub mod packet_type {
    pub const REQUEST: i32 = 0x100;
    pub const REPLY: i32 = 0x200;
    pub const NOTIFICATION: i32 = 0x400;
    pub const SRC_CLIENT: i32 = 0x010;
    pub const SRC_SERVER: i32 = 0x020;
    pub const SRC_LOBBY: i32 = 0x040;
    pub const DEST_CLIENT: i32 = 0x001;
    pub const DEST_SERVER: i32 = 0x002;
    pub const DEST_LOBBY: i32 = 0x004;
}

/// Request id carried by one-way notifications.
pub const NOTIFICATION_ID: i32 = -2;

/// Optional trailer of a 6-element record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTiming {
    pub timeout_ms: i32,
    pub timestamp_ms: i64,
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub request_id: i32,
    pub type_mask: i32,
    pub command: Bytes,
    pub payload: Bytes,
    pub timing: Option<RequestTiming>,
}

impl Record {
    pub fn new(
        request_id: i32,
        type_mask: i32,
        command: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            request_id,
            type_mask,
            command: command.into(),
            payload: payload.into(),
            timing: None,
        }
    }

    pub fn with_timing(mut self, timeout_ms: i32, timestamp_ms: i64) -> Self {
        self.timing = Some(RequestTiming {
            timeout_ms,
            timestamp_ms,
        });
        self
    }

    pub fn has(&self, bit: i32) -> bool {
        self.type_mask & bit != 0
    }

    /// Encodes the record into a standalone buffer.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::with_capacity(self.command.len() + self.payload.len() + 32);
        RecordAssembler::encode(self, &mut dst)?;
        Ok(dst.freeze())
    }
}

/// Assembles [`Record`]s. Arity must be exactly 4 or 6.
#[derive(Debug, Default)]
pub struct RecordAssembler {
    arity: usize,
    request_id: i32,
    type_mask: i32,
    command: Bytes,
    payload: Bytes,
    timeout_ms: i32,
    filled: usize,
}

impl FrameAssembler for RecordAssembler {
    type Frame = Record;

    fn begin(&mut self, len: usize) -> Result<(), CodecError> {
        if len != 4 && len != 6 {
            return Err(CodecError::InvalidArity(len));
        }
        self.arity = len;
        self.filled = 0;
        Ok(())
    }

    fn push(&mut self, item: Item) -> Result<Option<Record>, CodecError> {
        let position = self.filled;
        match position {
            0 => self.request_id = expect_int(item, position)?,
            1 => self.type_mask = expect_int(item, position)?,
            2 => self.command = expect_string(item, position)?,
            3 => self.payload = expect_string(item, position)?,
            4 => self.timeout_ms = expect_int(item, position)?,
            5 => {
                let timestamp_ms: i64 = expect_int(item, position)?;
                let record = Record {
                    request_id: self.request_id,
                    type_mask: self.type_mask,
                    command: std::mem::take(&mut self.command),
                    payload: std::mem::take(&mut self.payload),
                    timing: Some(RequestTiming {
                        timeout_ms: self.timeout_ms,
                        timestamp_ms,
                    }),
                };
                self.reset();
                return Ok(Some(record));
            }
            _ => {
                self.reset();
                return Err(CodecError::Malformed("record overran its arity".to_string()));
            }
        }
        self.filled += 1;

        if self.filled == self.arity && self.arity == 4 {
            let record = Record {
                request_id: self.request_id,
                type_mask: self.type_mask,
                command: std::mem::take(&mut self.command),
                payload: std::mem::take(&mut self.payload),
                timing: None,
            };
            self.reset();
            return Ok(Some(record));
        }
        Ok(None)
    }

    fn in_progress(&self) -> bool {
        self.arity != 0
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn encode(record: &Record, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut writer = ItemWriter::new(dst);
        writer.array(if record.timing.is_some() { 6 } else { 4 })?;
        writer.int(i64::from(record.request_id))?;
        writer.int(i64::from(record.type_mask))?;
        writer.bytes(&record.command)?;
        writer.bytes(&record.payload)?;
        if let Some(timing) = record.timing {
            writer.int(i64::from(timing.timeout_ms))?;
            writer.int(timing.timestamp_ms)?;
        }
        Ok(())
    }
}

/// Codec for client connections.
pub type RecordCodec = FrameCodec<RecordAssembler>;
