//! Engine RPC framing.
//!
//! The rule engine pipes reuse the client codec with a different frame shape:
//!
//! ```text
//! [kind, id, method, p1, p2, p3, p4, p5]   (3..=8 elements)
//! ```
//!
//! `kind` is 1 for a call, 2 for a reply and 3 for an error. A call with id
//! `-2` expects no reply. A reply carries its result in `p1`; an error carries
//! its message there.

use bytes::{Bytes, BytesMut};

use crate::error::CodecError;
use crate::protocol::cbor::{Item, ItemWriter};
use crate::protocol::codec::{expect_int, expect_string, FrameAssembler, FrameCodec};

/// Id of a call that expects no reply.
pub const ONE_WAY: i32 = -2;

/// Maximum number of positional call parameters.
pub const MAX_PARAMS: usize = 5;

const KIND_CALL: i64 = 1;
const KIND_REPLY: i64 = 2;
const KIND_ERROR: i64 = 3;

/// A call parameter or result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Bytes),
}

impl RpcValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RpcValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Text or bytes, as raw bytes.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            RpcValue::Text(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            RpcValue::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }

    /// Text, or bytes that are valid UTF-8.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RpcValue::Text(s) => Some(s.clone()),
            RpcValue::Bytes(b) => std::str::from_utf8(b).ok().map(str::to_string),
            _ => None,
        }
    }

    fn from_item(item: Item, position: usize) -> Result<Self, CodecError> {
        Ok(match item {
            Item::Null => RpcValue::Null,
            Item::Bool(v) => RpcValue::Bool(v),
            Item::Int(_) => RpcValue::Int(expect_int(item, position)?),
            Item::Text(body) => RpcValue::Text(
                String::from_utf8(body.to_vec())
                    .map_err(|e| CodecError::Malformed(format!("invalid utf-8 text: {e}")))?,
            ),
            Item::Bytes(body) => RpcValue::Bytes(body),
            Item::Array(_) => {
                return Err(CodecError::UnexpectedItem {
                    position,
                    found: "array".to_string(),
                })
            }
        })
    }

    fn write(&self, writer: &mut ItemWriter<'_>) -> Result<(), CodecError> {
        match self {
            RpcValue::Null => writer.null(),
            RpcValue::Bool(v) => writer.bool(*v),
            RpcValue::Int(v) => writer.int(*v),
            RpcValue::Text(s) => writer.text(s),
            RpcValue::Bytes(b) => writer.bytes(b),
        }
    }
}

impl From<i64> for RpcValue {
    fn from(value: i64) -> Self {
        RpcValue::Int(value)
    }
}

impl From<i32> for RpcValue {
    fn from(value: i32) -> Self {
        RpcValue::Int(i64::from(value))
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        RpcValue::Bool(value)
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        RpcValue::Text(value.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        RpcValue::Text(value)
    }
}

impl From<Bytes> for RpcValue {
    fn from(value: Bytes) -> Self {
        RpcValue::Bytes(value)
    }
}

/// An invocation of a named method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub id: i32,
    pub method: String,
    pub params: Vec<RpcValue>,
}

impl RpcCall {
    pub fn param(&self, index: usize) -> Option<&RpcValue> {
        self.params.get(index)
    }
}

/// Any frame travelling over the engine pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcPacket {
    Call(RpcCall),
    Reply { id: i32, result: RpcValue },
    Error { id: i32, message: String },
}

/// Assembles [`RpcPacket`]s.
#[derive(Debug, Default)]
pub struct RpcAssembler {
    arity: usize,
    kind: i64,
    id: i32,
    method: String,
    params: Vec<RpcValue>,
    filled: usize,
}

impl RpcAssembler {
    fn finish(&mut self) -> Result<RpcPacket, CodecError> {
        let id = self.id;
        let method = std::mem::take(&mut self.method);
        let mut params = std::mem::take(&mut self.params);
        let kind = self.kind;
        self.reset();

        match kind {
            KIND_CALL => Ok(RpcPacket::Call(RpcCall { id, method, params })),
            KIND_REPLY => Ok(RpcPacket::Reply {
                id,
                result: if params.is_empty() {
                    RpcValue::Null
                } else {
                    params.swap_remove(0)
                },
            }),
            _ => Ok(RpcPacket::Error {
                id,
                message: params.first().and_then(RpcValue::as_text).unwrap_or_default(),
            }),
        }
    }
}

impl FrameAssembler for RpcAssembler {
    type Frame = RpcPacket;

    fn begin(&mut self, len: usize) -> Result<(), CodecError> {
        if !(3..=3 + MAX_PARAMS).contains(&len) {
            return Err(CodecError::InvalidArity(len));
        }
        self.arity = len;
        self.filled = 0;
        Ok(())
    }

    fn push(&mut self, item: Item) -> Result<Option<RpcPacket>, CodecError> {
        let position = self.filled;
        match position {
            0 => {
                let kind: i64 = expect_int(item, position)?;
                if !(KIND_CALL..=KIND_ERROR).contains(&kind) {
                    return Err(CodecError::UnexpectedItem {
                        position,
                        found: format!("packet kind {kind}"),
                    });
                }
                self.kind = kind;
            }
            1 => self.id = expect_int(item, position)?,
            2 => {
                let raw = expect_string(item, position)?;
                self.method = String::from_utf8(raw.to_vec())
                    .map_err(|e| CodecError::Malformed(format!("invalid method name: {e}")))?;
            }
            _ => self.params.push(RpcValue::from_item(item, position)?),
        }
        self.filled += 1;

        if self.filled == self.arity {
            return self.finish().map(Some);
        }
        Ok(None)
    }

    fn in_progress(&self) -> bool {
        self.arity != 0
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn encode(packet: &RpcPacket, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut writer = ItemWriter::new(dst);
        match packet {
            RpcPacket::Call(call) => {
                if call.params.len() > MAX_PARAMS {
                    return Err(CodecError::InvalidArity(3 + call.params.len()));
                }
                writer.array(3 + call.params.len())?;
                writer.int(KIND_CALL)?;
                writer.int(i64::from(call.id))?;
                writer.text(&call.method)?;
                for param in &call.params {
                    param.write(&mut writer)?;
                }
            }
            RpcPacket::Reply { id, result } => {
                writer.array(4)?;
                writer.int(KIND_REPLY)?;
                writer.int(i64::from(*id))?;
                writer.text("")?;
                result.write(&mut writer)?;
            }
            RpcPacket::Error { id, message } => {
                writer.array(4)?;
                writer.int(KIND_ERROR)?;
                writer.int(i64::from(*id))?;
                writer.text("")?;
                writer.text(message)?;
            }
        }
        Ok(())
    }
}

/// Codec for the engine pipes.
pub type RpcCodec = FrameCodec<RpcAssembler>;
