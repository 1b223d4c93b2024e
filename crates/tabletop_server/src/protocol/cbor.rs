//! Item-level CBOR access on top of `ciborium-ll`.
//!
//! Frames are CBOR arrays whose elements are pulled one at a time straight
//! off the front of a `BytesMut`. An item is only consumed once all of its
//! bytes are present, so a partial item never has to be re-decoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ciborium_ll::{Decoder, Encoder, Header};
use std::io::ErrorKind;

use crate::error::CodecError;

/// Largest string item accepted from a peer.
pub const MAX_ITEM_LEN: usize = 16 * 1024 * 1024;

/// One decoded CBOR item.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Array(usize),
    Int(i128),
    Bytes(Bytes),
    Text(Bytes),
    Bool(bool),
    Null,
}

impl Item {
    /// Short name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Item::Array(_) => "array",
            Item::Int(_) => "integer",
            Item::Bytes(_) => "byte string",
            Item::Text(_) => "text string",
            Item::Bool(_) => "bool",
            Item::Null => "null",
        }
    }
}

fn peek_header(buf: &[u8]) -> Result<Option<(Header, usize)>, CodecError> {
    let mut decoder = Decoder::from(buf);
    match decoder.pull() {
        Ok(header) => Ok(Some((header, decoder.offset()))),
        Err(ciborium_ll::Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(ciborium_ll::Error::Io(e)) => Err(CodecError::Io(e)),
        Err(ciborium_ll::Error::Syntax(offset)) => Err(CodecError::Malformed(format!(
            "invalid item header at offset {offset}"
        ))),
    }
}

/// Removes one complete item from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold the whole item; nothing is
/// consumed in that case.
pub fn take_item(src: &mut BytesMut) -> Result<Option<Item>, CodecError> {
    let Some((header, head_len)) = peek_header(&src[..])? else {
        return Ok(None);
    };

    let item = match header {
        Header::Array(Some(len)) => {
            src.advance(head_len);
            Item::Array(len)
        }
        Header::Positive(n) => {
            src.advance(head_len);
            Item::Int(i128::from(n))
        }
        Header::Negative(n) => {
            src.advance(head_len);
            Item::Int(-1 - i128::from(n))
        }
        Header::Bytes(Some(len)) | Header::Text(Some(len)) => {
            if len > MAX_ITEM_LEN {
                return Err(CodecError::Malformed(format!(
                    "string item of {len} bytes exceeds limit"
                )));
            }
            if src.len() < head_len + len {
                return Ok(None);
            }
            src.advance(head_len);
            let body = src.split_to(len).freeze();
            if matches!(header, Header::Text(_)) {
                Item::Text(body)
            } else {
                Item::Bytes(body)
            }
        }
        Header::Simple(20) => {
            src.advance(head_len);
            Item::Bool(false)
        }
        Header::Simple(21) => {
            src.advance(head_len);
            Item::Bool(true)
        }
        Header::Simple(22) | Header::Simple(23) => {
            src.advance(head_len);
            Item::Null
        }
        other => {
            return Err(CodecError::Malformed(format!(
                "unsupported item {other:?}"
            )))
        }
    };

    Ok(Some(item))
}

/// Appends CBOR items to a `BytesMut`.
pub struct ItemWriter<'a> {
    encoder: Encoder<bytes::buf::Writer<&'a mut BytesMut>>,
}

impl<'a> ItemWriter<'a> {
    pub fn new(dst: &'a mut BytesMut) -> Self {
        Self {
            encoder: Encoder::from(dst.writer()),
        }
    }

    pub fn array(&mut self, len: usize) -> Result<(), CodecError> {
        self.encoder.push(Header::Array(Some(len)))?;
        Ok(())
    }

    pub fn int(&mut self, value: i64) -> Result<(), CodecError> {
        let header = if value >= 0 {
            Header::Positive(value.unsigned_abs())
        } else {
            Header::Negative((-1 - value).unsigned_abs())
        };
        self.encoder.push(header)?;
        Ok(())
    }

    pub fn bytes(&mut self, value: &[u8]) -> Result<(), CodecError> {
        self.encoder.bytes(value, None)?;
        Ok(())
    }

    pub fn text(&mut self, value: &str) -> Result<(), CodecError> {
        self.encoder.text(value, None)?;
        Ok(())
    }

    pub fn bool(&mut self, value: bool) -> Result<(), CodecError> {
        self.encoder.push(Header::Simple(if value { 21 } else { 20 }))?;
        Ok(())
    }

    pub fn null(&mut self) -> Result<(), CodecError> {
        self.encoder.push(Header::Simple(22))?;
        Ok(())
    }
}
