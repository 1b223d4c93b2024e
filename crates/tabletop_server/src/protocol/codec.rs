//! Streaming frame codec.
//!
//! [`FrameCodec`] pulls CBOR items off the front of a byte buffer and hands
//! them to a [`FrameAssembler`], which knows the shape of one frame. The codec
//! implements `tokio_util`'s `Decoder`/`Encoder` so it can sit under
//! `FramedRead`/`FramedWrite`, and also offers [`FrameCodec::feed`] for read
//! loops that hand it raw socket chunks.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::protocol::cbor::{take_item, Item};

/// Builds one frame out of a sequence of CBOR items.
///
/// A frame always starts with an array header. The assembler validates every
/// element as it arrives so a malformed frame is rejected at the first bad
/// element instead of after the whole array has been buffered.
pub trait FrameAssembler {
    type Frame;

    /// Starts a frame whose array header declared `len` elements.
    fn begin(&mut self, len: usize) -> Result<(), CodecError>;

    /// Accepts the next element. Returns the frame once the declared number
    /// of elements has been consumed.
    fn push(&mut self, item: Item) -> Result<Option<Self::Frame>, CodecError>;

    /// Whether a frame has been started but not completed.
    fn in_progress(&self) -> bool;

    /// Drops any partially assembled frame.
    fn reset(&mut self);

    /// Serializes one frame.
    fn encode(frame: &Self::Frame, dst: &mut BytesMut) -> Result<(), CodecError>;
}

/// A `Decoder`/`Encoder` pair driven by a [`FrameAssembler`].
#[derive(Debug, Default)]
pub struct FrameCodec<A> {
    assembler: A,
    buffer: BytesMut,
    pending_error: Option<CodecError>,
}

impl<A: FrameAssembler + Default> FrameCodec<A> {
    pub fn new() -> Self {
        Self {
            assembler: A::default(),
            buffer: BytesMut::new(),
            pending_error: None,
        }
    }
}

impl<A: FrameAssembler> FrameCodec<A> {
    /// Appends `chunk` to the internal buffer and extracts every complete
    /// frame, in arrival order.
    ///
    /// An error is only returned when no frame could be produced. When frames
    /// were produced before the stream turned out to be malformed, they are
    /// returned and the error is kept for [`FrameCodec::take_error`]; the
    /// caller delivers the frames first and then closes the stream.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<A::Frame>, CodecError> {
        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }

        self.buffer.extend_from_slice(chunk);
        let mut buffer = std::mem::take(&mut self.buffer);
        let mut frames = Vec::new();

        let outcome = loop {
            match self.decode(&mut buffer) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        // Compact the unconsumed tail into a fresh allocation.
        self.buffer = BytesMut::from(&buffer[..]);

        match outcome {
            Ok(()) => Ok(frames),
            Err(err) if frames.is_empty() => Err(err),
            Err(err) => {
                self.pending_error = Some(err);
                Ok(frames)
            }
        }
    }

    /// Takes the error deferred by the last [`FrameCodec::feed`] call.
    pub fn take_error(&mut self) -> Option<CodecError> {
        self.pending_error.take()
    }

    /// Whether a frame is partially decoded and waiting for more bytes.
    pub fn in_progress(&self) -> bool {
        self.assembler.in_progress() || !self.buffer.is_empty()
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl<A: FrameAssembler> Decoder for FrameCodec<A> {
    type Item = A::Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let item = match take_item(src) {
                Ok(Some(item)) => item,
                Ok(None) => return Ok(None),
                Err(err) => {
                    self.assembler.reset();
                    return Err(err);
                }
            };

            let step = if self.assembler.in_progress() {
                self.assembler.push(item)
            } else {
                match item {
                    Item::Array(len) => self.assembler.begin(len).map(|()| None),
                    other => Err(CodecError::UnexpectedItem {
                        position: 0,
                        found: other.kind().to_string(),
                    }),
                }
            };

            match step {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => continue,
                Err(err) => {
                    self.assembler.reset();
                    return Err(err);
                }
            }
        }
    }
}

impl<A: FrameAssembler> Encoder<A::Frame> for FrameCodec<A> {
    type Error = CodecError;

    fn encode(&mut self, frame: A::Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        A::encode(&frame, dst)
    }
}

/// Position-checked integer extraction shared by the assemblers.
pub(crate) fn expect_int<T: TryFrom<i128>>(item: Item, position: usize) -> Result<T, CodecError> {
    match item {
        Item::Int(value) => T::try_from(value).map_err(|_| CodecError::UnexpectedItem {
            position,
            found: format!("integer {value} out of range"),
        }),
        other => Err(CodecError::UnexpectedItem {
            position,
            found: other.kind().to_string(),
        }),
    }
}

/// Position-checked string extraction. Text and byte strings are both
/// accepted.
pub(crate) fn expect_string(item: Item, position: usize) -> Result<bytes::Bytes, CodecError> {
    match item {
        Item::Bytes(value) | Item::Text(value) => Ok(value),
        other => Err(CodecError::UnexpectedItem {
            position,
            found: other.kind().to_string(),
        }),
    }
}
