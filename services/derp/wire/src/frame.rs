//! Message framing for the wire protocol.
//!
//! A [`Frame`] is one typed, length-delimited unit. [`FrameDecoder`] parses
//! frames incrementally out of a read buffer so that a partially received
//! frame survives a cancelled read.

use crate::header::{FrameHeader, FrameType, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use bytes::{Buf, Bytes, BytesMut};

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub typ: FrameType,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(typ: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            typ,
            payload: payload.into(),
        }
    }

    /// Create a frame with an empty payload
    pub fn empty(typ: FrameType) -> Self {
        Self::new(typ, Bytes::new())
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, crate::WireError> {
        if self.payload.len() > MAX_FRAME_SIZE {
            return Err(crate::WireError::FrameTooLarge {
                len: self.payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_size());
        FrameHeader {
            typ: self.typ,
            len: self.payload.len() as u32,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&self.payload);

        Ok(buf.freeze())
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a tighter payload limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    /// Payload limit enforced by this decoder
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Decode one frame from a buffer.
    ///
    /// The declared length is checked against the limit before any space is
    /// reserved for the payload. When the frame is incomplete the buffer is
    /// grown to fit it and `Ok(None)` is returned.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        let header = match FrameHeader::peek(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let len = header.len as usize;
        if len > self.max_frame_size {
            return Err(crate::WireError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_SIZE + len;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(len).freeze();

        Ok(Some(Frame {
            typ: header.typ,
            payload,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
