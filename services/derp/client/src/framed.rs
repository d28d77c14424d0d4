//! Frame-level reads and writes over a byte stream.

use bytes::BytesMut;
use derp_wire::{Frame, FrameDecoder};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::RelayError;

const INITIAL_READ_BUFFER: usize = 8 * 1024;

/// Buffered frame reader.
///
/// Partially received frames stay in the internal buffer, so dropping a
/// pending [`FrameReader::read_frame`] future loses no data.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a read half
    pub fn new(reader: R) -> Self {
        Self::with_decoder(reader, FrameDecoder::new())
    }

    /// Wrap a read half with a custom decoder
    pub fn with_decoder(reader: R, decoder: FrameDecoder) -> Self {
        Self {
            reader,
            decoder,
            buffer: BytesMut::with_capacity(INITIAL_READ_BUFFER),
        }
    }

    /// Give back the underlying reader, dropping any buffered bytes
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next complete frame
    pub async fn read_frame(&mut self) -> Result<Frame, RelayError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer)? {
                return Ok(frame);
            }

            let bytes_read = self.reader.read_buf(&mut self.buffer).await?;
            if bytes_read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "relay closed the connection",
                )
                .into());
            }

            trace!(
                "Read {} bytes, buffer now has {} bytes",
                bytes_read,
                self.buffer.len()
            );
        }
    }
}

/// Encode and write one frame, then flush
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), RelayError> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
