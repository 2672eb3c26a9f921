//! Length-prefixed framing for [`Packet`]s over a byte stream.
//!
//! Frame layout: `[u32 little-endian payload length][bincode payload]`.
//! The payload starts with the bincode variant index, which doubles as the
//! packet tag.

use crate::{Packet, PACKET_TAG_COUNT};
use bincode::{deserialize, serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds limit of {1}")]
    FrameTooLarge(usize, usize),
    #[error("serialization failed: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame of {0} bytes exceeds limit of {1}")]
    FrameTooLarge(usize, usize),
    #[error("frame too short to carry a packet tag ({0} bytes)")]
    Truncated(usize),
    #[error("unknown packet tag {0}")]
    UnknownTag(u32),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl DecodeError {
    /// Whether the byte stream can no longer be resynchronized.
    ///
    /// Every other error consumes exactly the offending frame, so reading can
    /// continue with the next one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::FrameTooLarge(..))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("connection closed mid-frame")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Serializes `packet` into a complete frame, header included.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    let payload = serialize(packet)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len(), MAX_FRAME_SIZE));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes a single frame payload (header already stripped).
pub fn decode(payload: &[u8]) -> Result<Packet, DecodeError> {
    if payload.len() < 4 {
        return Err(DecodeError::Truncated(payload.len()));
    }

    let tag = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if tag >= PACKET_TAG_COUNT {
        return Err(DecodeError::UnknownTag(tag));
    }

    deserialize::<Packet>(payload).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Reassembles frames from bytes delivered in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the next complete packet, `Ok(None)` if more bytes are needed.
    ///
    /// A recoverable error consumes the bad frame. A fatal error leaves the
    /// buffer untouched; the caller is expected to drop the connection.
    pub fn next_frame(&mut self) -> Result<Option<Packet>, DecodeError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(DecodeError::FrameTooLarge(len, MAX_FRAME_SIZE));
        }

        let frame_len = FRAME_HEADER_LEN + len;
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buf.drain(..frame_len).collect();
        decode(&frame[FRAME_HEADER_LEN..]).map(Some)
    }
}

/// Frame-aware reader over any async byte stream.
pub struct PacketReader<R> {
    inner: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
        }
    }

    /// Reads whatever the transport has ready into the frame buffer.
    ///
    /// Cancel-safe: no bytes are lost if the future is dropped inside a
    /// `tokio::select!`. Returns 0 on end of stream.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.inner.read_buf(&mut self.decoder.buf).await
    }

    /// Next packet already sitting in the buffer, without touching the socket.
    pub fn next_frame(&mut self) -> Result<Option<Packet>, DecodeError> {
        self.decoder.next_frame()
    }

    /// Reads until a whole packet is available.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>, ReadError> {
        loop {
            if let Some(packet) = self.decoder.next_frame()? {
                return Ok(Some(packet));
            }

            if self.fill().await? == 0 {
                return if self.decoder.is_empty() {
                    Ok(None)
                } else {
                    Err(ReadError::Closed)
                };
            }
        }
    }
}

/// Encodes and writes one frame, then flushes.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), CodecError> {
    let frame = encode(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
