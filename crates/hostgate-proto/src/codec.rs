//! Length-prefixed framing for tunnel packets
//!
//! Format: `[length: u32 big-endian][payload: length bytes]`. The length covers
//! the payload only. Packets are bincode-serialized into the payload.

use crate::messages::Packet;
use crate::FRAME_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Stream ended mid-frame with {0} bytes buffered")]
    Truncated(usize),

    #[error("Frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },
}

impl CodecError {
    /// True when the error came from an expired read deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }
}

/// Upper bound on what the decoder reserves ahead of buffered data
const MAX_DECODE_RESERVE: usize = 64 * 1024;

/// Length prefix for a payload of `len` bytes
fn frame_length(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::FrameTooLarge {
        size: len,
        limit: u32::MAX as usize,
    })
}

/// Prefix `payload` with its length
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, CodecError> {
    let length = frame_length(payload.len())?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(length);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Raw frame codec
///
/// No size limit is enforced unless one is set with `with_max_frame_size`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    max_frame_size: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = Some(limit);
        self
    }

    pub fn max_frame_size(&self) -> Option<usize> {
        self.max_frame_size
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if let Some(limit) = self.max_frame_size {
            if size > limit {
                return Err(CodecError::FrameTooLarge { size, limit });
            }
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; FRAME_HEADER_SIZE];
        length_bytes.copy_from_slice(&src[..FRAME_HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        self.check_size(length)?;

        let total = FRAME_HEADER_SIZE + length;
        if src.len() < total {
            // Grow with the data actually arriving, not the declared length
            src.reserve((total - src.len()).min(MAX_DECODE_RESERVE));
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Truncated(src.len())),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        let length = frame_length(payload.len())?;
        self.check_size(payload.len())?;

        dst.reserve(FRAME_HEADER_SIZE + payload.len());
        dst.put_u32(length);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Frame codec that (de)serializes a `Packet` per frame
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec {
    frames: FrameCodec,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_codec(frames: FrameCodec) -> Self {
        Self { frames }
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(Packet::from_bytes(&frame)?)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        match self.frames.decode_eof(src)? {
            Some(frame) => Ok(Some(Packet::from_bytes(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = packet.to_bytes()?;
        self.frames.encode(Bytes::from(payload), dst)
    }
}

/// Incremental frame decoder over a byte stream
///
/// Accumulates transport reads and yields one payload per complete frame.
/// With an idle timeout set, every read must complete within the timeout;
/// the deadline restarts after each successful read.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    codec: FrameCodec,
    idle_timeout: Option<Duration>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    const READ_CHUNK: usize = 4096;

    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(Self::READ_CHUNK),
            codec: FrameCodec::new(),
            idle_timeout: None,
        }
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Next complete frame payload
    ///
    /// Returns `Ok(None)` when the stream ends on a frame boundary and
    /// `CodecError::Truncated` when it ends inside a frame.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                trace!("Decoded frame of {} bytes", frame.len());
                return Ok(Some(frame));
            }

            if self.buffer.capacity() - self.buffer.len() < Self::READ_CHUNK {
                self.buffer.reserve(Self::READ_CHUNK);
            }

            let read = match self.idle_timeout {
                Some(timeout) => {
                    tokio::time::timeout(timeout, self.reader.read_buf(&mut self.buffer))
                        .await
                        .map_err(|_| {
                            io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")
                        })??
                }
                None => self.reader.read_buf(&mut self.buffer).await?,
            };

            if read == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(CodecError::Truncated(self.buffer.len()))
                };
            }
        }
    }

    /// Next frame decoded as a `Packet`
    pub async fn next_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        match self.next_frame().await? {
            Some(frame) => Ok(Some(Packet::from_bytes(&frame)?)),
            None => Ok(None),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
