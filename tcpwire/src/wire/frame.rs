//! Length-prefixed framing.
//!
//! Every frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes. Uses LengthDelimitedCodec for the prefix handling and works
//! over any AsyncRead/AsyncWrite (TCP sockets, in-memory duplex pipes, etc).
//!
//! A peer that disconnects is never an error on the read side: a clean close,
//! a close in the middle of the prefix and a close in the middle of the payload
//! all surface as end-of-stream, and any partial bytes are discarded.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{
    Decoder, Encoder, Framed, LengthDelimitedCodec, LengthDelimitedCodecError,
};

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Read buffer capacity used for socket reads.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Largest payload accepted or produced unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed or reset the connection.
    #[error("peer has gone away")]
    PeerGone,

    /// A frame declared or carried more than the configured maximum.
    #[error("frame exceeds maximum length of {max} bytes")]
    TooLarge { max: usize },

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => FrameError::PeerGone,
            _ => FrameError::Io(err),
        }
    }
}

/// Codec for `[u32 big-endian length][payload]` frames.
///
/// Wraps LengthDelimitedCodec and turns an early end-of-stream into a clean
/// close instead of the inner codec's "bytes remaining on stream" error.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_LEN)
                .big_endian()
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
        }
    }

    fn map_error(&self, err: io::Error) -> FrameError {
        let too_large = err
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if too_large {
            FrameError::TooLarge {
                max: self.max_frame_length,
            }
        } else {
            FrameError::from(err)
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src) {
            Ok(frame) => Ok(frame.map(BytesMut::freeze)),
            Err(e) => Err(self.map_error(e)),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if !buf.is_empty() {
            tracing::trace!(discarded_bytes = buf.len(), "Peer closed mid-frame");
            buf.clear();
        }
        Ok(None)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(payload_bytes = item.len(), "Encoding frame");
        self.inner.encode(item, dst).map_err(|e| self.map_error(e))
    }
}

/// A byte stream carrying length-prefixed frames in both directions.
pub struct FramedConnection<T> {
    framed: Framed<T, FrameCodec>,
}

impl<T> FramedConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self::with_max_frame_length(io, DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(io: T, max_frame_length: usize) -> Self {
        Self {
            framed: Framed::with_capacity(
                io,
                FrameCodec::with_max_frame_length(max_frame_length),
                READ_CHUNK_SIZE,
            ),
        }
    }

    /// Write one frame and flush it to the transport.
    pub async fn write_frame(&mut self, payload: Bytes) -> Result<(), FrameError> {
        self.framed.send(payload).await
    }

    /// Read one complete frame.
    ///
    /// Returns `Ok(None)` once the peer has closed or reset the connection,
    /// including when it does so partway through a frame.
    ///
    /// Cancel safe: partially received bytes stay buffered.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(FrameError::PeerGone)) | None => Ok(None),
            Some(Err(e)) => Err(e),
        }
    }

    /// Flush pending writes and shut down the write side.
    pub async fn close(&mut self) -> Result<(), FrameError> {
        SinkExt::close(&mut self.framed).await
    }
}
