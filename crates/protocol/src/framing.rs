//! Delimiter-terminated framing over a byte stream.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload
//! - the delimiter (`"\r\n\r\n"` by default)
//!
//! The length is checked against the caller's limit before any payload byte
//! is read, and the payload is consumed by length. A delimiter sequence inside
//! the payload is therefore just data.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Default frame terminator.
pub const DEFAULT_DELIMITER: &[u8] = b"\r\n\r\n";

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound for a body frame (100 MiB).
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Default upper bound for a header frame (64 KiB).
pub const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Default number of bytes read from the socket at a time.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Encoder and decoder for frames held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCodec {
    delimiter: Vec<u8>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

impl FrameCodec {
    /// Create a codec using the given terminator.
    pub fn new(delimiter: &[u8]) -> Self {
        Self {
            delimiter: delimiter.to_vec(),
        }
    }

    /// The configured terminator.
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Bytes added around every payload.
    pub fn overhead(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.delimiter.len()
    }

    /// Encode a payload into a complete frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        let mut out = Vec::with_capacity(self.overhead() + payload.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(payload);
        out.extend_from_slice(&self.delimiter);
        Ok(out)
    }

    /// Decode one frame from the front of `data`.
    ///
    /// Returns the payload and the number of bytes consumed.
    pub fn decode(&self, data: &[u8], max_size: usize) -> Result<(Vec<u8>, usize)> {
        match self.try_decode(data, max_size)? {
            Some(decoded) => Ok(decoded),
            None => Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Like [`decode`](Self::decode) but returns `None` when more bytes are needed.
    pub fn try_decode(&self, data: &[u8], max_size: usize) -> Result<Option<(Vec<u8>, usize)>> {
        if data.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&data[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > max_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: max_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + len + self.delimiter.len();
        if data.len() < total {
            return Ok(None);
        }
        let payload = &data[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len];
        self.check_trailer(&data[LENGTH_PREFIX_SIZE + len..total])?;
        Ok(Some((payload.to_vec(), total)))
    }

    fn check_trailer(&self, trailer: &[u8]) -> Result<()> {
        if trailer != self.delimiter.as_slice() {
            return Err(ProtocolError::InvalidDelimiter {
                expected: self.delimiter.clone(),
                got: trailer.to_vec(),
            });
        }
        Ok(())
    }
}

/// A byte stream that exchanges whole frames.
#[derive(Debug)]
pub struct FramedStream<S> {
    inner: S,
    codec: FrameCodec,
    read_chunk_size: usize,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream with the default delimiter and chunk size.
    pub fn new(inner: S) -> Self {
        Self::with_codec(inner, FrameCodec::default(), READ_CHUNK_SIZE)
    }

    /// Wrap a stream with an explicit codec and read chunk size.
    pub fn with_codec(inner: S, codec: FrameCodec, read_chunk_size: usize) -> Self {
        Self {
            inner,
            codec,
            read_chunk_size: read_chunk_size.max(1),
        }
    }

    /// The codec in use.
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Read one frame of at most `max_size` payload bytes.
    ///
    /// `None` or a zero duration disables the timeout.
    pub async fn read_frame(
        &mut self,
        max_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        match timeout.filter(|d| !d.is_zero()) {
            Some(limit) => tokio::time::timeout(limit, self.read_frame_inner(max_size))
                .await
                .map_err(|_| {
                    ProtocolError::Timeout(format!("no frame received within {:?}", limit))
                })?,
            None => self.read_frame_inner(max_size).await,
        }
    }

    async fn read_frame_inner(&mut self, max_size: usize) -> Result<Vec<u8>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.inner.read_exact(&mut prefix).await?;
        let len = u32::from_be_bytes(prefix) as usize;
        if len > max_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: max_size,
            });
        }

        let mut payload = Vec::with_capacity(len.min(self.read_chunk_size));
        while payload.len() < len {
            let start = payload.len();
            let want = (len - start).min(self.read_chunk_size);
            payload.resize(start + want, 0);
            self.inner.read_exact(&mut payload[start..]).await?;
        }

        let mut trailer = vec![0u8; self.codec.delimiter().len()];
        self.inner.read_exact(&mut trailer).await?;
        self.codec.check_trailer(&trailer)?;
        Ok(payload)
    }

    /// Write one frame with a single write call.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let frame = self.codec.encode(payload)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Recover the underlying stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}
