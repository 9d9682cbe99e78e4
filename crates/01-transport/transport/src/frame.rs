//! Length-prefixed framing over any blocking byte stream.
//!
//! Every frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes. The receiver validates the declared length against its limit
//! before allocating, so a hostile or corrupt header cannot make it reserve
//! unbounded memory.

use std::io::{self, Read, Write};

use crate::{TransportError, TransportResult};

/// Size of the length header preceding every payload.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default receive limit (100 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Receive-side framing limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameConfig {
    /// Largest payload accepted by [`read_frame`]; larger headers fail the stream.
    pub max_frame_len: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl FrameConfig {
    /// Configuration with a custom receive limit.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

/// Encodes the length header for a payload of `len` bytes.
pub fn encode_header(len: usize) -> TransportResult<[u8; LENGTH_PREFIX_LEN]> {
    let len = u32::try_from(len).map_err(|_| TransportError::PayloadTooLarge { len })?;
    Ok(len.to_be_bytes())
}

/// Writes one frame. The caller decides when to flush.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> TransportResult<()> {
    let header = encode_header(payload.len())?;
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    Ok(())
}

/// Reads one frame, rejecting declared lengths above `max_frame_len`.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, max_frame_len: usize) -> TransportResult<Vec<u8>> {
    let mut header = [0u8; LENGTH_PREFIX_LEN];
    read_exact_or_closed(reader, &mut header, "length header")?;

    let declared = u32::from_be_bytes(header) as usize;
    if declared > max_frame_len {
        tracing::warn!(declared, max_frame_len, "rejecting oversized frame");
        return Err(TransportError::FrameTooLarge {
            declared,
            max: max_frame_len,
        });
    }

    if declared == 0 {
        return Ok(Vec::new());
    }

    let mut payload = vec![0u8; declared];
    read_exact_or_closed(reader, &mut payload, "payload")?;
    Ok(payload)
}

fn read_exact_or_closed<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    phase: &'static str,
) -> TransportResult<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Err(TransportError::Closed(phase))
        }
        Err(err) => Err(err.into()),
    }
}

/// Blocking framed view over a byte stream.
#[derive(Debug)]
pub struct FramedStream<S> {
    inner: S,
    config: FrameConfig,
}

impl<S> FramedStream<S> {
    /// Wraps `inner` with the default limits.
    pub fn new(inner: S) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Wraps `inner` with explicit limits.
    pub fn with_config(inner: S, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> FrameConfig {
        self.config
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read + Write> FramedStream<S> {
    /// Sends one frame and flushes the stream.
    pub fn send_frame(&mut self, payload: &[u8]) -> TransportResult<()> {
        write_frame(&mut self.inner, payload)?;
        self.inner.flush()?;
        tracing::trace!(len = payload.len(), "sent frame");
        Ok(())
    }

    /// Receives one frame using the configured limit.
    pub fn recv_frame(&mut self) -> TransportResult<Vec<u8>> {
        self.recv_frame_with_limit(self.config.max_frame_len)
    }

    /// Receives one frame with a per-call limit.
    pub fn recv_frame_with_limit(&mut self, max_frame_len: usize) -> TransportResult<Vec<u8>> {
        let frame = read_frame(&mut self.inner, max_frame_len)?;
        tracing::trace!(len = frame.len(), "received frame");
        Ok(frame)
    }

    pub fn send_str(&mut self, text: &str) -> TransportResult<()> {
        self.send_frame(text.as_bytes())
    }

    pub fn recv_string(&mut self) -> TransportResult<String> {
        Ok(String::from_utf8(self.recv_frame()?)?)
    }
}
