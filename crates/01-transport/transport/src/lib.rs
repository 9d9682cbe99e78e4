//! Out-of-band byte-stream transport for connection and memory descriptors.
//!
//! The offload path never carries its payloads over this transport. It only
//! moves small opaque blobs between peers before the hardware path exists:
//! * [`FramedStream`] – 4-byte big-endian length prefix plus payload over any `Read + Write`.
//! * [`FramedListener`] / [`tcp::connect`] – TCP endpoints producing framed streams.
//! * [`TransportError`] – socket failures, limit violations, truncated frames.

mod error;
pub mod frame;
pub mod tcp;

pub use error::{TransportError, TransportResult};
pub use frame::{
    read_frame, write_frame, FrameConfig, FramedStream, DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_LEN,
};
pub use tcp::{FramedListener, TcpFramed};
