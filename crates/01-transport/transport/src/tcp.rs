//! TCP endpoints for exchanging descriptors out of band.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use crate::frame::{FrameConfig, FramedStream};
use crate::TransportResult;

/// Framed TCP stream used for descriptor exchange.
pub type TcpFramed = FramedStream<TcpStream>;

/// Connects to `addr` and enables `TCP_NODELAY` (descriptor frames are tiny).
pub fn connect<A: ToSocketAddrs>(addr: A, config: FrameConfig) -> TransportResult<TcpFramed> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    tracing::debug!(peer = ?stream.peer_addr().ok(), "descriptor transport connected");
    Ok(FramedStream::with_config(stream, config))
}

/// Connects with a bounded number of attempts, sleeping `backoff` between
/// refused attempts. Useful when both peers start at the same time.
pub fn connect_with_retry<A: ToSocketAddrs + Copy>(
    addr: A,
    config: FrameConfig,
    attempts: u32,
    backoff: Duration,
) -> TransportResult<TcpFramed> {
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match connect(addr, config) {
            Ok(stream) => return Ok(stream),
            Err(crate::TransportError::Io(err))
                if err.kind() == io::ErrorKind::ConnectionRefused =>
            {
                tracing::trace!(attempt, "connection refused, retrying");
                last_err = Some(err);
                thread::sleep(backoff);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
        .into())
}

/// Listening side of the descriptor transport.
#[derive(Debug)]
pub struct FramedListener {
    listener: TcpListener,
    config: FrameConfig,
}

impl FramedListener {
    /// Binds a listener. Use port 0 to let the OS pick one.
    pub fn bind<A: ToSocketAddrs>(addr: A, config: FrameConfig) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)?;
        tracing::debug!(local = ?listener.local_addr().ok(), "descriptor transport listening");
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until a peer connects.
    pub fn accept(&self) -> TransportResult<(TcpFramed, SocketAddr)> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        tracing::debug!(%peer, "descriptor transport accepted");
        Ok((FramedStream::with_config(stream, self.config), peer))
    }
}
