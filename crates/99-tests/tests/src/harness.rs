use std::convert::Infallible;
use std::thread;

use anyhow::{anyhow, Context as _, Result};
use offload_rdma::{AccessFlags, Buf, BufInventory, Device, MemoryMap, Rdma, RdmaConfig, RdmaConnection};
use offload_runtime::{starts_on, sync_wait, Context as _, PeContext, Sender};
use offload_transport::{tcp, FrameConfig, FramedListener, TcpFramed};
use tracing_subscriber::EnvFilter;

/// Routes `RUST_LOG`-filtered logs to the test output.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Blocks on `sender`, treating a stop as a failure.
pub fn wait<S>(sender: S) -> Result<S::Output>
where
    S: Sender,
    S::Output: Send,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    sync_wait(sender)?.ok_or_else(|| anyhow!("operation was stopped"))
}

/// One side of a test: a started context on its own progress thread.
pub struct Endpoint {
    pub device: Device,
    pub rdma: Rdma,
    pub inventory: BufInventory,
    pub pe: PeContext,
}

impl Endpoint {
    pub fn new() -> Result<Self> {
        Self::with_config(RdmaConfig::default())
    }

    pub fn with_config(config: RdmaConfig) -> Result<Self> {
        let device = Device::open_by_ibdev_name("soft0")?;
        let pe = PeContext::new()?;
        let rdma = Rdma::with_config(&device, config)?;
        pe.connect_ctx(&rdma)?;
        rdma.start()?;
        Ok(Self {
            device,
            rdma,
            inventory: BufInventory::new(64)?,
            pe,
        })
    }

    /// Swaps descriptors over `stream` and waits for the connection on this
    /// endpoint's driver thread.
    pub fn connect(&self, stream: &mut TcpFramed) -> Result<RdmaConnection> {
        let handshake = self.rdma.connect(stream)?;
        wait(self.on_pe(handshake)).context("handshake")
    }

    /// Runs `sender` from this endpoint's driver thread.
    pub fn on_pe<S>(&self, sender: S) -> impl Sender<Output = S::Output, Error = S::Error>
    where
        S: Sender + Send,
        S::Error: From<Infallible>,
    {
        starts_on(self.pe.scheduler(), sender)
    }

    pub fn map_with(&self, bytes: &[u8]) -> Result<(MemoryMap, Buf)> {
        let map = MemoryMap::exposed(&self.device, bytes.len(), AccessFlags::LOCAL_READ_WRITE)?;
        map.write_at(0, bytes)?;
        let buf = self.inventory.buf_by_data(&map, 0, bytes.len())?;
        Ok((map, buf))
    }

    pub fn empty_map(&self, len: usize) -> Result<(MemoryMap, Buf)> {
        let map = MemoryMap::exposed(&self.device, len, AccessFlags::LOCAL_READ_WRITE)?;
        let buf = self.inventory.buf_by_addr(&map, 0, len)?;
        Ok((map, buf))
    }
}

/// Both ends of an established connection plus the descriptor streams.
/// Connections come first so they are dropped before their endpoints.
pub struct Pair {
    pub server_conn: RdmaConnection,
    pub client_conn: RdmaConnection,
    pub server_stream: TcpFramed,
    pub client_stream: TcpFramed,
    pub server: Endpoint,
    pub client: Endpoint,
}

/// Runs the symmetric handshake between two fresh endpoints over loopback TCP.
pub fn connected_pair() -> Result<Pair> {
    init_logging();
    let listener = FramedListener::bind("127.0.0.1:0", FrameConfig::default())?;
    let addr = listener.local_addr()?;
    let server = Endpoint::new()?;
    let client = Endpoint::new()?;

    let (server_side, client_side) = thread::scope(|s| {
        let accepted = s.spawn(|| -> Result<_> {
            let (mut stream, _) = listener.accept()?;
            let conn = server.connect(&mut stream)?;
            Ok((stream, conn))
        });
        let connected = (|| -> Result<_> {
            let mut stream = tcp::connect(addr, FrameConfig::default())?;
            let conn = client.connect(&mut stream)?;
            Ok((stream, conn))
        })();
        let accepted = accepted
            .join()
            .map_err(|_| anyhow!("server side panicked"))
            .and_then(|side| side);
        (accepted, connected)
    });
    let (server_stream, server_conn) = server_side?;
    let (client_stream, client_conn) = client_side?;

    Ok(Pair {
        server_conn,
        client_conn,
        server_stream,
        client_stream,
        server,
        client,
    })
}
