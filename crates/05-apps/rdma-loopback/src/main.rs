//! Loopback demo: a server writes a pattern into memory a client exposes,
//! then tells it "done" over the descriptor transport.
//!
//! Both halves run in this process, each on its own context and progress
//! thread. The software driver's fabric does not reach across processes.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::Parser;
use offload_rdma::{AccessFlags, BufInventory, Device, MemoryMap, Rdma, RdmaConnection};
use offload_runtime::{fatal, starts_on, sync_wait, Context as _, PeContext, Sender};
use offload_transport::{tcp, FrameConfig, FramedListener, TcpFramed};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "One-sided write between two offload contexts")]
struct Args {
    /// Loopback port of the descriptor transport (0 picks a free one)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Device to open, by ibdev name
    #[arg(long, default_value = "soft0")]
    device: String,

    /// Number of bytes the server writes
    #[arg(long, default_value_t = 4096)]
    bytes: usize,
}

fn main() -> Result<()> {
    init_tracing();
    fatal::set_hook(|context, err| {
        eprintln!("fatal: {context}: {err}");
        std::process::exit(2);
    });

    let args = Args::parse();
    ensure!(args.bytes > 0, "--bytes must be positive");
    let device = Device::open_by_ibdev_name(&args.device)
        .with_context(|| format!("failed to open device {}", args.device))?;
    info!(device = %device.info().ibdev_name, pci = %device.info().pci_addr, "opened device");

    let listener = FramedListener::bind(("127.0.0.1", args.port), FrameConfig::default())
        .with_context(|| format!("failed to listen on port {}", args.port))?;
    let addr = listener.local_addr()?;
    let server = {
        let device = device.clone();
        thread::Builder::new()
            .name("loopback-server".into())
            .spawn(move || serve(&listener, &device, args.bytes))?
    };
    let client = run_client(addr, &device, args.bytes);
    let server = server
        .join()
        .map_err(|_| anyhow!("server thread panicked"))?;
    server.context("server failed")?;
    client.context("client failed")
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(env_filter).try_init();
}

/// The byte the server writes at `index`.
fn pattern(index: usize) -> u8 {
    (index % 251) as u8
}

/// Blocks on `sender`, treating a stop as a failure.
fn wait<S>(what: &str, sender: S) -> Result<S::Output>
where
    S: Sender,
    S::Output: Send,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    sync_wait(sender)
        .with_context(|| format!("{what} failed"))?
        .ok_or_else(|| anyhow!("{what} was stopped"))
}

/// A started context on its own progress thread.
struct Endpoint {
    rdma: Rdma,
    pe: PeContext,
}

impl Endpoint {
    fn open(device: &Device) -> Result<Self> {
        let pe = PeContext::new().context("failed to start the progress thread")?;
        let rdma = Rdma::open(device).context("failed to create the rdma context")?;
        pe.connect_ctx(&rdma).context("failed to register the rdma context")?;
        rdma.start().context("failed to start the rdma context")?;
        Ok(Self { rdma, pe })
    }

    fn connect(&self, stream: &mut TcpFramed) -> Result<RdmaConnection> {
        let handshake = self.rdma.connect(stream).context("descriptor exchange failed")?;
        let conn = wait("handshake", starts_on(self.pe.scheduler(), handshake))?;
        info!(conn = conn.id(), "connection established");
        Ok(conn)
    }
}

fn serve(listener: &FramedListener, device: &Device, bytes: usize) -> Result<()> {
    let endpoint = Endpoint::open(device)?;
    let (mut stream, peer) = listener.accept().context("accept failed")?;
    info!(%peer, "client connected");
    let conn = endpoint.connect(&mut stream)?;

    let export = stream.recv_frame().context("failed to receive the client's memory map")?;
    let remote = MemoryMap::from_export(&export, device).context("failed to import the client's memory map")?;
    if remote.len() < bytes {
        bail!("client exposed {} bytes, {bytes} needed", remote.len());
    }

    let source = MemoryMap::exposed(device, bytes, AccessFlags::LOCAL_READ_WRITE)?;
    let payload: Vec<u8> = (0..bytes).map(pattern).collect();
    source.write_at(0, &payload)?;

    let inventory = BufInventory::new(2)?;
    let src = inventory.buf_by_data(&source, 0, bytes)?;
    let dst = inventory.buf_by_addr(&remote, 0, bytes)?;
    wait("rdma write", starts_on(endpoint.pe.scheduler(), conn.write(&src, &dst)))?;
    info!(bytes, "wrote payload");

    stream.send_str("done")?;
    Ok(())
}

fn run_client(addr: SocketAddr, device: &Device, bytes: usize) -> Result<()> {
    let endpoint = Endpoint::open(device)?;
    let mut stream = tcp::connect_with_retry(addr, FrameConfig::default(), 50, Duration::from_millis(100))
        .with_context(|| format!("failed to reach {addr}"))?;
    let _conn = endpoint.connect(&mut stream)?;

    let target = MemoryMap::exposed(
        device,
        bytes,
        AccessFlags::LOCAL_READ_WRITE | AccessFlags::RDMA_WRITE,
    )?;
    stream.send_frame(&target.export_rdma(device)?)?;

    let message = stream.recv_string().context("waiting for the server")?;
    ensure!(message == "done", "unexpected message from server: {message:?}");

    let received = target.to_vec()?;
    if let Some(index) = (0..bytes).find(|&i| received[i] != pattern(i)) {
        warn!(index, "payload mismatch");
        bail!("byte {index} is {:#04x}, expected {:#04x}", received[index], pattern(index));
    }
    info!(bytes, "payload verified");
    Ok(())
}
