//! Handshake and context lifecycle failures.

use std::thread;

use offload_rdma::{DriverError, Rdma, RdmaConfig, TaskKind};
use offload_runtime::{sync_wait, Context, PeContext};
use offload_transport::{tcp, FrameConfig, FramedListener};

use crate::harness::{init_logging, Endpoint};

#[test]
fn garbage_from_the_peer_fails_the_handshake() {
    init_logging();
    let listener = FramedListener::bind("127.0.0.1:0", FrameConfig::default()).unwrap();
    let addr = listener.local_addr().unwrap();
    let impostor = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = stream.recv_frame().unwrap();
        stream.send_frame(b"definitely not OFRC").unwrap();
    });

    let endpoint = Endpoint::new().unwrap();
    let mut stream = tcp::connect(addr, FrameConfig::default()).unwrap();
    let handshake = endpoint.rdma.connect(&mut stream).unwrap();
    let result = sync_wait(endpoint.on_pe(handshake));
    assert_eq!(result.unwrap_err(), DriverError::InvalidValue);
    impostor.join().unwrap();
}

#[test]
fn peer_hanging_up_fails_the_exchange() {
    let listener = FramedListener::bind("127.0.0.1:0", FrameConfig::default()).unwrap();
    let addr = listener.local_addr().unwrap();
    let quitter = thread::spawn(move || drop(listener.accept().unwrap()));

    let endpoint = Endpoint::new().unwrap();
    let mut stream = tcp::connect(addr, FrameConfig::default()).unwrap();
    quitter.join().unwrap();
    let err = endpoint.rdma.connect(&mut stream).unwrap_err();
    assert!(matches!(err, offload_rdma::RdmaError::Transport(_)), "{err}");
}

#[test]
fn context_that_never_started_rejects_work() {
    let endpoint = Endpoint::new().unwrap();
    let pe = PeContext::new().unwrap();
    let idle = Rdma::open(&endpoint.device).unwrap();
    pe.connect_ctx(&idle).unwrap();

    assert_eq!(idle.export().unwrap_err(), DriverError::BadState);
    let (_map, buf) = endpoint.empty_map(8).unwrap();
    assert_eq!(sync_wait(idle.recv(&buf)), Err(DriverError::BadState));
    assert_eq!(idle.available_tasks(TaskKind::Receive), 16);
}

#[test]
fn exhausted_pool_reports_no_memory() {
    let endpoint = Endpoint::with_config(RdmaConfig {
        tasks_per_kind: 2,
        ..RdmaConfig::default()
    })
    .unwrap();
    let bufs: Vec<_> = (0..3).map(|_| endpoint.empty_map(8).unwrap()).collect();

    thread::scope(|s| {
        for (_, buf) in &bufs[..2] {
            let endpoint = &endpoint;
            s.spawn(move || sync_wait(endpoint.on_pe(endpoint.rdma.recv(buf))));
        }
        while endpoint.rdma.available_tasks(TaskKind::Receive) > 0 {
            thread::yield_now();
        }
        assert_eq!(
            sync_wait(endpoint.on_pe(endpoint.rdma.recv(&bufs[2].1))),
            Err(DriverError::NoMemory)
        );
        // Stopping flushes the two parked receives so the scope can end.
        let _ = endpoint.rdma.stop();
    });
}
