//! Client/server transfers after a TCP descriptor exchange.

use std::thread;

use offload_rdma::{AccessFlags, ConnState, DriverError, MemoryMap, TaskKind};
use rand::{Rng, SeedableRng};

use crate::harness::{connected_pair, wait, Pair};

fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// The server writes `payload` into a map the client exposed, then says
/// "done"; returns what the client sees.
fn server_writes(pair: &mut Pair, payload: &[u8]) -> Vec<u8> {
    let client = &pair.client;
    let target = MemoryMap::exposed(
        &client.device,
        payload.len(),
        AccessFlags::LOCAL_READ_WRITE | AccessFlags::RDMA_WRITE,
    )
    .unwrap();
    pair.client_stream
        .send_frame(&target.export_rdma(&client.device).unwrap())
        .unwrap();

    let server = &pair.server;
    let export = pair.server_stream.recv_frame().unwrap();
    let remote = MemoryMap::from_export(&export, &server.device).unwrap();
    let dst = server.inventory.buf_by_addr(&remote, 0, payload.len()).unwrap();
    let (_source, src) = server.map_with(payload).unwrap();
    wait(server.on_pe(pair.server_conn.write(&src, &dst))).unwrap();
    pair.server_stream.send_str("done").unwrap();

    assert_eq!(pair.client_stream.recv_string().unwrap(), "done");
    target.to_vec().unwrap()
}

#[test]
fn both_sides_establish() {
    let pair = connected_pair().unwrap();
    assert_eq!(pair.server_conn.state(), ConnState::Established);
    assert_eq!(pair.client_conn.state(), ConnState::Established);
    assert_eq!(pair.client_conn.native().peer_id(), Some(pair.server_conn.id()));
    assert_eq!(pair.server_conn.native().peer_id(), Some(pair.client_conn.id()));
}

#[test]
fn client_observes_server_write_after_done() {
    let mut pair = connected_pair().unwrap();
    for (seed, len) in [(1, 1), (2, 4096), (3, 65_539)] {
        let payload = pattern(seed, len);
        assert_eq!(server_writes(&mut pair, &payload), payload, "payload of {len} bytes");
    }
}

#[test]
fn client_reads_server_memory() {
    let mut pair = connected_pair().unwrap();
    let contents = pattern(9, 1500);

    let server = &pair.server;
    let exposed = MemoryMap::exposed(
        &server.device,
        contents.len(),
        AccessFlags::LOCAL_READ_WRITE | AccessFlags::RDMA_READ,
    )
    .unwrap();
    exposed.write_at(0, &contents).unwrap();
    pair.server_stream
        .send_frame(&exposed.export_rdma(&server.device).unwrap())
        .unwrap();

    let client = &pair.client;
    let export = pair.client_stream.recv_frame().unwrap();
    let remote = MemoryMap::from_export(&export, &client.device).unwrap();
    let src = client.inventory.buf_by_data(&remote, 0, contents.len()).unwrap();
    let (local, dst) = client.empty_map(contents.len()).unwrap();
    wait(client.on_pe(pair.client_conn.read(&src, &dst))).unwrap();

    assert_eq!(local.to_vec().unwrap(), contents);
    assert_eq!(dst.data_len(), contents.len());
}

#[test]
fn messages_arrive_in_posting_order() {
    let pair = connected_pair().unwrap();
    let messages: Vec<Vec<u8>> = (0..4).map(|i| pattern(20 + i, 8 + i as usize)).collect();

    thread::scope(|s| {
        let receiver = s.spawn(|| {
            let mut received = Vec::new();
            for _ in 0..messages.len() {
                let (inbox, buf) = pair.client.empty_map(64).unwrap();
                let len = wait(pair.client.on_pe(pair.client.rdma.recv(&buf))).unwrap();
                received.push(inbox.to_vec().unwrap()[..len].to_vec());
            }
            received
        });
        for message in &messages {
            let (_map, buf) = pair.server.map_with(message).unwrap();
            wait(pair.server.on_pe(pair.server_conn.send(&buf))).unwrap();
        }
        assert_eq!(receiver.join().unwrap(), messages);
    });
}

#[test]
fn write_to_a_read_only_export_is_rejected() {
    let mut pair = connected_pair().unwrap();
    let client = &pair.client;
    let target = MemoryMap::exposed(&client.device, 16, AccessFlags::LOCAL_READ_WRITE).unwrap();
    pair.client_stream
        .send_frame(&target.export_rdma(&client.device).unwrap())
        .unwrap();

    let server = &pair.server;
    let remote = MemoryMap::from_export(&pair.server_stream.recv_frame().unwrap(), &server.device).unwrap();
    let dst = server.inventory.buf_by_addr(&remote, 0, 16).unwrap();
    let (_source, src) = server.map_with(&[0xEE; 16]).unwrap();

    let result = offload_runtime::sync_wait(server.on_pe(pair.server_conn.write(&src, &dst)));
    assert_eq!(result, Err(DriverError::RemoteAccess));
    assert_eq!(target.to_vec().unwrap(), vec![0u8; 16]);
    assert_eq!(server.rdma.available_tasks(TaskKind::Write), 16);
}

#[test]
#[ignore]
fn slow_many_writes_at_random_offsets() {
    let mut pair = connected_pair().unwrap();
    const LEN: usize = 1 << 20;
    let client = &pair.client;
    let target = MemoryMap::exposed(
        &client.device,
        LEN,
        AccessFlags::LOCAL_READ_WRITE | AccessFlags::RDMA_WRITE,
    )
    .unwrap();
    pair.client_stream
        .send_frame(&target.export_rdma(&client.device).unwrap())
        .unwrap();

    let server = &pair.server;
    let remote = MemoryMap::from_export(&pair.server_stream.recv_frame().unwrap(), &server.device).unwrap();
    let mut expected = vec![0u8; LEN];
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    for round in 0..2_000u64 {
        let len = rng.gen_range(1..4096);
        let offset = rng.gen_range(0..LEN - len);
        let chunk = pattern(round, len);
        let dst = server.inventory.buf_by_addr(&remote, offset, len).unwrap();
        let (_source, src) = server.map_with(&chunk).unwrap();
        wait(server.on_pe(pair.server_conn.write(&src, &dst))).unwrap();
        expected[offset..offset + len].copy_from_slice(&chunk);
    }
    assert_eq!(target.to_vec().unwrap(), expected);
}
