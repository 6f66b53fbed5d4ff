mod common;

use std::time::Duration;

use common::memory_devices;
use ddsnap::client::Client;
use ddsnap::protocol::{code, errcode, ChunkRange, Message, RwRequest};
use ddsnap::server::Server;
use ddsnap::{Engine, EngineConfig, Error, SnapStore, SnapshotState, ORIGIN_TAG};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    _dir: TempDir,
    socket: std::path::PathBuf,
    devices: ddsnap::Devices,
    cancel: CancellationToken,
    handle: JoinHandle<ddsnap::Result<()>>,
}

async fn start() -> Running {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let socket = dir.path().join("ddsnap.sock");
    let devices = memory_devices().await;
    let engine = Engine::open(devices.clone(), EngineConfig::default()).await.unwrap();
    let server = Server::bind(engine, &socket).unwrap();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(server.run(cancel.clone()));
    Running {
        _dir: dir,
        socket,
        devices,
        cancel,
        handle,
    }
}

fn rw(code: u32, id: u32, chunk: u64) -> Message {
    Message::new(
        code,
        &RwRequest {
            id,
            ranges: vec![ChunkRange { chunk, chunks: 1 }],
        },
    )
}

#[tokio::test]
async fn test_snapshot_management() {
    let server = start().await;
    let mut client = Client::connect(&server.socket).await.unwrap();

    client.create_snapshot(4).await.unwrap();
    client.create_snapshot(5).await.unwrap();
    assert_eq!(client.set_priority(4, 3).await.unwrap(), 3);
    assert_eq!(client.adjust_usecount(5, 1).await.unwrap(), 1);

    let list = client.list_snapshots().await.unwrap();
    let tags: Vec<u32> = list.iter().map(|info| info.snap).collect();
    assert_eq!(tags, vec![4, 5]);
    assert_eq!(list[0].prio, 3);
    assert_eq!(list[1].usecnt, 1);

    match client.create_snapshot(4).await {
        Err(Error::Remote { code: reply, err, msg }) => {
            assert_eq!(reply, code::CREATE_SNAPSHOT_ERROR);
            assert_eq!(err, libc::EEXIST as u32);
            assert_eq!(msg, "snapshot already exists");
        }
        other => panic!("expected an error reply, got {:?}", other),
    }
    match client.delete_snapshot(5).await {
        Err(Error::Remote { msg, .. }) => assert_eq!(msg, "snapshot has non-zero usecount"),
        other => panic!("expected an error reply, got {:?}", other),
    }

    assert_eq!(client.snapshot_state(4).await.unwrap(), SnapshotState::Live);
    assert_eq!(client.snapshot_state(6).await.unwrap(), SnapshotState::Missing);
    assert_eq!(
        client.snapshot_sectors(ORIGIN_TAG).await.unwrap(),
        common::ORIGIN_BYTES >> 9
    );

    let status = client.status(0).await.unwrap();
    assert_eq!(status.details.len(), 2);
    assert!(client.changelist(4, 5).await.unwrap().is_empty());

    client.delete_snapshot(4).await.unwrap();
    client.shutdown_server().await.unwrap();
    server.handle.await.unwrap().unwrap();

    let image = SnapStore::read_superblock(&server.devices.metadata).await.unwrap();
    assert!(!image.is_busy());
    assert_eq!(image.snapshots.len(), 1);
    assert_eq!(image.snapshots[0].usecount, 1);
    assert!(!server.socket.exists());
}

#[tokio::test]
async fn test_origin_write_waits_for_reader() {
    let server = start().await;
    let sectors = common::ORIGIN_BYTES >> 9;
    let mut admin = Client::connect(&server.socket).await.unwrap();
    admin.create_snapshot(1).await.unwrap();

    let mut origin = Client::connect(&server.socket).await.unwrap();
    assert_eq!(origin.identify(1, ORIGIN_TAG, 0, sectors).await.unwrap(), 12);
    let mut reader = Client::connect(&server.socket).await.unwrap();
    reader.identify(2, 1, 0, sectors).await.unwrap();

    reader.send(&rw(code::QUERY_SNAPSHOT_READ, 1, 77)).await.unwrap();
    let reply = reader.receive().await.unwrap();
    assert_eq!(reply.code, code::SNAPSHOT_READ_ORIGIN_OK);

    origin.send(&rw(code::QUERY_WRITE, 2, 77)).await.unwrap();
    let early = tokio::time::timeout(Duration::from_millis(200), origin.receive()).await;
    assert!(early.is_err(), "origin write acknowledged during a snapshot read");

    reader.send(&rw(code::FINISH_SNAPSHOT_READ, 1, 77)).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), origin.receive())
        .await
        .expect("origin write never acknowledged")
        .unwrap();
    assert_eq!(reply.code, code::ORIGIN_WRITE_OK);
    assert_eq!(reply.parse::<RwRequest>().unwrap().id, 2);

    // a reader that goes away also releases the write
    reader.send(&rw(code::QUERY_SNAPSHOT_READ, 3, 78)).await.unwrap();
    reader.receive().await.unwrap();
    origin.send(&rw(code::QUERY_WRITE, 4, 78)).await.unwrap();
    drop(reader);
    let reply = tokio::time::timeout(Duration::from_secs(5), origin.receive())
        .await
        .expect("origin write never acknowledged")
        .unwrap();
    assert_eq!(reply.code, code::ORIGIN_WRITE_OK);

    server.cancel.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bad_clients() {
    let server = start().await;
    let mut client = Client::connect(&server.socket).await.unwrap();
    match client.identify(1, 9, 0, 1).await {
        Err(Error::Remote { code: reply, err, .. }) => {
            assert_eq!(reply, code::IDENTIFY_ERROR);
            assert_eq!(err, errcode::ERROR_INVALID_SNAPSHOT);
        }
        other => panic!("expected an error reply, got {:?}", other),
    }

    client.send(&rw(code::QUERY_WRITE, 1, 0)).await.unwrap();
    let reply = client.receive().await.unwrap();
    assert_eq!(reply.code, code::PROTOCOL_ERROR);

    // a truncated body drops the connection, others keep working
    client.send(&Message::empty(code::CREATE_SNAPSHOT)).await.unwrap();
    assert!(client.receive().await.is_err());

    let mut other = Client::connect(&server.socket).await.unwrap();
    other.create_snapshot(2).await.unwrap();

    server.cancel.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_writes_beyond_the_origin() {
    let server = start().await;
    let sectors = common::ORIGIN_BYTES >> 9;
    let mut admin = Client::connect(&server.socket).await.unwrap();
    admin.create_snapshot(1).await.unwrap();
    let mut origin = Client::connect(&server.socket).await.unwrap();
    origin.identify(1, ORIGIN_TAG, 0, sectors).await.unwrap();

    // the origin holds 4096 chunks
    origin.send(&rw(code::QUERY_WRITE, 1, 5000)).await.unwrap();
    let reply = origin.receive().await.unwrap();
    assert_eq!(reply.code, code::ORIGIN_WRITE_ERROR);
    assert_eq!(reply.parse::<RwRequest>().unwrap().id, 1);

    let wrapping = Message::new(
        code::QUERY_WRITE,
        &RwRequest {
            id: 2,
            ranges: vec![ChunkRange {
                chunk: u64::MAX,
                chunks: 2,
            }],
        },
    );
    origin.send(&wrapping).await.unwrap();
    let reply = origin.receive().await.unwrap();
    assert_eq!(reply.code, code::ORIGIN_WRITE_ERROR);

    origin.send(&rw(code::QUERY_WRITE, 3, 4095)).await.unwrap();
    let reply = origin.receive().await.unwrap();
    assert_eq!(reply.code, code::ORIGIN_WRITE_OK);
    assert!(!server.handle.is_finished());
    assert_eq!(admin.list_snapshots().await.unwrap().len(), 1);

    server.cancel.cancel();
    server.handle.await.unwrap().unwrap();
}
