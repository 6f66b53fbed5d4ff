mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{attach, call, memory_engine, rw, small_engine, tagged};
use ddsnap::block_bitmap::Space;
use ddsnap::blockdev::MemoryBlockDevice;
use ddsnap::btree::Target;
use ddsnap::protocol::{
    code, errcode, ChangelistStream, ErrorReply, Message, PriorityInfo, PriorityOk,
    ResizeRequest, RwReply, RwRequest, SnapshotList, SnapshotSectors, StateMessage,
    StatusReply, StreamChangelist, UsecountInfo, UsecountOk,
};
use ddsnap::{Devices, Engine, EngineConfig, ORIGIN_TAG};

const ORIGIN: u64 = 1;
const SNAP: u64 = 2;

fn bit_of(engine: &ddsnap::Engine, tag: u32) -> u8 {
    engine.store().snapshot(tag).unwrap().bit
}

#[tokio::test]
async fn test_origin_write_preserves_snapshot_data() {
    let (_, mut engine) = memory_engine(EngineConfig::default()).await;
    engine.connect(9);
    let replies = call(&mut engine, 9, tagged(code::CREATE_SNAPSHOT, 5)).await;
    assert_eq!(replies[0].code, code::CREATE_SNAPSHOT_OK);
    attach(&mut engine, ORIGIN, ORIGIN_TAG).await;
    attach(&mut engine, SNAP, 5).await;
    let bit = bit_of(&engine, 5);

    let free = engine.store_mut().count_free(Space::Snapdata).await.unwrap();
    let replies = call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, 3, 100, 1)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].code, code::ORIGIN_WRITE_OK);
    assert_eq!(replies[0].parse::<RwRequest>().unwrap().id, 3);
    let after = engine.store_mut().count_free(Space::Snapdata).await.unwrap();
    assert_eq!(after, free - 1);

    // exclusively owned by snapshot 5
    let table = engine.store_mut().sharing_table().await.unwrap();
    assert_eq!(table[bit as usize][0], 1);

    let replies = call(&mut engine, SNAP, rw(code::QUERY_SNAPSHOT_READ, 4, 100, 1)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].code, code::SNAPSHOT_READ_OK);
    let reply = RwReply::decode(&replies[0]).unwrap();
    let (unique, exception) = engine
        .store_mut()
        .test_unique(100, Target::Snapshot(bit))
        .await
        .unwrap();
    assert!(unique);
    assert_eq!(reply.ranges[0].exceptions, vec![exception.unwrap()]);

    // a second write to the same chunk has nothing left to preserve
    call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, 5, 100, 1)).await;
    let again = engine.store_mut().count_free(Space::Snapdata).await.unwrap();
    assert_eq!(again, after);
}

#[tokio::test]
async fn test_snapshot_write_leaves_other_snapshot_alone() {
    let (_, mut engine) = memory_engine(EngineConfig::default()).await;
    engine.store_mut().create_snapshot(1).await.unwrap();
    engine.store_mut().create_snapshot(2).await.unwrap();
    let (bit1, bit2) = (bit_of(&engine, 1), bit_of(&engine, 2));
    attach(&mut engine, ORIGIN, ORIGIN_TAG).await;
    attach(&mut engine, SNAP, 1).await;

    // chunk 60 gets one copy shared by both snapshots
    call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, 1, 60, 1)).await;
    let (_, shared) = engine.store_mut().test_unique(60, Target::Snapshot(bit2)).await.unwrap();

    for chunk in [50, 60] {
        let replies = call(&mut engine, SNAP, rw(code::QUERY_WRITE, 2, chunk, 1)).await;
        assert_eq!(replies[0].code, code::SNAPSHOT_WRITE_OK);
        let reply = RwReply::decode(&replies[0]).unwrap();
        let exception = reply.ranges[0].exceptions[0];

        let (unique, own) = engine.store_mut().test_unique(chunk, Target::Snapshot(bit1)).await.unwrap();
        assert!(unique);
        assert_eq!(own, Some(exception));
    }

    let store = engine.store_mut();
    assert_eq!(store.test_unique(50, Target::Snapshot(bit2)).await.unwrap(), (false, None));
    let (unique, other) = store.test_unique(60, Target::Snapshot(bit2)).await.unwrap();
    assert!(unique);
    assert_eq!(other, shared);
    assert_ne!(store.test_unique(60, Target::Snapshot(bit1)).await.unwrap().1, shared);
}

#[tokio::test]
async fn test_changelist_after_divergent_writes() {
    let (_, mut engine) = memory_engine(EngineConfig::default()).await;
    engine.store_mut().create_snapshot(1).await.unwrap();
    engine.store_mut().create_snapshot(2).await.unwrap();
    attach(&mut engine, SNAP, 2).await;
    call(&mut engine, SNAP, rw(code::QUERY_WRITE, 1, 20, 1)).await;
    call(&mut engine, SNAP, rw(code::QUERY_WRITE, 2, 10, 1)).await;

    engine.connect(3);
    let request = Message::new(code::STREAM_CHANGELIST, &StreamChangelist { snap1: 1, snap2: 2 });
    let replies = call(&mut engine, 3, request).await;
    assert_eq!(replies[0].code, code::STREAM_CHANGELIST_OK);
    let stream: ChangelistStream = replies[0].parse().unwrap();
    assert_eq!(stream.chunksize_bits, 12);
    let chunks: BTreeSet<u64> = stream.chunks.into_iter().collect();
    assert_eq!(chunks, BTreeSet::from([10, 20]));

    let request = Message::new(code::STREAM_CHANGELIST, &StreamChangelist { snap1: 1, snap2: 7 });
    let replies = call(&mut engine, 3, request).await;
    assert_eq!(replies[0].code, code::STREAM_CHANGELIST_ERROR);
    let err: ErrorReply = replies[0].parse().unwrap();
    assert_eq!(err.err, libc::EINVAL as u32);
    assert_eq!(err.msg, "destination snapshot does not exist");
}

#[tokio::test]
async fn test_delete_frees_every_exception() {
    let (_, mut engine) = memory_engine(EngineConfig::default()).await;
    let free = engine.store_mut().count_free(Space::Snapdata).await.unwrap();
    engine.store_mut().create_snapshot(8).await.unwrap();
    attach(&mut engine, ORIGIN, ORIGIN_TAG).await;
    for chunk in [3, 4, 5, 900] {
        call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, chunk as u32, chunk, 1)).await;
    }
    let used = engine.store_mut().count_free(Space::Snapdata).await.unwrap();
    assert_eq!(used, free - 4);

    engine.connect(3);
    let replies = call(&mut engine, 3, tagged(code::DELETE_SNAPSHOT, 8)).await;
    assert_eq!(replies[0].code, code::DELETE_SNAPSHOT_OK);

    let store = engine.store_mut();
    assert_eq!(store.count_free(Space::Snapdata).await.unwrap(), free);
    assert_eq!(store.superblock().metadata.freechunks, free);
    let table = store.sharing_table().await.unwrap();
    assert!(table.iter().flatten().all(|&count| count == 0));

    let replies = call(&mut engine, 3, Message::empty(code::LIST_SNAPSHOTS)).await;
    assert!(replies[0].parse::<SnapshotList>().unwrap().snapshots.is_empty());
}

#[tokio::test]
async fn test_create_and_delete_errors() {
    let (_, mut engine) = memory_engine(EngineConfig::default()).await;
    engine.connect(3);
    call(&mut engine, 3, tagged(code::CREATE_SNAPSHOT, 1)).await;

    let replies = call(&mut engine, 3, tagged(code::CREATE_SNAPSHOT, 1)).await;
    assert_eq!(replies[0].code, code::CREATE_SNAPSHOT_ERROR);
    assert_eq!(replies[0].parse::<ErrorReply>().unwrap().err, libc::EEXIST as u32);

    let replies = call(&mut engine, 3, tagged(code::DELETE_SNAPSHOT, 4)).await;
    assert_eq!(replies[0].code, code::DELETE_SNAPSHOT_ERROR);
    let err: ErrorReply = replies[0].parse().unwrap();
    assert_eq!(err.err, libc::EINVAL as u32);
    assert_eq!(err.msg, "snapshot doesn't exist");

    attach(&mut engine, SNAP, 1).await;
    let replies = call(&mut engine, 3, tagged(code::DELETE_SNAPSHOT, 1)).await;
    assert_eq!(replies[0].code, code::DELETE_SNAPSHOT_ERROR);
    assert_eq!(
        replies[0].parse::<ErrorReply>().unwrap().msg,
        "snapshot has non-zero usecount"
    );

    engine.disconnect(SNAP);
    let replies = call(&mut engine, 3, tagged(code::DELETE_SNAPSHOT, 1)).await;
    assert_eq!(replies[0].code, code::DELETE_SNAPSHOT_OK);
}

#[tokio::test]
async fn test_priority_and_usecount() {
    let (devices, mut engine) = memory_engine(EngineConfig::default()).await;
    engine.store_mut().create_snapshot(6).await.unwrap();
    engine.connect(3);

    let request = Message::new(code::PRIORITY, &PriorityInfo { snap: 6, prio: -4 });
    let replies = call(&mut engine, 3, request).await;
    assert_eq!(replies[0].code, code::PRIORITY_OK);
    assert_eq!(replies[0].parse::<PriorityOk>().unwrap().prio, -4);

    let request = Message::new(code::PRIORITY, &PriorityInfo { snap: ORIGIN_TAG, prio: 1 });
    let replies = call(&mut engine, 3, request).await;
    assert_eq!(replies[0].code, code::PRIORITY_ERROR);
    assert_eq!(
        replies[0].parse::<ErrorReply>().unwrap().err,
        errcode::ERROR_INVALID_SNAPSHOT
    );

    let usecount = |delta| Message::new(code::USECOUNT, &UsecountInfo { snap: 6, usecnt_dev: delta });
    let replies = call(&mut engine, 3, usecount(2)).await;
    assert_eq!(replies[0].code, code::USECOUNT_OK);
    assert_eq!(replies[0].parse::<UsecountOk>().unwrap().usecount, 2);

    let replies = call(&mut engine, 3, usecount(-3)).await;
    assert_eq!(replies[0].code, code::USECOUNT_ERROR);
    let err: ErrorReply = replies[0].parse().unwrap();
    assert_eq!(err.err, errcode::ERROR_USECOUNT);
    assert_eq!(err.msg, "Usecount underflow.");

    let replies = call(&mut engine, 3, usecount(i32::from(u16::MAX))).await;
    assert_eq!(replies[0].parse::<ErrorReply>().unwrap().msg, "Usecount overflow.");

    // both changes reached the superblock
    let image = ddsnap::SnapStore::read_superblock(&devices.metadata).await.unwrap();
    assert_eq!(image.snapshots[0].prio, -4);
    assert_eq!(image.snapshots[0].usecount, 2);
}

#[tokio::test]
async fn test_status_state_and_sectors() {
    let (_, mut engine) = memory_engine(EngineConfig::default()).await;
    engine.store_mut().create_snapshot(1).await.unwrap();
    engine.store_mut().create_snapshot(2).await.unwrap();
    attach(&mut engine, ORIGIN, ORIGIN_TAG).await;
    // chunk 7 ends up owned by snapshot 2 alone, chunk 8 by 2 and 3
    call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, 1, 7, 1)).await;
    engine.store_mut().delete_snapshot(1).await.unwrap();
    engine.store_mut().create_snapshot(3).await.unwrap();
    call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, 2, 8, 1)).await;

    engine.connect(3);
    let replies = call(&mut engine, 3, tagged(code::STATUS, 0)).await;
    assert_eq!(replies[0].code, code::STATUS_OK);
    let status: StatusReply = replies[0].parse().unwrap();
    assert_eq!(status.details.len(), 2);
    assert_eq!(status.details[0].info.snap, 2);
    assert_eq!(status.details[0].sharing, vec![1, 1]);
    assert_eq!(status.details[1].info.snap, 3);
    assert_eq!(status.details[1].sharing, vec![0, 1]);
    assert_eq!(status.meta.total, (common::STORE_BYTES >> 12));
    assert_eq!(status.meta.free, engine.store().superblock().metadata.freechunks);
    assert!(status.write_density > 0);
    assert_eq!(status.write_density, engine.store().metadata_usage().density());

    let replies = call(&mut engine, 3, tagged(code::REQUEST_SNAPSHOT_STATE, 1)).await;
    assert_eq!(replies[0].code, code::SNAPSHOT_STATE);
    assert_eq!(replies[0].parse::<StateMessage>().unwrap().state, 1);

    let bad = Message {
        code: code::REQUEST_SNAPSHOT_STATE,
        body: vec![0; 6],
    };
    let replies = call(&mut engine, 3, bad).await;
    assert_eq!(replies[0].code, code::GENERIC_ERROR);

    let replies = call(&mut engine, 3, tagged(code::REQUEST_SNAPSHOT_SECTORS, 2)).await;
    let sectors: SnapshotSectors = replies[0].parse().unwrap();
    assert_eq!(sectors.count, common::ORIGIN_BYTES >> 9);

    let replies = call(&mut engine, 3, tagged(code::REQUEST_SNAPSHOT_SECTORS, 1)).await;
    assert_eq!(replies[0].code, code::GENERIC_ERROR);
    assert_eq!(
        replies[0].parse::<ErrorReply>().unwrap().msg,
        "Snapshot 1 is not valid"
    );
}

#[tokio::test]
async fn test_resize_origin_and_store() {
    let origin = Arc::new(MemoryBlockDevice::new(common::ORIGIN_BYTES));
    let store = Arc::new(MemoryBlockDevice::new(common::STORE_BYTES));
    let devices = Devices::combined(origin.clone(), store.clone());
    common::format(&devices).await;
    let mut engine = Engine::open(devices, EngineConfig::default()).await.unwrap();
    engine.connect(3);

    origin.resize(32 << 20);
    store.resize(16 << 20);
    let request = Message::new(
        code::RESIZE,
        &ResizeRequest {
            orgsize: 32 << 20,
            snapsize: 16 << 20,
            metasize: 0,
        },
    );
    let replies = call(&mut engine, 3, request).await;
    assert_eq!(replies[0].code, code::RESIZE);
    let sizes: ResizeRequest = replies[0].parse().unwrap();
    assert_eq!(sizes.orgsize, 32 << 20);
    assert_eq!(sizes.snapsize, 16 << 20);
    assert_eq!(sizes.metasize, 16 << 20);
    assert_eq!(engine.store().superblock().orgsectors, (32 << 20) >> 9);

    let counted = engine.store_mut().count_free(Space::Metadata).await.unwrap();
    assert_eq!(counted, engine.store().superblock().metadata.freechunks);

    let request = Message::new(
        code::RESIZE,
        &ResizeRequest {
            orgsize: 0,
            snapsize: 16 << 20,
            metasize: 20 << 20,
        },
    );
    let replies = call(&mut engine, 3, request).await;
    assert_eq!(replies[0].code, code::GENERIC_ERROR);
    assert_eq!(replies[0].parse::<ErrorReply>().unwrap().err, libc::EINVAL as u32);
}

/// Every chunk in `chunks` has no exception left for snapshot `bit`
async fn assert_no_exceptions(engine: &mut Engine, bit: u8, chunks: std::ops::Range<u64>) {
    for chunk in chunks {
        let found = engine
            .store_mut()
            .test_unique(chunk, Target::Snapshot(bit))
            .await
            .unwrap();
        assert_eq!(found, (false, None), "chunk {} still has an exception for bit {}", chunk, bit);
    }
    let table = engine.store_mut().sharing_table().await.unwrap();
    assert!(table[bit as usize].iter().all(|&count| count == 0));
}

#[tokio::test]
async fn test_full_store_releases_lowest_priority_snapshot() {
    let (_, mut engine) = small_engine(EngineConfig::default(), 2 << 20).await;
    engine.store_mut().create_snapshot(1).await.unwrap();
    attach(&mut engine, ORIGIN, ORIGIN_TAG).await;
    let low = bit_of(&engine, 1);

    // snapshot 1 alone owns the first 200 copies
    for chunk in 0..200 {
        let replies = call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, chunk as u32, chunk, 1)).await;
        assert_eq!(replies[0].code, code::ORIGIN_WRITE_OK);
    }
    engine.store_mut().create_snapshot(2).await.unwrap();
    engine.store_mut().set_priority(2, 10).unwrap();

    let mut chunk = 200;
    while engine.store().snapshot(1).is_some() {
        assert!(chunk < 1000, "store never filled up");
        let replies = call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, chunk as u32, chunk, 1)).await;
        assert_eq!(replies[0].code, code::ORIGIN_WRITE_OK);
        chunk += 1;
    }
    assert!(engine.store().snapshot(2).is_some());
    assert!(!engine.store().snapmask().contains(low));

    for next in chunk..chunk + 20 {
        let replies = call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, next as u32, next, 1)).await;
        assert_eq!(replies[0].code, code::ORIGIN_WRITE_OK);
    }
    assert!(engine.store().snapshot(2).is_some());
    assert_no_exceptions(&mut engine, low, 0..chunk + 20).await;

    let counted = engine.store_mut().count_free(Space::Metadata).await.unwrap();
    assert_eq!(counted, engine.store().superblock().metadata.freechunks);
}

#[tokio::test]
async fn test_snapshot_released_by_its_own_write() {
    let (_, mut engine) = small_engine(EngineConfig::default(), 2 << 20).await;
    engine.store_mut().create_snapshot(1).await.unwrap();
    attach(&mut engine, SNAP, 1).await;
    let bit = bit_of(&engine, 1);

    let mut chunk = 0;
    let failed = loop {
        assert!(chunk < 1000, "store never filled up");
        let replies = call(&mut engine, SNAP, rw(code::QUERY_WRITE, chunk as u32, chunk, 1)).await;
        if replies[0].code == code::SNAPSHOT_WRITE_ERROR {
            let reply = RwReply::decode(&replies[0]).unwrap();
            assert_eq!(reply.ranges[0].exceptions, vec![u64::MAX]);
            break chunk;
        }
        assert_eq!(replies[0].code, code::SNAPSHOT_WRITE_OK);
        chunk += 1;
    };

    // still attached, so squashed rather than deleted
    assert!(engine.store().snapshot(1).unwrap().is_squashed());
    let replies = call(&mut engine, SNAP, rw(code::QUERY_WRITE, 0, failed + 1, 1)).await;
    assert_eq!(replies[0].code, code::SNAPSHOT_WRITE_ERROR);

    // a new snapshot on the same bit starts out empty
    let reused = engine.store_mut().create_snapshot(2).await.unwrap();
    assert_eq!(reused, bit);
    assert_no_exceptions(&mut engine, reused, 0..failed + 2).await;
}

#[tokio::test]
async fn test_requests_beyond_the_origin() {
    let (_, mut engine) = memory_engine(EngineConfig::default()).await;
    engine.store_mut().create_snapshot(1).await.unwrap();
    attach(&mut engine, ORIGIN, ORIGIN_TAG).await;
    attach(&mut engine, SNAP, 1).await;
    let free = engine.store().metadata_usage().free;
    let last = (common::ORIGIN_BYTES >> 12) - 1;

    let replies = call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, 1, 5000, 1)).await;
    assert_eq!(replies[0].code, code::ORIGIN_WRITE_ERROR);
    assert_eq!(replies[0].parse::<RwRequest>().unwrap().id, 1);
    let replies = call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, 2, last, 2)).await;
    assert_eq!(replies[0].code, code::ORIGIN_WRITE_ERROR);
    let replies = call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, 3, u64::MAX, 2)).await;
    assert_eq!(replies[0].code, code::ORIGIN_WRITE_ERROR);

    for request in [
        rw(code::QUERY_WRITE, 4, u64::MAX, 2),
        rw(code::QUERY_SNAPSHOT_READ, 5, u64::MAX - 1, 3),
        rw(code::QUERY_SNAPSHOT_READ, 6, 5000, 1),
    ] {
        let culprit = request.code;
        let replies = call(&mut engine, SNAP, request).await;
        assert_eq!(replies[0].code, code::PROTOCOL_ERROR);
        let refused: ddsnap::protocol::ProtocolErrorReply = replies[0].parse().unwrap();
        assert_eq!(refused.err, errcode::ERROR_REFUSED);
        assert_eq!(refused.culprit, culprit);
    }
    assert!(call(&mut engine, SNAP, rw(code::FINISH_SNAPSHOT_READ, 7, u64::MAX, 2))
        .await
        .is_empty());
    assert_eq!(engine.store().metadata_usage().free, free);

    // the last chunk is still writable
    let replies = call(&mut engine, ORIGIN, rw(code::QUERY_WRITE, 8, last, 1)).await;
    assert_eq!(replies[0].code, code::ORIGIN_WRITE_OK);
    assert_eq!(engine.store().metadata_usage().free, free - 1);
}
