#![allow(dead_code)]

use std::sync::Arc;

use ddsnap::blockdev::{BlockDevice, MemoryBlockDevice};
use ddsnap::protocol::{code, ChunkRange, Identify, Message, RwRequest, SnapTag};
use ddsnap::{initialize, Devices, Engine, EngineConfig, FormatOptions};

pub const ORIGIN_BYTES: u64 = 16 << 20;
pub const STORE_BYTES: u64 = 8 << 20;

pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Freshly formatted in-memory devices: 16 MiB origin, 8 MiB combined store
pub async fn memory_devices() -> Devices {
    init_logging();
    let origin: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(ORIGIN_BYTES));
    let store: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(STORE_BYTES));
    let devices = Devices::combined(origin, store);
    format(&devices).await;
    devices
}

/// Format with a 64 block journal
pub async fn format(devices: &Devices) {
    init_logging();
    let options = FormatOptions {
        journal_bytes: 64 << 12,
        ..FormatOptions::default()
    };
    initialize(devices.clone(), &options)
        .await
        .expect("format failed");
}

/// Engine over a combined store of `store_bytes`, for filling it up
pub async fn small_engine(config: EngineConfig, store_bytes: u64) -> (Devices, Engine) {
    let origin: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(ORIGIN_BYTES));
    let store: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(store_bytes));
    let devices = Devices::combined(origin, store);
    format(&devices).await;
    let engine = Engine::open(devices.clone(), config)
        .await
        .expect("open failed");
    (devices, engine)
}

pub async fn memory_engine(config: EngineConfig) -> (Devices, Engine) {
    let devices = memory_devices().await;
    let engine = Engine::open(devices.clone(), config)
        .await
        .expect("open failed");
    (devices, engine)
}

pub fn identify(snap: u32, len: u64) -> Message {
    Message::new(
        code::IDENTIFY,
        &Identify {
            id: 0x1234,
            snap,
            off: 0,
            len,
        },
    )
}

pub fn rw(code: u32, id: u32, chunk: u64, chunks: u32) -> Message {
    Message::new(
        code,
        &RwRequest {
            id,
            ranges: vec![ChunkRange { chunk, chunks }],
        },
    )
}

pub fn tagged(code: u32, snap: u32) -> Message {
    Message::new(code, &SnapTag { snap })
}

/// Send one message and return the replies, all addressed to `client`
pub async fn call(engine: &mut Engine, client: u64, message: Message) -> Vec<Message> {
    let out = engine.handle(client, message).await.expect("engine failure");
    assert!(!out.disconnect, "client {} was disconnected", client);
    out.replies
        .into_iter()
        .map(|(to, reply)| {
            assert_eq!(to, client);
            reply
        })
        .collect()
}

/// Connect `client` and identify it as a client of `snap`
pub async fn attach(engine: &mut Engine, client: u64, snap: u32) {
    let len = if snap == ddsnap::ORIGIN_TAG {
        engine.store().superblock().orgsectors
    } else {
        engine.store().snapshot(snap).expect("no such snapshot").sectors
    };
    engine.connect(client);
    let replies = call(engine, client, identify(snap, len)).await;
    assert_eq!(replies[0].code, code::IDENTIFY_OK);
}
