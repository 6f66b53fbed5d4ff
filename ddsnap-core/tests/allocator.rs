mod common;

use std::collections::HashSet;

use common::memory_devices;
use ddsnap::block_bitmap::Space;
use ddsnap::{EngineConfig, SnapStore};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

async fn churn(config: EngineConfig, seed: u64) {
    let devices = memory_devices().await;
    let mut store = SnapStore::open(devices, config).await.unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let start = store.superblock().metadata.freechunks;
    let mut held: Vec<u64> = Vec::new();
    let mut owned = HashSet::new();

    for round in 0..20 {
        let allocs = rng.gen_range(1..120);
        for _ in 0..allocs {
            let chunk = store
                .alloc_chunk(Space::Snapdata)
                .await
                .unwrap()
                .expect("store ran out of chunks");
            assert!(owned.insert(chunk), "round {}: chunk {} handed out twice", round, chunk);
            held.push(chunk);
            if rng.gen_bool(0.1) {
                store.commit_transaction(false).await.unwrap();
            }
        }
        store.commit_deferred_allocs().await.unwrap();

        held.shuffle(&mut rng);
        let frees = rng.gen_range(0..=held.len());
        for chunk in held.drain(..frees) {
            assert!(store.free_chunk(Space::Snapdata, chunk).await.unwrap());
            owned.remove(&chunk);
        }
        store.commit_transaction(false).await.unwrap();

        let tracked = store.superblock().metadata.freechunks;
        assert_eq!(tracked, start - held.len() as u64);
        assert_eq!(store.count_free(Space::Snapdata).await.unwrap(), tracked);
    }

    for chunk in held.drain(..) {
        assert!(store.free_chunk(Space::Snapdata, chunk).await.unwrap());
    }
    store.cleanup().await.unwrap();
    assert_eq!(store.superblock().metadata.freechunks, start);
}

#[tokio::test]
async fn test_random_alloc_free() {
    for seed in 0..4 {
        churn(EngineConfig::default(), seed).await;
    }
}

#[tokio::test]
async fn test_random_alloc_free_deferred() {
    for seed in 0..4 {
        let config = EngineConfig {
            defer_allocs: true,
            ..EngineConfig::default()
        };
        churn(config, seed).await;
    }
}

#[tokio::test]
async fn test_small_deferred_range_limit() {
    let config = EngineConfig {
        defer_allocs: true,
        max_deferred_allocs: 3,
        ..EngineConfig::default()
    };
    churn(config, 99).await;
}

#[tokio::test]
async fn test_double_free_is_refused() {
    let devices = memory_devices().await;
    let mut store = SnapStore::open(devices, EngineConfig::default()).await.unwrap();
    let chunk = store.alloc_chunk(Space::Snapdata).await.unwrap().unwrap();
    assert!(store.free_chunk(Space::Snapdata, chunk).await.unwrap());
    assert!(!store.free_chunk(Space::Snapdata, chunk).await.unwrap());
    let total = store.superblock().metadata.chunks;
    assert!(!store.free_chunk(Space::Snapdata, total).await.unwrap());
}
