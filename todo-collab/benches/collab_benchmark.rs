use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use todo_collab::broadcast::BroadcastGroup;
use todo_collab::client::OfflineQueue;
use todo_collab::protocol::{PeerInfo, SyncMessage};
use todo_collab::storage::{CompressedDelta, DocumentStore, StorageConfig};
use todo_core::{Replica, StoreConfig, TodoStore};
use uuid::Uuid;

/// A real engine update: one created item.
fn create_update() -> Vec<u8> {
    let mut store = TodoStore::open(Replica::new(), &StoreConfig::default()).unwrap();
    let mut feed = store.replica().update_feed().unwrap();
    store.create("Buy milk and eggs").unwrap();
    feed.drain().concat()
}

// ─── Protocol ───────────────────────────────────────────────────

fn bench_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let update = create_update();

    c.bench_function("update_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(peer), black_box(1), black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(Uuid::new_v4(), 1, create_update())
        .encode()
        .unwrap();

    c.bench_function("update_decode", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

// ─── Fan-out ────────────────────────────────────────────────────

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let update = create_update();

    c.bench_function("broadcast_1000_msgs_10_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);
                let mut receivers = Vec::new();
                for i in 0..10 {
                    receivers.push(group.add_peer(PeerInfo::new(format!("anon{i}"))).await);
                }
                let from = Uuid::new_v4();
                for clock in 0..1000 {
                    let msg = SyncMessage::update(from, clock, update.clone());
                    group.broadcast(from, &msg).unwrap();
                }
                black_box(receivers);
            })
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_enqueue_drain", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(2000);
            for i in 0..1000 {
                queue.enqueue(i, vec![0u8; 64]);
            }
            black_box(queue.drain());
        })
    });
}

// ─── Storage ────────────────────────────────────────────────────

fn bench_lz4_compress_update(c: &mut Criterion) {
    let update = create_update();

    c.bench_function("lz4_compress_update", |b| {
        b.iter(|| {
            black_box(CompressedDelta::compress(1, black_box(&update)));
        })
    });
}

fn bench_store_delta(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StorageConfig::for_testing(dir.path().join("db"))).unwrap();
    let update = create_update();
    let mut version = 0u64;

    c.bench_function("store_delta", |b| {
        b.iter(|| {
            version += 1;
            store.store_delta(black_box(version), black_box(&update)).unwrap();
        })
    });
}

fn bench_load_deltas_1000(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StorageConfig::for_testing(dir.path().join("db"))).unwrap();
    let update = create_update();
    for version in 1..=1000u64 {
        store.store_delta(version, &update).unwrap();
    }

    c.bench_function("load_deltas_1000", |b| {
        b.iter(|| {
            black_box(store.load_deltas_since(black_box(1)).unwrap());
        })
    });
}

fn bench_save_snapshot_100_items(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StorageConfig::for_testing(dir.path().join("db"))).unwrap();
    let mut todos = TodoStore::open(Replica::new(), &StoreConfig::default()).unwrap();
    for i in 0..100 {
        todos.create(&format!("item {i}")).unwrap();
    }
    let state = todos.replica().encode_state();

    c.bench_function("save_snapshot_100_items", |b| {
        b.iter(|| {
            black_box(store.save_snapshot(1, black_box(&state)).unwrap());
        })
    });
}

criterion_group!(
    protocol_benches,
    bench_update_encode,
    bench_update_decode,
);

criterion_group!(
    fanout_benches,
    bench_broadcast_1000_messages,
    bench_offline_queue,
);

criterion_group!(
    storage_benches,
    bench_lz4_compress_update,
    bench_store_delta,
    bench_load_deltas_1000,
    bench_save_snapshot_100_items,
);

criterion_main!(protocol_benches, fanout_benches, storage_benches);
