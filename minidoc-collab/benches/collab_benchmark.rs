use criterion::{black_box, criterion_group, criterion_main, Criterion};
use minidoc_collab::protocol::{normalize_title, ControlMessage, Frame};
use minidoc_collab::replica::{ReplicaAdapter, YrsEngine};
use minidoc_collab::room::{sanitize, RoomConfig, RoomRegistry};
use minidoc_collab::storage::{DocumentId, DocumentRepository, MemoryStore, RocksStore, StoreConfig};
use minidoc_collab::OfflineQueue;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Bytes;
use uuid::Uuid;
use yrs::{ReadTxn, StateVector, Text, Transact};

fn text_update(content: &str) -> Vec<u8> {
    let doc = yrs::Doc::new();
    let text = doc.get_or_insert_text("content");
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, content);
    }
    let update = doc.transact().encode_state_as_update_v1(&StateVector::default());
    update
}

fn bench_sanitize(c: &mut Criterion) {
    let id = DocumentId::new("3f2c9a1e-quarterly plan/draft#2");

    c.bench_function("sanitize_room_key", |b| {
        b.iter(|| {
            black_box(sanitize(black_box(&id)));
        })
    });
}

fn bench_control_parse(c: &mut Criterion) {
    let title = r#"{"eventType":"TITLE_UPDATE","title":"  Roadmap  ","senderId":"c1"}"#;
    let save = r#"{"eventType":"SAVE","senderId":"c1"}"#;

    c.bench_function("control_parse_title", |b| {
        b.iter(|| {
            let msg = ControlMessage::parse(black_box(title)).unwrap();
            if let ControlMessage::TitleUpdate { title, .. } = msg {
                black_box(normalize_title(&title));
            }
        })
    });

    c.bench_function("control_parse_save", |b| {
        b.iter(|| {
            black_box(ControlMessage::parse(black_box(save)).unwrap());
        })
    });
}

fn bench_replica_apply(c: &mut Criterion) {
    let updates: Vec<Vec<u8>> = (0..100).map(|i| text_update(&format!("edit {i}"))).collect();

    c.bench_function("replica_apply_100_updates", |b| {
        b.iter(|| {
            let mut replica = ReplicaAdapter::load(&YrsEngine, &[]).unwrap();
            let origin = Uuid::new_v4();
            for update in &updates {
                replica.apply_update(origin, black_box(update)).unwrap();
            }
            black_box(replica.updates_applied());
        })
    });
}

fn bench_replica_snapshot(c: &mut Criterion) {
    let mut replica = ReplicaAdapter::load(&YrsEngine, &[]).unwrap();
    for i in 0..1000 {
        replica.apply_update(Uuid::new_v4(), &text_update(&format!("line {i}\n"))).unwrap();
    }

    c.bench_function("replica_snapshot_1000_edits", |b| {
        b.iter(|| {
            black_box(replica.snapshot());
        })
    });
}

fn bench_room_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("room_broadcast_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = RoomRegistry::new(
                    Arc::new(MemoryStore::new()),
                    Arc::new(YrsEngine),
                    RoomConfig::default(),
                );
                let doc = DocumentId::new("bench");

                let mut feeds = Vec::new();
                let mut room = None;
                for _ in 0..100 {
                    let (joined, feed) = registry.join(&doc, Uuid::new_v4()).await.unwrap();
                    room = Some(joined);
                    feeds.push(feed);
                }

                let room = room.unwrap();
                let frame = Frame::Binary(Bytes::from(vec![0u8; 64]));
                black_box(room.broadcast(black_box(frame), None));
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for _ in 0..1000 {
                queue.enqueue(vec![0u8; 64]);
            }
            let drained = queue.drain();
            black_box(drained);
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────

fn bench_save_content(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("minidoc_bench_save_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let doc = store.create("Bench").unwrap();
    let snapshot = vec![0u8; 4096];

    c.bench_function("save_content_4KB", |b| {
        b.iter(|| {
            store.save_content(black_box(&doc.id), black_box(&snapshot)).unwrap();
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_get_document(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("minidoc_bench_get_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let doc = store.create("Bench").unwrap();
    store.save_content(&doc.id, &vec![0u8; 4096]).unwrap();

    c.bench_function("get_document_4KB", |b| {
        b.iter(|| {
            black_box(store.get(black_box(&doc.id)).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_sanitize,
    bench_control_parse,
    bench_replica_apply,
    bench_replica_snapshot,
    bench_room_fanout,
    bench_offline_queue,
    bench_save_content,
    bench_get_document,
);
criterion_main!(benches);
