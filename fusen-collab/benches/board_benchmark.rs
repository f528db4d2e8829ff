use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fusen_collab::fanout::{FanoutEvent, NoteChange};
use fusen_collab::protocol::{BoardMessage, Note, NotePatch};
use fusen_collab::registry::ConnectionRegistry;
use fusen_collab::storage::{KvBackend, RocksKv, StoreConfig};
use fusen_collab::store::NoteStore;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

fn sample_patch() -> NotePatch {
    NotePatch {
        txt: Some("Pick up groceries after standup".to_string()),
        x: Some(120.0),
        y: Some(340.0),
        ..Default::default()
    }
}

fn sample_note(id: &str) -> Note {
    Note::new(id, &sample_patch(), 1_700_000_000_000)
}

fn bench_frame_parse(c: &mut Criterion) {
    let raw = r#"{"act":"insert","id":"n1","txt":"Pick up groceries","x":120,"y":340}"#;

    c.bench_function("frame_parse_insert", |b| {
        b.iter(|| {
            black_box(BoardMessage::parse(black_box(raw)).unwrap());
        })
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let note = sample_note("n1");

    c.bench_function("frame_encode_canonical", |b| {
        b.iter(|| {
            let msg = BoardMessage::insert(black_box(&note));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let note = sample_note("n1");

    c.bench_function("frame_roundtrip", |b| {
        b.iter(|| {
            let encoded = BoardMessage::update(&note).encode().unwrap();
            black_box(BoardMessage::parse(&encoded).unwrap());
        })
    });
}

fn bench_note_merge(c: &mut Criterion) {
    let base = sample_note("n1");
    let patch = NotePatch {
        y: Some(512.0),
        txt: Some("moved".to_string()),
        ..Default::default()
    };

    c.bench_function("note_merge", |b| {
        b.iter(|| {
            let mut note = base.clone();
            note.merge(black_box(&patch));
            black_box(note);
        })
    });
}

fn bench_store_insert_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let patch = sample_patch();

    c.bench_function("store_insert_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = NoteStore::new();
                for i in 0..100 {
                    black_box(store.insert(&format!("note-{i}"), &patch).await);
                }
            });
        })
    });
}

fn bench_store_update(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("store_update", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let store = NoteStore::new();
                store.insert("target", &sample_patch()).await;

                let start = std::time::Instant::now();
                for i in 0..iters {
                    let patch = NotePatch {
                        x: Some(i as f64),
                        ..Default::default()
                    };
                    black_box(store.update("target", &patch).await);
                }
                start.elapsed()
            })
        })
    });
}

fn bench_store_snapshot_1000(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("store_snapshot_1000_notes", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let store = NoteStore::new();
                let patch = sample_patch();
                for i in 0..1000 {
                    store.insert(&format!("note-{i}"), &patch).await;
                }

                let start = std::time::Instant::now();
                for _ in 0..iters {
                    black_box(store.snapshot().await);
                }
                start.elapsed()
            })
        })
    });
}

fn bench_registry_broadcast(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("registry_broadcast_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = ConnectionRegistry::new();

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                    registry.register(Uuid::new_v4(), tx).await;
                    receivers.push(rx);
                }

                let frame = Utf8Bytes::from(
                    BoardMessage::update(&sample_note("n1")).encode().unwrap(),
                );
                black_box(registry.broadcast(black_box(frame)).await);
            });
        })
    });
}

fn bench_registry_broadcast_1000_frames(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("registry_broadcast_1000_frames_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = ConnectionRegistry::new();

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                    registry.register(Uuid::new_v4(), tx).await;
                    receivers.push(rx);
                }

                let frame = Utf8Bytes::from(
                    BoardMessage::update(&sample_note("n1")).encode().unwrap(),
                );
                for _ in 0..1000 {
                    registry.broadcast(frame.clone()).await;
                }
            });
        })
    });
}

fn bench_fanout_event_encode(c: &mut Criterion) {
    let event = FanoutEvent {
        origin: Uuid::new_v4(),
        seq: 42,
        change: NoteChange::Upsert(sample_note("n1")),
    };

    c.bench_function("fanout_event_encode", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

fn bench_fanout_event_decode(c: &mut Criterion) {
    let event = FanoutEvent {
        origin: Uuid::new_v4(),
        seq: 42,
        change: NoteChange::Upsert(sample_note("n1")),
    };
    let encoded = event.encode().unwrap();

    c.bench_function("fanout_event_decode", |b| {
        b.iter(|| {
            black_box(FanoutEvent::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_rocks_note_set(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("fusen_bench_rocks_set_{}", Uuid::new_v4()));
    let config = StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    };
    let kv = RocksKv::open(config).unwrap();
    let value =
        bincode::serde::encode_to_vec(sample_note("n1"), bincode::config::standard()).unwrap();

    c.bench_function("rocks_note_set", |b| {
        let mut i = 0u64;
        b.iter(|| {
            kv.set(&format!("fusen/bench-{i}"), black_box(&value)).unwrap();
            i += 1;
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_rocks_note_get(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("fusen_bench_rocks_get_{}", Uuid::new_v4()));
    let config = StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    };
    let kv = RocksKv::open(config).unwrap();
    let value =
        bincode::serde::encode_to_vec(sample_note("n1"), bincode::config::standard()).unwrap();
    kv.set("fusen/hot", &value).unwrap();

    c.bench_function("rocks_note_get", |b| {
        b.iter(|| {
            black_box(kv.get(black_box("fusen/hot")).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_frame_parse,
    bench_frame_encode,
    bench_frame_roundtrip,
    bench_note_merge,
    bench_store_insert_100,
    bench_store_update,
    bench_store_snapshot_1000,
    bench_registry_broadcast,
    bench_registry_broadcast_1000_frames,
    bench_fanout_event_encode,
    bench_fanout_event_decode,
    bench_rocks_note_set,
    bench_rocks_note_get,
);
criterion_main!(benches);
