//! Sync-core benchmarks: transform fold throughput and batch codec cost.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fresco_collab::{
    CompressedBatch, MemoryStore, MessageBatch, OpPayload, Operation, OtConfig, OtEngine,
};
use fresco_spatial::Point;
use uuid::Uuid;

fn create_op(room: Uuid, stroke: Uuid) -> Operation {
    Operation::new(
        room,
        Uuid::new_v4(),
        OpPayload::StrokeCreate {
            stroke_id: stroke,
            points: (0..16)
                .map(|i| Point::new(i as f64 * 2.0, (i % 4) as f64 * 3.0))
                .collect(),
            color: [0.1, 0.2, 0.3, 1.0],
            thickness: 2.0,
        },
    )
}

fn bench_transform_fold(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = OtEngine::new(Arc::new(MemoryStore::new()), OtConfig::default());
    let room = Uuid::new_v4();

    // Fill the recent buffer so every benched operation folds through a
    // full concurrent set.
    rt.block_on(async {
        for _ in 0..100 {
            engine
                .process_operation(create_op(room, Uuid::new_v4()), 0)
                .await
                .unwrap();
        }
    });

    c.bench_function("process_op_full_concurrent_set", |b| {
        b.iter(|| {
            rt.block_on(async {
                let op = create_op(room, Uuid::new_v4());
                black_box(engine.process_operation(op, 0).await.unwrap().version)
            })
        })
    });
}

fn bench_batch_codec(c: &mut Criterion) {
    let room = Uuid::new_v4();
    let batch = MessageBatch {
        room_id: room,
        messages: (0..50).map(|_| create_op(room, Uuid::new_v4())).collect(),
        start_time_ms: 0,
        last_update_ms: 0,
        size: 50,
    };

    c.bench_function("compress_50_op_batch", |b| {
        b.iter(|| black_box(CompressedBatch::compress(&batch).unwrap().payload.len()))
    });

    let compressed = CompressedBatch::compress(&batch).unwrap();
    c.bench_function("decompress_50_op_batch", |b| {
        b.iter(|| black_box(compressed.decompress().unwrap().messages.len()))
    });
}

criterion_group!(benches, bench_transform_fold, bench_batch_codec);
criterion_main!(benches);
