//! Benchmarks for row channels and whole-pipeline throughput
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowrun::config::{ChannelKind, EngineConfig, IntExpr, PipelineType};
use flowrun::pipeline::{
    Channel, ChannelFlavor, ChannelId, CopyKey, PipelineDefinition, SingleThreadedExecutor,
    StageDefinition,
};
use flowrun::{row, BuiltinStageFactory, Pipeline};
use std::sync::Arc;

const ROWS: usize = 10_000;

fn channel(flavor: ChannelFlavor) -> Arc<Channel> {
    Arc::new(Channel::new(
        ChannelId(0),
        flavor,
        CopyKey::new("producer", 0),
        CopyKey::new("consumer", 0),
        1_000,
    ))
}

fn bench_channel_put_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_put_get");
    group.throughput(Throughput::Elements(ROWS as u64));

    for (name, flavor) in [
        ("blocking", ChannelFlavor::Blocking),
        ("batching", ChannelFlavor::Batching { batch_size: 100 }),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &flavor, |b, &flavor| {
            b.iter(|| {
                let ch = channel(flavor);
                let producer = {
                    let ch = ch.clone();
                    std::thread::spawn(move || {
                        for i in 0..ROWS as i64 {
                            ch.put_row(row![i]);
                        }
                        while !ch.flush_wait(std::time::Duration::from_millis(10)) {}
                        ch.set_done();
                    })
                };
                let mut n = 0;
                while !ch.is_finished() {
                    if let Some(r) = ch.get_row_wait(std::time::Duration::from_millis(10)) {
                        black_box(r);
                        n += 1;
                    }
                }
                producer.join().unwrap();
                assert_eq!(n, ROWS);
            });
        });
    }

    group.finish();
}

fn linear(copies: i64) -> PipelineDefinition {
    PipelineDefinition::new("bench")
        .stage(StageDefinition::new("gen", "generate_rows").with_setting("limit", ROWS as i64))
        .stage(StageDefinition::new("mid", "dummy").with_copies(copies))
        .stage(StageDefinition::new("out", "dummy"))
        .hop("gen", "mid")
        .hop("mid", "out")
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(ROWS as u64));
    group.sample_size(20);

    for copies in [1i64, 4] {
        for kind in [ChannelKind::Blocking, ChannelKind::Batching] {
            let id = format!("{}x{}", kind, copies);
            group.bench_function(BenchmarkId::new("threaded", id), |b| {
                b.iter(|| {
                    let engine = Pipeline::builder(linear(copies), Arc::new(BuiltinStageFactory::new()))
                        .config(EngineConfig {
                            channel_kind: kind,
                            rowset_size: IntExpr::Value(1_000),
                            ..Default::default()
                        })
                        .build();
                    engine.execute().unwrap();
                    engine.wait_until_finished();
                    black_box(engine.result());
                });
            });
        }
    }

    group.bench_function("single_threaded", |b| {
        b.iter(|| {
            let engine = Pipeline::builder(linear(1), Arc::new(BuiltinStageFactory::new()))
                .config(EngineConfig {
                    pipeline_type: PipelineType::SingleThreaded,
                    ..Default::default()
                })
                .build();
            engine.execute().unwrap();
            SingleThreadedExecutor::new(engine.clone())
                .unwrap()
                .run()
                .unwrap();
            black_box(engine.result());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_channel_put_get, bench_pipeline);
criterion_main!(benches);
