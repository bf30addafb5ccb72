//! # Walk Benchmarks
//!
//! Performance benchmarks for terrace-core evaluation.
//!
//! Run with: `cargo bench -p terrace-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use terrace_core::nodes::{BlendHeights, HeightNoise, SlopeFromNormal};
use terrace_core::{
    BufferPool, MeshSettings, NodeGuid, PortRef, Session, SessionConfig, snapshot_to_bytes,
};

/// A chain of `depth` blends, each mixing the previous result with fresh noise.
fn create_blend_chain(session: &mut Session, depth: usize) -> NodeGuid {
    let graph = session.graph_mut();
    let mut last = graph.add_node(Box::new(HeightNoise::new(10.0, 0.05)));
    for i in 0..depth {
        let noise = graph.add_node(Box::new(HeightNoise::new(1.0, 0.1 + i as f32 * 0.01)));
        let blend = graph.add_node(Box::new(BlendHeights::new(0.5)));
        graph
            .connect(PortRef::new(last, "height"), PortRef::new(blend, "a"))
            .expect("connect a");
        graph
            .connect(PortRef::new(noise, "height"), PortRef::new(blend, "b"))
            .expect("connect b");
        last = blend;
    }
    last
}

/// `width` independent slope roots over one shared height source.
fn create_fan_out(session: &mut Session, width: usize) -> Vec<NodeGuid> {
    let graph = session.graph_mut();
    let height = graph.add_node(Box::new(HeightNoise::new(10.0, 0.05)));
    (0..width)
        .map(|_| {
            let slope = graph.add_node(Box::new(SlopeFromNormal));
            graph
                .connect(PortRef::new(height, "height"), PortRef::new(slope, "normal"))
                .expect("connect");
            slope
        })
        .collect()
}

fn run_to_completion(session: &mut Session, roots: &[NodeGuid], settings: &MeshSettings) {
    let id = session.evaluate(roots, settings.clone()).expect("evaluate");
    while !session.poll(id).expect("poll").is_terminal() {}
    session.release(id).expect("release");
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_chain_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_depth");
    let settings = MeshSettings::with_resolution(16);

    for depth in [4, 16, 30].iter() {
        let mut session = Session::new(SessionConfig::inline()).expect("session");
        let root = create_blend_chain(&mut session, *depth);

        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, _| {
            b.iter(|| run_to_completion(&mut session, black_box(&[root]), &settings));
        });
    }

    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    let settings = MeshSettings::with_resolution(16);

    for width in [2, 8, 32].iter() {
        let mut session = Session::new(SessionConfig::inline()).expect("session");
        let roots = create_fan_out(&mut session, *width);

        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, _| {
            b.iter(|| run_to_completion(&mut session, black_box(&roots), &settings));
        });
    }

    group.finish();
}

fn bench_threaded_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("threaded_resolution");
    group.sample_size(20);

    for resolution in [64, 256].iter() {
        let mut session = Session::new(SessionConfig::default()).expect("session");
        let root = create_blend_chain(&mut session, 4);
        let settings = MeshSettings::with_resolution(*resolution);

        group.bench_with_input(BenchmarkId::from_parameter(resolution), resolution, |b, _| {
            b.iter(|| run_to_completion(&mut session, &[root], black_box(&settings)));
        });
    }

    group.finish();
}

fn bench_pool_recycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_recycle");

    for count in [8, 64, 256].iter() {
        let mut pool = BufferPool::new();

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let mut pack = pool.new_pack();
                for _ in 0..count {
                    black_box(pool.acquire::<f32>(&mut pack, 1024));
                }
                pool.release_all(pack).expect("release")
            });
        });
    }

    group.finish();
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_encode");

    for depth in [10, 100].iter() {
        let mut session = Session::new(SessionConfig::inline()).expect("session");
        create_blend_chain(&mut session, *depth);
        let snapshot = session.graph().snapshot();

        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, _| {
            b.iter(|| black_box(snapshot_to_bytes(&snapshot)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_chain_depth,
    bench_fan_out,
    bench_threaded_resolution,
    bench_pool_recycle,
    bench_snapshot_encode
);
criterion_main!(benches);
