// Throughput benchmarks for the batched surface entry points: evaluation,
// order-2 derivatives, and full point inversion. Batch sizes cover the span
// from interactive probing to bulk tessellation workloads.

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput,
};
use knotwork::{InversionConfig, NurbsSurface};
use ndarray::{array, Array1, Array2, Array3};

/// Batch sizes for the evaluation and derivative benchmarks.
const BATCH_SIZES: [usize; 3] = [100, 10_000, 100_000];
/// Number of world points for the inversion benchmark.
const INVERSION_TARGETS: usize = 256;

/// Bicubic 6x6 patch with concentric height rings, curved over the whole
/// domain so every span does real work.
fn ringed_surface() -> NurbsSurface {
    let mut control_points = Array3::zeros((6, 6, 3));
    for i in 0..6 {
        for j in 0..6 {
            control_points[[i, j, 0]] = i as f64 / 5.0;
            control_points[[i, j, 1]] = j as f64 / 5.0;
            let ring = i.min(j).min(5 - i).min(5 - j);
            control_points[[i, j, 2]] = match ring {
                0 => 1.0 / 3.0,
                1 => 0.0,
                _ => 1.0,
            };
        }
    }
    let knots = array![0.0, 0.0, 0.0, 0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0, 1.0, 1.0, 1.0];
    NurbsSurface::new(
        3,
        3,
        control_points,
        Array2::ones((6, 6)),
        knots.clone(),
        knots,
    )
    .unwrap()
}

/// Deterministic parameter batch that mixes all knot spans.
fn parameter_batch(len: usize) -> (Array1<f64>, Array1<f64>) {
    let us = Array1::from_shape_fn(len, |i| (i as f64 * 0.618_033_988_749_895) % 1.0);
    let vs = Array1::from_shape_fn(len, |i| (i as f64 * 0.414_213_562_373_095) % 1.0);
    (us, vs)
}

fn bench_surface_evaluate(c: &mut Criterion) {
    let surface = ringed_surface();
    let mut group = c.benchmark_group("surface_evaluate");
    for &len in &BATCH_SIZES {
        let (us, vs) = parameter_batch(len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                surface
                    .evaluate(black_box(us.view()), black_box(vs.view()))
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_surface_derivatives(c: &mut Criterion) {
    let surface = ringed_surface();
    let mut group = c.benchmark_group("surface_derivatives_order2");
    for &len in &BATCH_SIZES {
        let (us, vs) = parameter_batch(len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                surface
                    .derivatives(black_box(us.view()), black_box(vs.view()), 2)
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_point_inversion(c: &mut Criterion) {
    let surface = ringed_surface();
    let (us, vs) = parameter_batch(INVERSION_TARGETS);
    let targets = surface.evaluate(us.view(), vs.view()).unwrap();
    let config = InversionConfig::default();

    let mut group = c.benchmark_group("point_inversion");
    group.throughput(Throughput::Elements(INVERSION_TARGETS as u64));
    group.bench_function(BenchmarkId::from_parameter(INVERSION_TARGETS), |b| {
        b.iter(|| {
            surface
                .invert_points(black_box(targets.view()), &config)
                .unwrap()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_surface_evaluate,
    bench_surface_derivatives,
    bench_point_inversion
);
criterion_main!(benches);
