//! Damage Accumulation Benchmarks
//!
//! Measures rectangle merging and buffer-age redraw planning at realistic
//! damage loads: a handful of typing-sized rects, scattered window updates
//! and a near-full-screen video region.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use framerelay::damage::{merge_rects, DamageRect, DamageTracker};

const FRAME_W: u32 = 1920;
const FRAME_H: u32 = 1080;

/// Pseudo-random but deterministic rect scatter
fn scattered_rects(count: usize, size: u32) -> Vec<DamageRect> {
    (0..count as u32)
        .map(|i| {
            let x = (i * 971) % (FRAME_W - size);
            let y = (i * 557) % (FRAME_H - size);
            DamageRect::new(x, y, size, size)
        })
        .collect()
}

/// Adjacent rects along one text row, the typing pattern
fn typing_rects(count: usize) -> Vec<DamageRect> {
    (0..count as u32)
        .map(|i| DamageRect::new(100 + i * 12, 400, 14, 22))
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_rects");

    for (name, rects) in [
        ("typing_8", typing_rects(8)),
        ("scattered_16", scattered_rects(16, 64)),
        ("scattered_64", scattered_rects(64, 32)),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &rects, |b, rects| {
            b.iter(|| black_box(merge_rects(black_box(rects.clone()))))
        });
    }

    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("redraw_plan");

    for history in [2usize, 4, 8] {
        let mut tracker = DamageTracker::new(history);
        tracker.set_frame_size(FRAME_W, FRAME_H);
        // Fill the history with typical per-frame damage.
        for i in 0..history {
            tracker.record(&scattered_rects(6 + i, 48));
        }

        group.bench_with_input(
            BenchmarkId::new("partial", history),
            &tracker,
            |b, tracker| b.iter(|| black_box(tracker.plan(black_box(2)))),
        );
    }

    group.finish();
}

fn bench_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("record");

    let rects = scattered_rects(12, 48);
    group.bench_function("record_12_rects", |b| {
        let mut tracker = DamageTracker::new(4);
        tracker.set_frame_size(FRAME_W, FRAME_H);
        b.iter(|| tracker.record(black_box(&rects)))
    });

    group.finish();
}

criterion_group!(benches, bench_merge, bench_plan, bench_record);
criterion_main!(benches);
