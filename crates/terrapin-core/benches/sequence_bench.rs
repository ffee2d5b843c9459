//! Benchmarks for sequence-animator fraction mapping.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use terrapin_core::animator::{Animator, SequenceAnimator, Weighted};

struct Sink;

struct Noop;

impl Animator<Sink> for Noop {
    fn animate(&self, _cx: &mut Sink, _fraction: f64) {}
}

fn build(n: usize) -> SequenceAnimator<Sink> {
    SequenceAnimator::new(
        (0..n)
            .map(|i| Weighted::new(Noop, (i % 17 + 1) as u32))
            .collect(),
    )
}

fn bench_segment_lookup(c: &mut Criterion) {
    let seq = build(100);
    c.bench_function("segment_for_fraction_100", |b| {
        b.iter(|| {
            for i in 0..100 {
                let f = f64::from(i) / 100.0;
                black_box(seq.segment_for_fraction(black_box(f)));
            }
        });
    });
}

fn bench_animate(c: &mut Criterion) {
    let seq = build(100);
    c.bench_function("animate_100_segments", |b| {
        b.iter(|| {
            let mut sink = Sink;
            seq.animate(&mut sink, black_box(0.97));
        });
    });
}

criterion_group!(benches, bench_segment_lookup, bench_animate);
criterion_main!(benches);
