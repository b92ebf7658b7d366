//! Benchmarks for output classification.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use refineflow::classify::{Label, ReflectionClassifier};

fn classify_benchmark(c: &mut Criterion) {
    let classifier = ReflectionClassifier::new();
    let reflection = "After thinking it over, I disagree with parts of it, \
                      but overall the critique is reasonable.";
    c.bench_function("reflection_accepts", |b| {
        b.iter(|| classifier.accepts(black_box(reflection)))
    });

    let judgment = "Both suggestions are polite. Suggestion 2 is more considerate of the friend.";
    c.bench_function("label_parse", |b| b.iter(|| Label::parse(black_box(judgment))));
}

criterion_group!(benches, classify_benchmark);
criterion_main!(benches);
