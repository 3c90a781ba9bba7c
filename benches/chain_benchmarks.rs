use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_deferred::{Deferred, DeferredList, Outcome};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn chain_firing_benchmark(c: &mut Criterion) {
    init_tracing();
    let mut group = c.benchmark_group("chain_firing");

    for length in [1u64, 16, 256].iter() {
        group.throughput(Throughput::Elements(*length));
        group.bench_with_input(BenchmarkId::from_parameter(length), length, |b, &length| {
            b.iter(|| {
                let d = Deferred::<u64>::new();
                for _ in 0..length {
                    d.add_callback(|v| Outcome::Value(v + 1)).unwrap();
                }
                d.callback(black_box(0)).unwrap();
                black_box(d.result())
            })
        });
    }

    group.finish();
}

fn nested_resume_benchmark(c: &mut Criterion) {
    c.bench_function("nested_resume", |b| {
        b.iter(|| {
            let outer = Deferred::<u64>::new();
            let (inner, resolver) = Deferred::pair();
            outer.add_callback(move |_| Outcome::Nested(inner)).unwrap();
            outer.callback(1).unwrap();
            resolver.callback(black_box(2)).unwrap();
            black_box(outer.result())
        })
    });
}

fn fan_in_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_in");

    for width in [4usize, 64, 1024].iter() {
        group.throughput(Throughput::Elements(*width as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, &width| {
            b.iter(|| {
                let children: Vec<Deferred<usize>> = (0..width).map(|_| Deferred::new()).collect();
                let list = DeferredList::new(children.clone()).unwrap();
                for (i, child) in children.iter().enumerate() {
                    child.callback(i).unwrap();
                }
                black_box(list.finished_count())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    chain_firing_benchmark,
    nested_resume_benchmark,
    fan_in_benchmark
);
criterion_main!(benches);
