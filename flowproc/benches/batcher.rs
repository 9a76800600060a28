use std::cell::RefCell;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use flowproc::{batcher::Batcher, processor::CancelToken, result::Res};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 1024;

fn batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("Batcher");
    group.throughput(Throughput::Elements(1));

    for max_size in [8usize, 64, 512] {
        group.bench_function(format!("max_size={max_size}; size-triggered"), |b| {
            let i = RefCell::new(0i64);
            let (tx, input) = mpsc::channel(CHANNEL_CAPACITY);

            // `Batcher::process` spawns its driver task via `tokio::spawn`,
            // which panics outside a runtime context, so the runtime must
            // exist (and be entered) before `process` is called.
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let mut output = {
                let _guard = runtime.enter();
                Batcher::new(max_size).process(input, CancelToken::new())
            };

            runtime.spawn(async move {
                loop {
                    if output.recv().await.is_none() {
                        return;
                    }
                }
            });

            b.to_async(&runtime).iter(|| async {
                let mut i = i.borrow_mut();
                tx.send(Res::success(*i)).await.unwrap();
                *i += 1;
            });
        });
    }
}

criterion_group!(benches, batching);
criterion_main!(benches);
