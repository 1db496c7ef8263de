//! Uncontended page-lock costs

use criterion::{criterion_group, criterion_main, Criterion};

use arbordb::{Engine, Settings};

fn bench_locks(c: &mut Criterion) {
    let engine = Engine::new(Settings {
        max_workers: 2,
        pool_pages: 8,
        ..Settings::default()
    })
    .unwrap();
    let mut worker = engine.register_worker().unwrap();

    c.bench_function("lock_unlock_uncontended", |b| {
        b.iter(|| {
            worker.lock_page(0);
            worker.unlock_page(0);
        })
    });

    c.bench_function("lock_modify_unlock", |b| {
        b.iter(|| {
            worker.lock_page(1);
            worker.page_block_reads(1);
            worker.unlock_page(1);
        })
    });

    c.bench_function("try_lock_uncontended", |b| {
        b.iter(|| {
            assert!(worker.try_lock_page(2));
            worker.unlock_page(2);
        })
    });
}

criterion_group!(benches, bench_locks);
criterion_main!(benches);
