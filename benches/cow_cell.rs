use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, Criterion};

use cow_cell::CowCell;

fn bench_load(c: &mut Criterion) {
    let cell = CowCell::new(3u64);
    c.bench_function("load", |b| b.iter(|| black_box(*cell.load())));
}

fn bench_edit(c: &mut Criterion) {
    let cell = CowCell::new(0u64);
    c.bench_function("edit", |b| {
        b.iter(|| cell.edit(|v| *v = v.wrapping_add(1)))
    });
}

fn bench_load_contended(c: &mut Criterion) {
    let cell = Arc::new(CowCell::new(3u64));
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer = {
        let cell = cell.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                cell.edit(|v| *v = v.wrapping_add(1));
            }
        })
    };
    c.bench_function("load_contended", |b| b.iter(|| black_box(*cell.load())));
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    writer.join().unwrap();
}

criterion_group!(benches, bench_load, bench_edit, bench_load_contended);
criterion_main!(benches);
