//! Queue throughput benchmarks on both backends

use criterion::{Criterion, criterion_group, criterion_main};
use shm_channel::{Backend, Channel, ChannelMode};
use std::hint::black_box;
use std::thread;

type BenchQueue = Channel<u64, 1024, 1>;

fn bench_channel(backend: Backend) -> (tempfile::TempDir, BenchQueue) {
    let dir = tempfile::tempdir().unwrap();
    let name = dir.path().join("bench").to_string_lossy().into_owned();
    let channel = BenchQueue::open(&name, ChannelMode::CREATE, backend).unwrap();
    (dir, channel)
}

/// Single-threaded push immediately followed by pop
fn bench_push_pop(c: &mut Criterion) {
    for backend in [Backend::Posix, Backend::Xsi] {
        let (_dir, channel) = bench_channel(backend);
        let queue = channel.queue();

        c.bench_function(&format!("{backend}_push_pop"), |b| {
            b.iter(|| {
                queue.try_push(black_box(42)).unwrap();
                black_box(queue.try_pop().unwrap());
            });
        });

        channel.remove().unwrap();
    }
}

/// One producer thread against one consumer thread, 10k elements per iteration
fn bench_spsc_transfer(c: &mut Criterion) {
    const BATCH: u64 = 10_000;
    let (_dir, channel) = bench_channel(Backend::Posix);
    let queue = channel.queue();

    c.bench_function("posix_spsc_10k", |b| {
        b.iter(|| {
            thread::scope(|s| {
                s.spawn(|| {
                    for i in 0..BATCH {
                        queue.push(i);
                    }
                });
                let sum: u64 = (0..BATCH).map(|_| queue.pop()).sum();
                black_box(sum);
            });
        });
    });

    channel.remove().unwrap();
}

/// Area lock acquire/release round trip
fn bench_area_lock(c: &mut Criterion) {
    for backend in [Backend::Posix, Backend::Xsi] {
        let (_dir, channel) = bench_channel(backend);
        let lock = channel.lock();

        c.bench_function(&format!("{backend}_area_lock"), |b| {
            b.iter(|| {
                lock.lock().unwrap();
                lock.unlock().unwrap();
            });
        });

        drop(lock);
        channel.remove().unwrap();
    }
}

criterion_group!(benches, bench_push_pop, bench_spsc_transfer, bench_area_lock);
criterion_main!(benches);
