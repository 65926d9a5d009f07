//! Output delivery benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use mediaplane::buffer::BufferAllocator;
use mediaplane::channel::{ChannelConfig, ChannelId, FilterConfig, ModuleKind};
use mediaplane::config::ContextConfig;
use mediaplane::context::Context;
use mediaplane::delivery::BufferQueue;
use mediaplane::format::{ImageInfo, PixelFormat, Rotation};
use mediaplane::memory::{BufferPool, PoolConfig};
use mediaplane::stage::loopback::LoopbackBackend;
use std::sync::Arc;
use std::time::Duration;

fn bench_queue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_pop");
    let allocator = BufferAllocator::new();
    let pool = BufferPool::new(&allocator, PoolConfig::new(4096, 80)).unwrap();
    let channel = ChannelId::new(ModuleKind::Vi, 0);

    for depth in [1usize, 4, 16, 64] {
        let queue = BufferQueue::new(channel, depth).unwrap();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &queue, |b, queue| {
            b.iter(|| {
                let buffer = pool.try_get_buffer().expect("pool not exhausted");
                queue.push(buffer);
                let popped = queue.pop(Some(Duration::ZERO)).unwrap();
                std::hint::black_box(popped);
            });
        });
    }

    group.finish();
}

fn bench_queue_overflow(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_overflow");
    let allocator = BufferAllocator::new();
    let pool = BufferPool::new(&allocator, PoolConfig::new(4096, 8)).unwrap();
    let queue = BufferQueue::new(ChannelId::new(ModuleKind::Vi, 0), 4).unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("drop_oldest", |b| {
        b.iter(|| {
            let buffer = pool.try_get_buffer().expect("pool not exhausted");
            std::hint::black_box(queue.push(buffer));
        });
    });

    group.finish();
}

fn bench_bound_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("bound_fan_out");
    let backend = LoopbackBackend::new();
    let ctx = Context::new(ContextConfig::default(), Arc::new(backend.clone())).unwrap();
    let image = ImageInfo::new(64, 64, PixelFormat::Nv12);
    let filter = ChannelConfig::Filter(FilterConfig {
        input: image,
        output: image,
        crop: None,
        rotation: Rotation::R0,
    });

    let head = ChannelId::new(ModuleKind::Rga, 0);
    ctx.set_attr(head, filter.clone()).unwrap();
    ctx.enable_channel(head).unwrap();
    for i in 1..=4 {
        let id = ChannelId::new(ModuleKind::Rga, i);
        ctx.set_attr(id, filter.clone()).unwrap();
        ctx.enable_channel(id).unwrap();
        ctx.bind(head, id, 0).unwrap();
    }
    let pool = ctx.create_pool(PoolConfig::image(image, 16)).unwrap();

    group.throughput(Throughput::Elements(4));
    group.bench_function("one_to_four", |b| {
        b.iter(|| {
            let buffer = ctx.get_pool_buffer(pool, false).unwrap().expect("pool not exhausted");
            backend.emit(head, buffer).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_queue_push_pop,
    bench_queue_overflow,
    bench_bound_fan_out
);
criterion_main!(benches);
