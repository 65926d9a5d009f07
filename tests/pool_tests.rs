//! Integration tests for buffer pools.
//!
//! These tests verify that:
//! - Pool buffers return to their pool when the last view is dropped
//! - Exhausted pools either fail fast or block until a buffer comes back
//! - A pool cannot be destroyed while any of its buffers is out

use mediaplane::buffer::BufferKind;
use mediaplane::channel::{ChannelConfig, ChannelId, FilterConfig, ModuleKind};
use mediaplane::config::ContextConfig;
use mediaplane::context::Context;
use mediaplane::error::ErrorCode;
use mediaplane::format::{ImageInfo, PixelFormat, Rotation};
use mediaplane::memory::PoolConfig;
use mediaplane::stage::loopback::LoopbackBackend;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn context() -> (Arc<Context>, LoopbackBackend) {
    let backend = LoopbackBackend::new();
    let ctx = Context::new(ContextConfig::default(), Arc::new(backend.clone())).unwrap();
    (Arc::new(ctx), backend)
}

// ============================================================================
// Acquire and release
// ============================================================================

/// Buffers cycle through the pool without new allocations.
#[test]
fn test_pool_recycles_buffers() {
    let (ctx, _) = context();
    let pool = ctx.create_pool(PoolConfig::new(4096, 2)).unwrap();
    assert_eq!(ctx.allocator().live(), 2);

    for _ in 0..10 {
        let a = ctx.get_pool_buffer(pool, false).unwrap().unwrap();
        let b = ctx.get_pool_buffer(pool, false).unwrap().unwrap();
        assert_eq!(a.size(), 4096);
        assert!(ctx.get_pool_buffer(pool, false).unwrap().is_none());
        drop(a);
        drop(b);
    }

    let stats = ctx.pool_stats(pool).unwrap();
    assert_eq!(stats.capacity, 2);
    assert_eq!(stats.available, 2);
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.acquisitions, 20);
    assert_eq!(ctx.allocator().allocated_total(), 2);

    ctx.destroy_pool(pool).unwrap();
    assert_eq!(ctx.allocator().live(), 0);
}

/// Image pools size and tag their buffers from the geometry.
#[test]
fn test_image_pool() {
    let (ctx, _) = context();
    let info = ImageInfo::new(64, 32, PixelFormat::Nv12);
    let pool = ctx.create_pool(PoolConfig::image(info, 1)).unwrap();
    let buffer = ctx.get_pool_buffer(pool, false).unwrap().unwrap();
    assert_eq!(Some(buffer.size()), info.frame_size());
    assert_eq!(buffer.kind(), BufferKind::Image(info));
}

/// Zero-sized or empty pools are rejected.
#[test]
fn test_invalid_pool_config() {
    let (ctx, _) = context();
    assert_eq!(
        ctx.create_pool(PoolConfig::new(0, 4)).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
    assert_eq!(
        ctx.create_pool(PoolConfig::new(4096, 0)).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
    assert_eq!(ctx.allocator().live(), 0);
}

/// Geometry whose byte size overflows is an invalid argument.
#[test]
fn test_overflowing_sizes_rejected() {
    let (ctx, _) = context();
    let huge = ImageInfo::new(u32::MAX, u32::MAX, PixelFormat::Rgba8888);
    assert_eq!(
        ctx.create_image_buffer(huge, false).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
    assert_eq!(
        ctx.create_pool(PoolConfig::image(huge, 1)).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
    assert_eq!(ctx.allocator().live(), 0);
}

// ============================================================================
// Exhaustion
// ============================================================================

/// A blocking acquire completes once another thread returns a buffer.
#[test]
fn test_blocking_acquire_waits_for_release() {
    let (ctx, _) = context();
    let pool = ctx.create_pool(PoolConfig::new(1024, 1)).unwrap();
    let held = ctx.get_pool_buffer(pool, false).unwrap().unwrap();

    let waiter = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || ctx.get_pool_buffer(pool, true))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());
    drop(held);

    let buffer = waiter.join().unwrap().unwrap();
    assert!(buffer.is_some());
    assert!(ctx.pool_stats(pool).unwrap().waits >= 1);
}

/// A timed acquire on an exhausted pool gives up.
#[test]
fn test_acquire_timeout() {
    let (ctx, _) = context();
    let pool = ctx.create_pool(PoolConfig::new(1024, 1)).unwrap();
    let _held = ctx.get_pool_buffer(pool, false).unwrap().unwrap();

    let start = Instant::now();
    let got = ctx
        .get_pool_buffer_timeout(pool, Duration::from_millis(30))
        .unwrap();
    assert!(got.is_none());
    assert!(start.elapsed() >= Duration::from_millis(30));
}

// ============================================================================
// Destruction
// ============================================================================

/// Destroying a pool with buffers out fails with `Busy`.
#[test]
fn test_destroy_busy_pool() {
    let (ctx, _) = context();
    let pool = ctx.create_pool(PoolConfig::new(1024, 2)).unwrap();
    let held = ctx.get_pool_buffer(pool, false).unwrap().unwrap();

    assert_eq!(ctx.destroy_pool(pool).unwrap_err().code(), ErrorCode::Busy);
    drop(held);
    ctx.destroy_pool(pool).unwrap();
    assert_eq!(
        ctx.get_pool_buffer(pool, false).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
}

/// A pool buffer consumed by a channel returns to the pool once delivered.
#[test]
fn test_pool_buffer_through_channel() {
    let (ctx, backend) = context();
    let image = ImageInfo::new(32, 16, PixelFormat::Nv12);
    let id = ChannelId::new(ModuleKind::Rga, 0);
    ctx.set_attr(
        id,
        ChannelConfig::Filter(FilterConfig {
            input: image,
            output: image,
            crop: None,
            rotation: Rotation::R0,
        }),
    )
    .unwrap();
    ctx.enable_channel(id).unwrap();
    ctx.start_get_media_buffer(id).unwrap();

    let pool = ctx.create_pool(PoolConfig::image(image, 1)).unwrap();
    let buffer = ctx.get_pool_buffer(pool, false).unwrap().unwrap();
    ctx.send_media_buffer(id, 0, buffer).unwrap();
    assert_eq!(backend.stage(id).unwrap().input_count(), 1);
    assert_eq!(ctx.pool_stats(pool).unwrap().outstanding, 1);

    let output = ctx.get_media_buffer(id, Some(Duration::ZERO)).unwrap().unwrap();
    drop(output);
    assert_eq!(ctx.pool_stats(pool).unwrap().available, 1);
}
