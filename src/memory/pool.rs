//! Fixed-size buffer pools.
//!
//! A pool pre-allocates `count` segments of one size. [`BufferPool::get_buffer`]
//! hands a segment out as a [`MediaBuffer`]; when the last view of that buffer
//! is dropped the segment goes back on the free list and one waiter is woken.
//!
//! # Backpressure
//!
//! When every slot is out, a blocking `get_buffer` waits until one is
//! returned, so a fast producer is throttled by its slowest consumer.

use crate::buffer::{BufferAllocator, BufferKind, MediaBuffer, TrackedSegment};
use crate::error::{Error, Result};
use crate::format::ImageInfo;
use crate::memory::{MemorySegment, MemoryType};
use rkyv::{Archive, Deserialize, Serialize};
use rustix::fd::BorrowedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Pool creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PoolConfig {
    /// Bytes per buffer. Ignored when `image` is set.
    pub buffer_size: u64,
    /// Number of pre-allocated buffers.
    pub buffer_count: u32,
    /// Allocate hardware (DMA-capable) memory.
    pub hardware: bool,
    /// Size slots for this image geometry and tag buffers with it.
    pub image: Option<ImageInfo>,
}

impl PoolConfig {
    /// Pool of untyped buffers.
    pub fn new(buffer_size: usize, buffer_count: u32) -> Self {
        Self {
            buffer_size: buffer_size as u64,
            buffer_count,
            hardware: false,
            image: None,
        }
    }

    /// Pool of image buffers.
    pub fn image(info: ImageInfo, buffer_count: u32) -> Self {
        Self {
            buffer_size: info.frame_size().map_or(0, |size| size as u64),
            buffer_count,
            hardware: false,
            image: Some(info),
        }
    }

    /// Request hardware memory.
    pub fn with_hardware(mut self, hardware: bool) -> Self {
        self.hardware = hardware;
        self
    }

    fn slot_size(&self) -> Option<usize> {
        match self.image {
            Some(info) => info.frame_size(),
            None => usize::try_from(self.buffer_size).ok(),
        }
    }

    fn kind(&self) -> BufferKind {
        match self.image {
            Some(info) => BufferKind::Image(info),
            None => BufferKind::Raw,
        }
    }
}

/// Statistics about pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total buffers in the pool.
    pub capacity: usize,
    /// Currently available buffers.
    pub available: usize,
    /// Currently in-use buffers.
    pub outstanding: usize,
    /// Total number of acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that had to wait for a buffer.
    pub waits: u64,
}

struct PoolInner {
    free: Mutex<Vec<TrackedSegment>>,
    notify: Condvar,
    capacity: usize,
    slot_size: usize,
    kind: BufferKind,
    acquisitions: AtomicU64,
    waits: AtomicU64,
}

impl PoolInner {
    fn give_back(&self, segment: TrackedSegment) {
        let mut free = self.free.lock().unwrap();
        free.push(segment);
        crate::observability::record_pool_available(free.len());
        drop(free);
        self.notify.notify_one();
    }
}

/// A pool slot out on loan; returns itself to the pool when dropped.
struct PoolSlot {
    segment: Option<TrackedSegment>,
    pool: Arc<PoolInner>,
}

impl PoolSlot {
    fn segment(&self) -> &TrackedSegment {
        // Only `Drop` takes the segment out.
        match &self.segment {
            Some(segment) => segment,
            None => unreachable!("pool slot used after drop"),
        }
    }
}

impl MemorySegment for PoolSlot {
    fn as_ptr(&self) -> *const u8 {
        self.segment().as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.segment().as_mut_ptr()
    }

    fn len(&self) -> usize {
        self.segment().len()
    }

    fn memory_type(&self) -> MemoryType {
        self.segment().memory_type()
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.segment().fd()
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        if let Some(segment) = self.segment.take() {
            self.pool.give_back(segment);
        }
    }
}

/// A fixed-size pool of native buffers.
pub struct BufferPool {
    inner: Arc<PoolInner>,
    config: PoolConfig,
}

impl BufferPool {
    /// Pre-allocate every slot.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero count, a zero or overflowing size,
    /// `ResourceExhausted` if any slot cannot be allocated (slots allocated
    /// so far are freed).
    pub fn new(allocator: &BufferAllocator, config: PoolConfig) -> Result<Self> {
        let slot_size = config.slot_size().ok_or_else(|| {
            Error::InvalidArgument(format!("pool slot size overflows for {:?}", config))
        })?;
        if config.buffer_count == 0 || slot_size == 0 {
            return Err(Error::InvalidArgument(format!(
                "pool needs a non-zero size and count, got {} x {}",
                slot_size, config.buffer_count
            )));
        }
        if let Some(info) = config.image
            && !info.is_valid()
        {
            return Err(Error::InvalidArgument(format!(
                "invalid pool image geometry {:?}",
                info
            )));
        }

        let capacity = config.buffer_count as usize;
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(allocator.allocate_segment(slot_size, config.hardware)?);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                notify: Condvar::new(),
                capacity,
                slot_size,
                kind: config.kind(),
                acquisitions: AtomicU64::new(0),
                waits: AtomicU64::new(0),
            }),
            config,
        })
    }

    fn wrap(&self, segment: TrackedSegment) -> MediaBuffer {
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        let slot = PoolSlot {
            segment: Some(segment),
            pool: Arc::clone(&self.inner),
        };
        MediaBuffer::new(Arc::new(slot), self.inner.kind)
    }

    /// Take a buffer without waiting.
    pub fn try_get_buffer(&self) -> Option<MediaBuffer> {
        let segment = self.inner.free.lock().unwrap().pop()?;
        Some(self.wrap(segment))
    }

    /// Take a buffer, waiting for one to be returned if `block` is set.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when the pool is empty and `block` is false.
    pub fn get_buffer(&self, block: bool) -> Result<MediaBuffer> {
        if !block {
            return self
                .try_get_buffer()
                .ok_or_else(|| Error::ResourceExhausted("pool exhausted".into()));
        }

        let mut free = self.inner.free.lock().unwrap();
        if free.is_empty() {
            self.inner.waits.fetch_add(1, Ordering::Relaxed);
        }
        loop {
            if let Some(segment) = free.pop() {
                drop(free);
                return Ok(self.wrap(segment));
            }
            free = self.inner.notify.wait(free).unwrap();
        }
    }

    /// Take a buffer, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if the timeout expires first.
    pub fn get_buffer_timeout(&self, timeout: Duration) -> Result<Option<MediaBuffer>> {
        let deadline = Instant::now() + timeout;
        let mut free = self.inner.free.lock().unwrap();
        if free.is_empty() {
            self.inner.waits.fetch_add(1, Ordering::Relaxed);
        }
        loop {
            if let Some(segment) = free.pop() {
                drop(free);
                return Ok(Some(self.wrap(segment)));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let (guard, _) = self.inner.notify.wait_timeout(free, remaining).unwrap();
            free = guard;
        }
    }

    /// Number of buffers currently out on loan.
    pub fn outstanding(&self) -> usize {
        self.inner.capacity - self.available()
    }

    /// Number of buffers ready to be handed out.
    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.inner.slot_size
    }

    /// Total number of buffers.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Creation parameters.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current usage statistics.
    pub fn stats(&self) -> PoolStats {
        let available = self.available();
        PoolStats {
            capacity: self.inner.capacity,
            available,
            outstanding: self.inner.capacity - available,
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
            waits: self.inner.waits.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.slot_size)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use std::thread;

    #[test]
    fn test_pool_creation() {
        let allocator = BufferAllocator::new();
        let pool = BufferPool::new(&allocator, PoolConfig::new(4096, 4)).unwrap();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(allocator.live(), 4);
    }

    #[test]
    fn test_pool_acquire_release() {
        let allocator = BufferAllocator::new();
        let pool = BufferPool::new(&allocator, PoolConfig::new(1024, 2)).unwrap();

        let a = pool.get_buffer(false).unwrap();
        let b = pool.get_buffer(false).unwrap();
        assert_eq!(pool.outstanding(), 2);

        let err = pool.get_buffer(false).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ResourceExhausted);

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(allocator.live(), 2);
    }

    #[test]
    fn test_shared_view_holds_slot() {
        let allocator = BufferAllocator::new();
        let pool = BufferPool::new(&allocator, PoolConfig::new(64, 1)).unwrap();

        let buffer = pool.get_buffer(false).unwrap();
        let view = buffer.share();
        drop(buffer);
        assert_eq!(pool.available(), 0);
        drop(view);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_image_pool_tags_buffers() {
        let allocator = BufferAllocator::new();
        let info = ImageInfo::new(32, 32, PixelFormat::Nv12);
        let pool = BufferPool::new(&allocator, PoolConfig::image(info, 2)).unwrap();
        let buffer = pool.get_buffer(true).unwrap();
        assert_eq!(Some(buffer.size()), info.frame_size());
        assert_eq!(buffer.image_info(), Some(info));
    }

    #[test]
    fn test_pool_timeout() {
        let allocator = BufferAllocator::new();
        let pool = BufferPool::new(&allocator, PoolConfig::new(64, 1)).unwrap();
        let _held = pool.get_buffer(false).unwrap();

        let start = Instant::now();
        let result = pool.get_buffer_timeout(Duration::from_millis(30)).unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pool_backpressure() {
        let allocator = BufferAllocator::new();
        let pool = Arc::new(BufferPool::new(&allocator, PoolConfig::new(64, 1)).unwrap());
        let held = pool.get_buffer(false).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get_buffer(true).map(|b| b.size()))
        };

        thread::sleep(Duration::from_millis(30));
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), 64);
        assert_eq!(pool.stats().waits, 1);
    }

    #[test]
    fn test_zero_count_rejected() {
        let allocator = BufferAllocator::new();
        let err = BufferPool::new(&allocator, PoolConfig::new(64, 0)).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }
}
