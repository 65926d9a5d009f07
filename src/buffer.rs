//! Media buffers and the allocator that tracks them.
//!
//! A [`MediaBuffer`] is an owned handle to one unit of native media memory
//! plus its metadata. The native allocation is released exactly once: when
//! the last handle referring to it is dropped. Consumers release a buffer by
//! dropping it (or calling [`MediaBuffer::release`], which reads better at
//! call sites that hand buffers back explicitly).

use crate::channel::ChannelId;
use crate::error::{Error, Result};
use crate::format::{AudioInfo, CodecType, ImageInfo};
use crate::memory::{CpuSegment, MemorySegment, MemoryType};
use rkyv::{Archive, Deserialize, Serialize};
use rustix::fd::BorrowedFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Codec-level flags of a compressed video buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct CodecFlags {
    /// Codec of the payload.
    pub codec: CodecType,
    /// Buffer starts an independently decodable picture.
    pub key_frame: bool,
    /// Temporal (SVC) layer id.
    pub temporal_layer: u8,
}

/// What a buffer contains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum BufferKind {
    /// Untyped bytes.
    #[default]
    Raw,
    /// Raw image with geometry.
    Image(ImageInfo),
    /// Raw PCM audio.
    Audio(AudioInfo),
    /// Compressed video.
    Video(CodecFlags),
}

/// Metadata of a buffer, as carried on the wire next to its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct BufferInfo {
    /// Capacity of the native allocation in bytes.
    pub size: u64,
    /// Bytes of valid payload, `<= size`.
    pub valid_size: u64,
    /// Capture or presentation timestamp in microseconds.
    pub timestamp_us: u64,
    /// Channel that produced the buffer, if any.
    pub origin: Option<ChannelId>,
    /// Payload type and type-specific metadata.
    pub kind: BufferKind,
    /// Whether the allocation was requested as hardware memory.
    pub hardware: bool,
}

// ============================================================================
// Leases
// ============================================================================

/// Something that wants to know when a handed-out buffer is released.
pub(crate) trait LeaseOwner: Send + Sync {
    fn lease_returned(&self);
}

/// Attribution of a buffer to a delivery sink; notifies the owner on drop.
pub(crate) struct Lease {
    owner: Weak<dyn LeaseOwner>,
}

impl Lease {
    pub(crate) fn new(owner: Weak<dyn LeaseOwner>) -> Self {
        Self { owner }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.lease_returned();
        }
    }
}

// ============================================================================
// MediaBuffer
// ============================================================================

/// An owned handle to native media memory plus metadata.
///
/// `MediaBuffer` is deliberately not `Clone`: it has one owner at a time
/// (a consumer, a queue, a pool user, or an RPC session's handle table).
/// Stages that fan a buffer out to several downstreams use [`share`], which
/// creates a second read-only view onto the same allocation; the allocation
/// is freed when the last view is dropped.
///
/// [`share`]: MediaBuffer::share
pub struct MediaBuffer {
    segment: Arc<dyn MemorySegment>,
    valid_size: usize,
    timestamp_us: u64,
    origin: Option<ChannelId>,
    kind: BufferKind,
    lease: Option<Lease>,
}

impl MediaBuffer {
    /// Wrap a segment. The whole segment is considered valid.
    pub fn new(segment: Arc<dyn MemorySegment>, kind: BufferKind) -> Self {
        let valid_size = segment.len();
        Self {
            segment,
            valid_size,
            timestamp_us: 0,
            origin: None,
            kind,
            lease: None,
        }
    }

    /// Rebuild a buffer from a segment and wire metadata.
    pub fn from_info(segment: Arc<dyn MemorySegment>, info: &BufferInfo) -> Result<Self> {
        let valid_size = info.valid_size as usize;
        if valid_size > segment.len() {
            return Err(Error::InvalidArgument(format!(
                "valid size {} exceeds segment size {}",
                valid_size,
                segment.len()
            )));
        }
        Ok(Self {
            segment,
            valid_size,
            timestamp_us: info.timestamp_us,
            origin: info.origin,
            kind: info.kind,
            lease: None,
        })
    }

    /// Capacity of the native allocation.
    pub fn size(&self) -> usize {
        self.segment.len()
    }

    /// Bytes of valid payload.
    pub fn valid_size(&self) -> usize {
        self.valid_size
    }

    /// Set the number of valid payload bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len > size()`.
    pub fn set_valid_size(&mut self, len: usize) {
        assert!(len <= self.size(), "valid size exceeds buffer capacity");
        self.valid_size = len;
    }

    /// Timestamp in microseconds.
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Set the timestamp in microseconds.
    pub fn set_timestamp_us(&mut self, timestamp_us: u64) {
        self.timestamp_us = timestamp_us;
    }

    /// Channel that produced this buffer.
    pub fn origin(&self) -> Option<ChannelId> {
        self.origin
    }

    /// Record the producing channel.
    pub fn set_origin(&mut self, origin: ChannelId) {
        self.origin = Some(origin);
    }

    /// Payload type.
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Replace the payload type (e.g. after an encoder fills the buffer).
    pub fn set_kind(&mut self, kind: BufferKind) {
        self.kind = kind;
    }

    /// Image geometry, for image buffers.
    pub fn image_info(&self) -> Option<ImageInfo> {
        match self.kind {
            BufferKind::Image(info) => Some(info),
            _ => None,
        }
    }

    /// Memory type of the backing allocation.
    pub fn memory_type(&self) -> MemoryType {
        self.segment.memory_type()
    }

    /// Descriptor of the native allocation.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.segment.fd()
    }

    /// The valid payload.
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.segment.as_ptr(), self.valid_size) }
    }

    /// The whole allocation, for producers filling the buffer.
    ///
    /// Views created with [`share`](Self::share) observe these writes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.segment.as_mut_ptr(), self.segment.len()) }
    }

    /// Wire metadata for this buffer.
    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            size: self.size() as u64,
            valid_size: self.valid_size as u64,
            timestamp_us: self.timestamp_us,
            origin: self.origin,
            kind: self.kind,
            hardware: self.memory_type() == MemoryType::DmaBuf,
        }
    }

    /// A second view onto the same allocation.
    ///
    /// The view carries the same metadata but no delivery attribution.
    pub fn share(&self) -> MediaBuffer {
        MediaBuffer {
            segment: Arc::clone(&self.segment),
            valid_size: self.valid_size,
            timestamp_us: self.timestamp_us,
            origin: self.origin,
            kind: self.kind,
            lease: None,
        }
    }

    /// Release this handle.
    pub fn release(self) {
        drop(self);
    }

    pub(crate) fn attach_lease(&mut self, lease: Lease) {
        self.lease = Some(lease);
    }

    pub(crate) fn segment(&self) -> &Arc<dyn MemorySegment> {
        &self.segment
    }
}

impl std::fmt::Debug for MediaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBuffer")
            .field("size", &self.size())
            .field("valid_size", &self.valid_size)
            .field("timestamp_us", &self.timestamp_us)
            .field("origin", &self.origin)
            .field("kind", &self.kind)
            .finish()
    }
}

// ============================================================================
// Allocator
// ============================================================================

#[derive(Default)]
struct AllocatorStats {
    live: AtomicUsize,
    allocated: AtomicU64,
    released: AtomicU64,
}

/// Ties a native allocation to the allocator's books.
struct Allocation {
    stats: Arc<AllocatorStats>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.stats.live.fetch_sub(1, Ordering::AcqRel);
        self.stats.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// A segment whose release is counted by a [`BufferAllocator`].
pub(crate) struct TrackedSegment {
    inner: CpuSegment,
    _allocation: Allocation,
}

impl MemorySegment for TrackedSegment {
    fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn memory_type(&self) -> MemoryType {
        self.inner.memory_type()
    }

    fn fd(&self) -> BorrowedFd<'_> {
        MemorySegment::fd(&self.inner)
    }
}

/// Allocates native buffer memory and keeps count of what is outstanding.
///
/// Every allocation made through the allocator (directly, or as a pool slot)
/// is counted as live until its memory is unmapped.
#[derive(Clone, Default)]
pub struct BufferAllocator {
    stats: Arc<AllocatorStats>,
}

impl BufferAllocator {
    /// Create a new allocator.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_segment(&self, size: usize, hardware: bool) -> Result<TrackedSegment> {
        let name = if hardware {
            "mediaplane-dma"
        } else {
            "mediaplane"
        };
        let inner = CpuSegment::with_name(name, size, MemoryType::for_request(hardware))?;
        self.stats.live.fetch_add(1, Ordering::AcqRel);
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(TrackedSegment {
            inner,
            _allocation: Allocation {
                stats: Arc::clone(&self.stats),
            },
        })
    }

    /// Allocate an untyped buffer.
    pub fn create_buffer(&self, size: usize, hardware: bool) -> Result<MediaBuffer> {
        let segment = self.allocate_segment(size, hardware)?;
        Ok(MediaBuffer::new(Arc::new(segment), BufferKind::Raw))
    }

    /// Allocate a buffer sized for one image.
    pub fn create_image_buffer(&self, info: ImageInfo, hardware: bool) -> Result<MediaBuffer> {
        if !info.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "invalid image geometry {:?}",
                info
            )));
        }
        let size = info.frame_size().ok_or_else(|| {
            Error::InvalidArgument(format!("image geometry {:?} overflows", info))
        })?;
        let segment = self.allocate_segment(size, hardware)?;
        Ok(MediaBuffer::new(Arc::new(segment), BufferKind::Image(info)))
    }

    /// Allocate a buffer sized for one block of audio samples.
    pub fn create_audio_buffer(&self, info: AudioInfo) -> Result<MediaBuffer> {
        if !info.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "invalid audio layout {:?}",
                info
            )));
        }
        let size = info.buffer_size().ok_or_else(|| {
            Error::InvalidArgument(format!("audio layout {:?} overflows", info))
        })?;
        let segment = self.allocate_segment(size, false)?;
        Ok(MediaBuffer::new(Arc::new(segment), BufferKind::Audio(info)))
    }

    /// Number of native allocations not yet released.
    pub fn live(&self) -> usize {
        self.stats.live.load(Ordering::Acquire)
    }

    /// Total allocations made.
    pub fn allocated_total(&self) -> u64 {
        self.stats.allocated.load(Ordering::Relaxed)
    }

    /// Total allocations released.
    pub fn released_total(&self) -> u64 {
        self.stats.released.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("live", &self.live())
            .field("allocated", &self.allocated_total())
            .finish()
    }
}
