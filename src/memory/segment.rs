//! Memory segment trait and types.

use rustix::fd::BorrowedFd;

/// Type of memory backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// CPU memory (memfd-backed, always shareable by descriptor).
    Cpu,
    /// Memory requested for hardware blocks (DMA-capable).
    ///
    /// On the software backend this is still memfd-backed; the type is kept
    /// so stages and remote peers can tell which allocations were meant for
    /// hardware.
    DmaBuf,
}

impl MemoryType {
    /// Memory type for an allocation request.
    pub fn for_request(hardware: bool) -> Self {
        if hardware { Self::DmaBuf } else { Self::Cpu }
    }
}

/// Trait for memory segment backends.
///
/// A memory segment represents a contiguous region of native memory backing
/// one media buffer. Every segment in this crate is shareable: it exposes a
/// descriptor that can be passed to another process with `SCM_RIGHTS`.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Pointers remain valid for the lifetime of the segment
/// - Thread-safety requirements are met (Send + Sync)
pub trait MemorySegment: Send + Sync {
    /// Get a raw pointer to the start of this segment.
    fn as_ptr(&self) -> *const u8;

    /// Get a mutable pointer to the start of this segment.
    fn as_mut_ptr(&self) -> *mut u8;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;

    /// Descriptor of the native allocation, for cross-process mapping.
    fn fd(&self) -> BorrowedFd<'_>;
}
