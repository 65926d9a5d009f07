//! memfd-backed memory segment.
//!
//! `CpuSegment` is the native allocation behind every [`MediaBuffer`]. It is
//! created with `memfd_create` and mapped `MAP_SHARED`, so the descriptor can
//! be handed to a remote process which maps the same physical pages.
//!
//! [`MediaBuffer`]: crate::buffer::MediaBuffer

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

static SEGMENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_segment_id() -> u64 {
    SEGMENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A memfd-backed, shareable memory segment.
///
/// # Memory Model
///
/// - Backed by `memfd_create` (anonymous file in memory)
/// - Mapped with `MAP_SHARED` (changes visible across mappings)
/// - The descriptor can be sent via `SCM_RIGHTS` for cross-process sharing
pub struct CpuSegment {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
    id: u64,
    memory_type: MemoryType,
}

impl CpuSegment {
    /// Allocate a new CPU segment.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_name("mediaplane", size, MemoryType::Cpu)
    }

    /// Allocate a segment with a debug name (visible in `/proc/self/fd/`).
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` if `size` is 0 or the kernel refuses the
    /// allocation.
    pub fn with_name(name: &str, size: usize, memory_type: MemoryType) -> Result<Self> {
        if size == 0 {
            return Err(Error::ResourceExhausted(
                "size must be greater than 0".into(),
            ));
        }

        let cname = CString::new(name).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| Error::ResourceExhausted(format!("memfd_create: {}", e)))?;
        rustix::fs::ftruncate(&fd, size as u64)
            .map_err(|e| Error::ResourceExhausted(format!("ftruncate({}): {}", size, e)))?;

        // SAFETY: fresh mapping of a descriptor we own, sized by ftruncate above.
        let ptr = unsafe { Self::map(&fd, size)? };

        Ok(Self {
            fd,
            ptr,
            len: size,
            id: next_segment_id(),
            memory_type,
        })
    }

    /// Map a descriptor received from another process.
    ///
    /// The size is queried with `fstat`, so any memfd is accepted.
    pub fn from_fd(fd: OwnedFd, memory_type: MemoryType) -> Result<Self> {
        let stat = rustix::fs::fstat(&fd)?;
        let size = stat.st_size as usize;

        if size == 0 {
            return Err(Error::InvalidArgument("memfd has zero size".into()));
        }

        // SAFETY: size comes from fstat on the same descriptor.
        let ptr = unsafe { Self::map(&fd, size)? };

        Ok(Self {
            fd,
            ptr,
            len: size,
            id: next_segment_id(),
            memory_type,
        })
    }

    unsafe fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
        // SAFETY: caller guarantees the descriptor covers `size` bytes.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::ResourceExhausted("mmap returned null".into()))
    }

    /// Unique segment ID within this process.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Duplicate the descriptor (a second mapping of the same pages).
    pub fn try_clone(&self) -> Result<Self> {
        let new_fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        Self::from_fd(new_fd, self.memory_type)
    }
}

impl MemorySegment for CpuSegment {
    #[inline]
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    #[inline]
    fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for CpuSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is process-wide and the descriptor is kernel refcounted.
// Concurrent access to the bytes is synchronized by buffer ownership.
unsafe impl Send for CpuSegment {}
unsafe impl Sync for CpuSegment {}

impl AsFd for CpuSegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for CpuSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuSegment")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("memory_type", &self.memory_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(segment: &CpuSegment) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(segment.as_mut_ptr(), segment.len()) }
    }

    #[test]
    fn test_cpu_segment_creation() {
        let segment = CpuSegment::new(4096).unwrap();
        assert_eq!(segment.len(), 4096);
        assert_eq!(segment.memory_type(), MemoryType::Cpu);
        assert!(segment.id() > 0);
    }

    #[test]
    fn test_cpu_segment_zero_size_fails() {
        let err = CpuSegment::new(0).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ResourceExhausted);
    }

    #[test]
    fn test_from_fd_shares_pages() {
        let original = CpuSegment::with_name("test", 4096, MemoryType::DmaBuf).unwrap();
        bytes(&original)[0] = 123;

        let dup_fd = rustix::io::fcntl_dupfd_cloexec(&original.fd, 0).unwrap();
        let reopened = CpuSegment::from_fd(dup_fd, MemoryType::DmaBuf).unwrap();
        assert_eq!(reopened.len(), 4096);
        assert_eq!(bytes(&reopened)[0], 123);

        bytes(&reopened)[100] = 7;
        assert_eq!(bytes(&original)[100], 7);
    }

    #[test]
    fn test_try_clone_new_id_same_memory() {
        let original = CpuSegment::new(4096).unwrap();
        bytes(&original)[1] = 99;

        let cloned = original.try_clone().unwrap();
        assert_ne!(original.id(), cloned.id());
        assert_eq!(bytes(&cloned)[1], 99);
    }
}
