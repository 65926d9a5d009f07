//! Native memory behind media buffers.
//!
//! - [`MemorySegment`]: trait over one contiguous, descriptor-backed region
//! - [`CpuSegment`]: memfd-backed segment, shareable across processes
//! - [`BufferPool`]: fixed-size pool that recycles segments
//! - [`send_with_fds`] / [`recv_with_fds`]: `SCM_RIGHTS` descriptor passing

mod cpu;
mod ipc;
mod pool;
mod segment;

pub use cpu::CpuSegment;
pub use ipc::{MAX_FDS_PER_MESSAGE, recv_with_fds, send_with_fds};
pub use pool::{BufferPool, PoolConfig, PoolStats};
pub use segment::{MemorySegment, MemoryType};
