//! Buffer allocation and pools.

use super::Context;
use crate::buffer::MediaBuffer;
use crate::error::{Error, Result};
use crate::format::{AudioInfo, ImageInfo};
use crate::memory::{BufferPool, PoolConfig, PoolStats};
use rkyv::{Archive, Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::debug;

/// Handle of a buffer pool created through a [`Context`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, Serialize, Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct PoolId(pub u32);

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

impl Context {
    /// Allocate an untyped buffer.
    pub fn create_buffer(&self, size: usize, hardware: bool) -> Result<MediaBuffer> {
        self.allocator.create_buffer(size, hardware)
    }

    /// Allocate a buffer sized and tagged for one image.
    pub fn create_image_buffer(&self, info: ImageInfo, hardware: bool) -> Result<MediaBuffer> {
        self.allocator.create_image_buffer(info, hardware)
    }

    /// Allocate a buffer sized for one audio frame.
    pub fn create_audio_buffer(&self, info: AudioInfo) -> Result<MediaBuffer> {
        self.allocator.create_audio_buffer(info)
    }

    /// Pre-allocate a pool.
    pub fn create_pool(&self, config: PoolConfig) -> Result<PoolId> {
        let pool = Arc::new(BufferPool::new(&self.allocator, config)?);
        let id = PoolId(self.next_pool.fetch_add(1, Ordering::Relaxed));
        self.pools.lock().unwrap().insert(id, pool);
        debug!(pool = %id, count = config.buffer_count, "pool created");
        Ok(id)
    }

    /// Take a buffer from a pool.
    ///
    /// Without `block`, an exhausted pool yields `Ok(None)`.
    pub fn get_pool_buffer(&self, id: PoolId, block: bool) -> Result<Option<MediaBuffer>> {
        let pool = self.pool(id)?;
        if block {
            pool.get_buffer(true).map(Some)
        } else {
            Ok(pool.try_get_buffer())
        }
    }

    /// Take a buffer from a pool, waiting at most `timeout` for one.
    pub fn get_pool_buffer_timeout(
        &self,
        id: PoolId,
        timeout: Duration,
    ) -> Result<Option<MediaBuffer>> {
        self.pool(id)?.get_buffer_timeout(timeout)
    }

    /// Usage statistics of a pool.
    pub fn pool_stats(&self, id: PoolId) -> Result<PoolStats> {
        Ok(self.pool(id)?.stats())
    }

    /// Destroy a pool. Fails with `Busy` while any of its buffers is out.
    pub fn destroy_pool(&self, id: PoolId) -> Result<()> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools
            .get(&id)
            .ok_or_else(|| Error::InvalidArgument(format!("no {}", id)))?;
        let outstanding = pool.outstanding();
        if outstanding > 0 {
            return Err(Error::Busy(format!(
                "{} has {} buffers outstanding",
                id, outstanding
            )));
        }
        pools.remove(&id);
        debug!(pool = %id, "pool destroyed");
        Ok(())
    }

    fn pool(&self, id: PoolId) -> Result<Arc<BufferPool>> {
        self.pools
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("no {}", id)))
    }
}
