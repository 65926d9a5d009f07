//! The control plane.
//!
//! A [`Context`] owns one [`ChannelTable`] per module kind, the bind edge
//! set, the buffer allocator and the buffer pools. Every control operation
//! is a method on it; there is no global state, so independent contexts can
//! coexist (tests create one each).
//!
//! # Locking
//!
//! Each table has one mutex. An operation holds at most one table lock at a
//! time; multi-channel operations (bind, unbind) lock source and destination
//! one after the other and re-check the destination's generation after
//! re-acquiring it. Buffer queues, pools, event routers and the edge set have
//! their own locks, which are only ever taken after (never before) a table
//! lock.

mod bind;
mod control;
mod io;
mod lifecycle;
mod pools;

pub use pools::PoolId;

use crate::buffer::BufferAllocator;
use crate::channel::{BindEdge, ChannelId, ChannelInfo, ChannelStatus, ChannelTable, ModuleKind};
use crate::config::ContextConfig;
use crate::delivery::{BufferQueue, PrimarySink};
use crate::error::Result;
use crate::memory::BufferPool;
use crate::stage::StageFactory;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Channel tables, bind graph, buffers and pools.
pub struct Context {
    config: ContextConfig,
    factory: Arc<dyn StageFactory>,
    tables: Vec<ChannelTable>,
    edges: Mutex<BTreeSet<BindEdge>>,
    allocator: BufferAllocator,
    pools: Mutex<HashMap<PoolId, Arc<BufferPool>>>,
    next_pool: AtomicU32,
}

impl Context {
    /// Create a context whose stages come from `factory`.
    pub fn new(config: ContextConfig, factory: Arc<dyn StageFactory>) -> Result<Self> {
        config.validate()?;
        let tables = ModuleKind::ALL
            .iter()
            .map(|&kind| ChannelTable::new(kind, config.channel_count(kind), config.default_queue_depth))
            .collect();
        Ok(Self {
            config,
            factory,
            tables,
            edges: Mutex::new(BTreeSet::new()),
            allocator: BufferAllocator::new(),
            pools: Mutex::new(HashMap::new()),
            next_pool: AtomicU32::new(1),
        })
    }

    /// Configuration this context was built with.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Allocator behind `create_buffer` and the pools.
    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    /// Table of one module kind.
    pub fn table(&self, kind: ModuleKind) -> &ChannelTable {
        &self.tables[kind.index()]
    }

    /// Snapshot of one channel.
    pub fn info(&self, id: ChannelId) -> Result<ChannelInfo> {
        self.table(id.kind).info(id)
    }

    /// Status of one channel.
    pub fn status(&self, id: ChannelId) -> Result<ChannelStatus> {
        Ok(self.info(id)?.status)
    }

    /// Every active bind edge, ordered.
    pub fn edges(&self) -> Vec<BindEdge> {
        self.edges.lock().unwrap().iter().copied().collect()
    }

    /// Unbind every edge and destroy every channel.
    pub fn shutdown(&self) {
        for edge in self.edges() {
            if let Err(e) = self.unbind(edge.src, edge.dst) {
                warn!(%edge, error = %e, "unbind during shutdown failed");
            }
        }
        for table in &self.tables {
            for channel in table.active() {
                if let Err(e) = self.destroy_channel(channel.id) {
                    warn!(channel = %channel.id, error = %e, "destroy during shutdown failed");
                }
            }
        }
        info!("context shut down");
    }

    /// Install a non-application pull queue if the channel has no consumer.
    pub(crate) fn restore_implicit_pull(
        &self,
        record: &mut crate::channel::table::ChannelRecord,
    ) -> Result<()> {
        if !self.config.implicit_pull
            || record.bind_ref_out > 0
            || !record.output_active()
            || record.delivery.primary().is_some()
        {
            return Ok(());
        }
        let queue = Arc::new(BufferQueue::new(record.id, record.queue_depth)?);
        record
            .delivery
            .set_primary(Some(PrimarySink::pull(queue, false)));
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("edges", &self.edges.lock().unwrap().len())
            .field("allocator", &self.allocator)
            .finish()
    }
}
