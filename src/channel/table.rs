//! Per-kind channel table.
//!
//! One [`ChannelTable`] per module kind holds every channel slot of that kind
//! behind a single mutex. All slots exist from construction (CLOSED) and are
//! recycled, never removed.

use super::{ChannelConfig, ChannelId, ChannelStatus, ModuleKind};
use crate::delivery::{ChannelDelivery, DeliveryMode};
use crate::error::{Error, Result};
use crate::event::ChannelEvents;
use crate::stage::{Stage, StageChain};
use rkyv::{Archive, Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Snapshot of one channel's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ChannelInfo {
    /// Channel identity.
    pub id: ChannelId,
    /// Lifecycle status.
    pub status: ChannelStatus,
    /// Active edges into this channel.
    pub bind_ref_in: u32,
    /// Active edges out of this channel.
    pub bind_ref_out: u32,
    /// Current delivery mode.
    pub mode: DeliveryMode,
    /// Configured queue depth.
    pub queue_depth: u32,
    /// Buffers waiting in the pull queue.
    pub queued: u32,
    /// Number of stages the channel owns.
    pub stages: u32,
}

/// State of one channel slot. Only touched under the table lock.
pub(crate) struct ChannelRecord {
    pub(crate) id: ChannelId,
    pub(crate) status: ChannelStatus,
    pub(crate) config: Option<ChannelConfig>,
    pub(crate) stages: StageChain,
    pub(crate) bind_ref_in: u32,
    pub(crate) bind_ref_out: u32,
    pub(crate) queue_depth: usize,
    /// Bumped on every enable and disable; lets a multi-step operation
    /// detect that the channel was recycled between two lock acquisitions.
    pub(crate) generation: u64,
    /// An enable is creating stages outside the lock.
    pub(crate) enabling: bool,
    pub(crate) delivery: Arc<ChannelDelivery>,
    pub(crate) events: Arc<ChannelEvents>,
    /// Enabled input slots of a mixer.
    pub(crate) mixer_inputs: Vec<bool>,
}

impl ChannelRecord {
    fn new(id: ChannelId, queue_depth: usize) -> Self {
        Self {
            id,
            status: ChannelStatus::Closed,
            config: None,
            stages: StageChain::default(),
            bind_ref_in: 0,
            bind_ref_out: 0,
            queue_depth,
            generation: 0,
            enabling: false,
            delivery: Arc::new(ChannelDelivery::new(id)),
            events: Arc::new(ChannelEvents::new(id)),
            mixer_inputs: Vec::new(),
        }
    }

    /// Move to `next`, which must be a legal transition.
    pub(crate) fn set_status(&mut self, next: ChannelStatus) {
        debug_assert!(
            self.status == next || self.status.can_transition_to(next),
            "illegal transition {} -> {} on {}",
            self.status,
            next,
            self.id
        );
        if self.status != next {
            debug!(channel = %self.id, from = %self.status, to = %next, "status");
            self.status = next;
        }
    }

    /// Fall back from BIND to OPEN once no edge touches the channel.
    pub(crate) fn settle_bind_status(&mut self) {
        if self.status == ChannelStatus::Bind && self.bind_ref_in == 0 && self.bind_ref_out == 0 {
            self.set_status(ChannelStatus::Open);
        }
    }

    pub(crate) fn require(&self, required: ChannelStatus) -> Result<()> {
        self.status.require(self.id, required)
    }

    pub(crate) fn config(&self) -> Result<&ChannelConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| Error::NotReady(format!("{} is not configured", self.id)))
    }

    pub(crate) fn head(&self) -> Result<Arc<dyn Stage>> {
        self.stages
            .head()
            .cloned()
            .ok_or_else(|| Error::NotReady(format!("{} has no stage", self.id)))
    }

    pub(crate) fn tail(&self) -> Result<Arc<dyn Stage>> {
        self.stages
            .tail()
            .cloned()
            .ok_or_else(|| Error::NotReady(format!("{} has no stage", self.id)))
    }

    /// Whether the channel's output currently has a delivery sink installed
    /// on its stage. A mixer only gets one once input slot 0 is enabled.
    pub(crate) fn output_active(&self) -> bool {
        match self.id.kind {
            ModuleKind::Vmix => self.mixer_inputs.first().copied().unwrap_or(false),
            kind => kind.is_source(),
        }
    }

    pub(crate) fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id,
            status: self.status,
            bind_ref_in: self.bind_ref_in,
            bind_ref_out: self.bind_ref_out,
            mode: self.delivery.mode(),
            queue_depth: self.queue_depth as u32,
            queued: self.delivery.queue().map(|q| q.len() as u32).unwrap_or(0),
            stages: self.stages.len() as u32,
        }
    }

    /// Return the slot to CLOSED, handing back what must be torn down
    /// outside the lock.
    pub(crate) fn recycle(&mut self, default_depth: usize) -> Retired {
        let retired = Retired {
            stages: std::mem::take(&mut self.stages),
            delivery: std::mem::replace(&mut self.delivery, Arc::new(ChannelDelivery::new(self.id))),
            events: std::mem::replace(&mut self.events, Arc::new(ChannelEvents::new(self.id))),
        };
        self.set_status(ChannelStatus::Closed);
        self.config = None;
        self.queue_depth = default_depth;
        self.mixer_inputs.clear();
        self.enabling = false;
        self.generation += 1;
        retired
    }
}

/// Resources detached from a recycled channel.
pub(crate) struct Retired {
    stages: StageChain,
    delivery: Arc<ChannelDelivery>,
    events: Arc<ChannelEvents>,
}

impl Retired {
    /// Stop the stages, then release queued buffers and drop every sink.
    pub(crate) fn teardown(self) {
        self.stages.shutdown();
        self.delivery.clear();
        self.events.clear();
    }
}

/// All channels of one module kind.
pub struct ChannelTable {
    kind: ModuleKind,
    records: Mutex<Vec<ChannelRecord>>,
}

impl ChannelTable {
    /// Table with `count` CLOSED slots.
    pub fn new(kind: ModuleKind, count: usize, queue_depth: usize) -> Self {
        let records = (0..count)
            .map(|i| ChannelRecord::new(ChannelId::new(kind, i as u32), queue_depth))
            .collect();
        Self {
            kind,
            records: Mutex::new(records),
        }
    }

    /// Module kind of every slot.
    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` on one record with the table locked.
    pub(crate) fn with<R>(
        &self,
        id: ChannelId,
        f: impl FnOnce(&mut ChannelRecord) -> Result<R>,
    ) -> Result<R> {
        if id.kind != self.kind {
            return Err(Error::InvalidArgument(format!(
                "{} is not a {} channel",
                id, self.kind
            )));
        }
        let mut records = self.records.lock().unwrap();
        let count = records.len();
        let record = records.get_mut(id.index as usize).ok_or_else(|| {
            Error::InvalidArgument(format!("{} out of range ({} channels)", id, count))
        })?;
        f(record)
    }

    /// Snapshot of one channel.
    pub fn info(&self, id: ChannelId) -> Result<ChannelInfo> {
        self.with(id, |record| Ok(record.info()))
    }

    /// Snapshot of every channel that is not CLOSED.
    pub fn active(&self) -> Vec<ChannelInfo> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status != ChannelStatus::Closed)
            .map(ChannelRecord::info)
            .collect()
    }
}

impl std::fmt::Debug for ChannelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTable")
            .field("kind", &self.kind)
            .field("channels", &self.len())
            .finish()
    }
}
