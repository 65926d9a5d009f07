//! Pipeline stages: the processing objects behind each channel.
//!
//! A stage does the actual capture, coding, scaling, compositing or muxing.
//! The control plane treats it as opaque: it creates stages through a
//! [`StageFactory`], wires them together with [`Stage::bind`], installs a
//! delivery sink for produced buffers and an event sink for notifications,
//! forwards runtime controls, and shuts them down.
//!
//! [`loopback`] provides a software backend that passes buffers through
//! unchanged; it backs the daemon and the test suite.

pub mod loopback;

use crate::buffer::MediaBuffer;
use crate::channel::{ChannelConfig, ChannelId, MotionConfig, OsdRegion, RateControl};
use crate::delivery::DeliverySink;
use crate::error::Result;
use crate::event::EventSink;
use crate::format::{Rect, Rotation};
use rkyv::{Archive, Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a stage instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u64);

impl StageId {
    /// Generate a new unique stage ID.
    pub fn new() -> Self {
        Self(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for StageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// Runtime controls forwarded to a channel's stage.
///
/// Each control applies to a subset of module kinds; sending it to any other
/// kind fails with `Unsupported`.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum StageControl {
    /// Region of interest (VENC). An empty rect clears it.
    SetRoi(Rect),
    /// Add or replace an overlay region (VENC).
    SetOsd(OsdRegion),
    /// Remove an overlay region by id (VENC).
    ClearOsd(u8),
    /// Rate control (VENC).
    SetRateControl(RateControl),
    /// Emit a key frame as soon as possible (VENC).
    ForceIdr,
    /// Rotation (VENC, RGA, VI).
    SetRotation(Rotation),
    /// Frame rate (VI, VENC).
    SetFrameRate(u32),
    /// Volume 0..=100 (AI, AO).
    SetVolume(u8),
    /// Placement of one mixer input (VMIX).
    SetMixerRegion {
        /// Input slot.
        slot: u32,
        /// New placement.
        region: Rect,
    },
    /// Z-order of one mixer input (VMIX).
    SetMixerLayer {
        /// Input slot.
        slot: u32,
        /// New layer.
        layer: u32,
    },
    /// Placement on screen (VO).
    SetDisplayRect(Rect),
    /// Enable, reconfigure or disable motion detection (VI).
    SetMotionDetect(Option<MotionConfig>),
}

impl StageControl {
    /// Name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetRoi(_) => "set_roi",
            Self::SetOsd(_) => "set_osd",
            Self::ClearOsd(_) => "clear_osd",
            Self::SetRateControl(_) => "set_rate_control",
            Self::ForceIdr => "force_idr",
            Self::SetRotation(_) => "set_rotation",
            Self::SetFrameRate(_) => "set_frame_rate",
            Self::SetVolume(_) => "set_volume",
            Self::SetMixerRegion { .. } => "set_mixer_region",
            Self::SetMixerLayer { .. } => "set_mixer_layer",
            Self::SetDisplayRect(_) => "set_display_rect",
            Self::SetMotionDetect(_) => "set_motion_detect",
        }
    }
}

/// One processing stage.
///
/// All methods take `&self`: a stage is shared between the channel table,
/// its upstream stages and its own worker threads.
pub trait Stage: Send + Sync {
    /// Identity of this instance.
    fn id(&self) -> StageId;

    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Add `downstream` as a consumer of this stage's output, feeding its
    /// input `slot`.
    fn bind(&self, downstream: Arc<dyn Stage>, slot: u32) -> Result<()>;

    /// Remove a downstream consumer previously added with [`bind`](Self::bind).
    fn unbind(&self, downstream: StageId) -> Result<()>;

    /// Install (or remove) the sink that receives this stage's output.
    ///
    /// Output goes to the sink in addition to any bound downstream stages.
    fn set_delivery_sink(&self, sink: Option<Arc<dyn DeliverySink>>);

    /// Install (or remove) the sink that receives this stage's events.
    fn set_event_sink(&self, sink: Option<Arc<dyn EventSink>>);

    /// Feed one buffer into input `slot`.
    fn input(&self, buffer: MediaBuffer, slot: u32) -> Result<()>;

    /// Apply a runtime control.
    fn control(&self, control: &StageControl) -> Result<()>;

    /// Stop processing and drop every sink and downstream reference.
    fn shutdown(&self);
}

/// The stages a channel owns, in data-flow order.
///
/// Most channels own a single stage. A snapshot encoder owns a short chain;
/// upstream binds feed the head and the tail produces the channel's output.
#[derive(Clone, Default)]
pub struct StageChain {
    stages: SmallVec<[Arc<dyn Stage>; 2]>,
}

impl StageChain {
    /// Chain of one stage.
    pub fn single(stage: Arc<dyn Stage>) -> Self {
        let mut stages = SmallVec::new();
        stages.push(stage);
        Self { stages }
    }

    /// Chain from stages already linked head to tail.
    pub fn from_stages(stages: impl IntoIterator<Item = Arc<dyn Stage>>) -> Self {
        Self {
            stages: stages.into_iter().collect(),
        }
    }

    /// Stage receiving the channel's input.
    pub fn head(&self) -> Option<&Arc<dyn Stage>> {
        self.stages.first()
    }

    /// Stage producing the channel's output.
    pub fn tail(&self) -> Option<&Arc<dyn Stage>> {
        self.stages.last()
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain holds no stage.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Iterate head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Stage>> {
        self.stages.iter()
    }

    /// Shut every stage down, tail first.
    pub fn shutdown(&self) {
        for stage in self.stages.iter().rev() {
            stage.shutdown();
        }
    }
}

impl std::fmt::Debug for StageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.name()))
            .finish()
    }
}

/// Creates the stages for a channel.
pub trait StageFactory: Send + Sync {
    /// Build the stage chain for `id` from its configuration.
    ///
    /// Return `Busy` for transient contention (a device still held by a
    /// previous user); the caller retries a bounded number of times.
    /// Any other error is final.
    fn create(&self, id: ChannelId, config: &ChannelConfig) -> Result<StageChain>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_unique() {
        let a = StageId::new();
        let b = StageId::new();
        assert_ne!(a, b);
        assert!(b.0 > a.0);
    }

    #[test]
    fn test_control_names() {
        assert_eq!(StageControl::ForceIdr.name(), "force_idr");
        assert_eq!(
            StageControl::SetMixerLayer { slot: 1, layer: 2 }.name(),
            "set_mixer_layer"
        );
    }

    #[test]
    fn test_empty_chain() {
        let chain = StageChain::default();
        assert!(chain.is_empty());
        assert!(chain.head().is_none());
        assert!(chain.tail().is_none());
    }
}
