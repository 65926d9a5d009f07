//! Runtime controls and luma sampling.

use super::Context;
use crate::channel::{ChannelId, ChannelStatus, ModuleKind};
use crate::delivery::LumaSampler;
use crate::error::{Error, Result};
use crate::format::Rect;
use crate::stage::StageControl;
use std::sync::Arc;
use tracing::debug;

impl Context {
    /// Apply a runtime control to an enabled channel.
    ///
    /// The control is checked against the stored configuration first
    /// (`Unsupported` for the wrong kind, `InvalidArgument` for bad values),
    /// then forwarded to the output stage. The stored configuration only
    /// changes if the stage accepts it.
    pub fn control(&self, id: ChannelId, control: StageControl) -> Result<()> {
        self.table(id.kind).with(id, |record| {
            record.require(ChannelStatus::Open)?;
            let mut config = record.config()?.clone();
            config.apply(&control)?;
            record.tail()?.control(&control)?;
            record.config = Some(config);
            debug!(channel = %id, control = control.name(), "control applied");
            Ok(())
        })
    }

    /// Start luma sampling on a capture channel. Starting twice is a no-op.
    pub fn start_luma(&self, id: ChannelId) -> Result<()> {
        require_vi(id)?;
        self.table(id.kind).with(id, |record| {
            record.require(ChannelStatus::Open)?;
            if record.delivery.luma().is_none() {
                record
                    .delivery
                    .set_luma(Some(Arc::new(LumaSampler::new(id))));
            }
            Ok(())
        })
    }

    /// Stop luma sampling and release the retained frame.
    pub fn stop_luma(&self, id: ChannelId) -> Result<()> {
        require_vi(id)?;
        self.table(id.kind).with(id, |record| {
            record.require(ChannelStatus::Open)?;
            record.delivery.set_luma(None);
            Ok(())
        })
    }

    /// Mean luma inside `rect` of the most recent frame (empty rect: whole
    /// frame).
    pub fn get_luma(&self, id: ChannelId, rect: Rect) -> Result<u8> {
        require_vi(id)?;
        let sampler = self.table(id.kind).with(id, |record| {
            record.require(ChannelStatus::Open)?;
            record
                .delivery
                .luma()
                .ok_or_else(|| Error::NotReady(format!("luma sampling is off on {}", id)))
        })?;
        sampler.mean_luma(rect)
    }
}

fn require_vi(id: ChannelId) -> Result<()> {
    if id.kind != ModuleKind::Vi {
        return Err(Error::Unsupported(format!("{} has no luma sampler", id)));
    }
    Ok(())
}
