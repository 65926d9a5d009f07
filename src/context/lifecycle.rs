//! Channel lifecycle: configure, enable, disable, destroy.

use super::Context;
use crate::channel::{ChannelConfig, ChannelId, ChannelStatus, ModuleKind};
use crate::delivery::{ChannelDelivery, DeliverySink};
use crate::error::{Error, Result};
use crate::event::{ChannelEvents, EventSink};
use crate::stage::StageChain;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

impl Context {
    /// Store a channel's configuration: CLOSED -> READY.
    pub fn set_attr(&self, id: ChannelId, config: ChannelConfig) -> Result<()> {
        if config.kind() != id.kind {
            return Err(Error::InvalidArgument(format!(
                "{} config for {}",
                config.kind(),
                id
            )));
        }
        config.validate()?;

        self.table(id.kind).with(id, |record| {
            if record.status != ChannelStatus::Closed {
                return Err(Error::Busy(format!("{} is already {}", id, record.status)));
            }
            if let ChannelConfig::Mixer(mixer) = &config {
                record.mixer_inputs = vec![false; mixer.inputs.len()];
            }
            record.config = Some(config);
            record.set_status(ChannelStatus::Ready);
            debug!(channel = %id, "configured");
            Ok(())
        })
    }

    /// The stored configuration, including changes made by controls.
    pub fn get_attr(&self, id: ChannelId) -> Result<ChannelConfig> {
        self.table(id.kind).with(id, |record| {
            record.require(ChannelStatus::Ready)?;
            record.config().cloned()
        })
    }

    /// Create the channel's stages: READY -> OPEN.
    ///
    /// Stage creation reporting `Busy` is retried up to
    /// `ContextConfig::enable_retries` times. Stages are created without the
    /// table lock held; the channel stays claimed meanwhile, so a second
    /// enable fails with `Busy`. On failure the channel stays READY. If the
    /// channel is destroyed while its stages are being created, the new
    /// stages are shut down and the enable fails with `NotReady`.
    pub fn enable_channel(&self, id: ChannelId) -> Result<()> {
        let table = self.table(id.kind);
        let (config, generation) = table.with(id, |record| {
            match record.status {
                ChannelStatus::Ready => {}
                ChannelStatus::Closed => {
                    return Err(Error::NotReady(format!("{} is not configured", id)));
                }
                status => return Err(Error::Busy(format!("{} is already {}", id, status))),
            }
            if record.enabling {
                return Err(Error::Busy(format!("{} is being enabled", id)));
            }
            let config = record.config()?.clone();
            record.enabling = true;
            Ok((config, record.generation))
        })?;

        let created = self.create_stages(id, &config);

        table.with(id, |record| {
            let current = record.generation == generation;
            if current {
                record.enabling = false;
            }
            let stages = created?;
            if !current || record.status != ChannelStatus::Ready {
                stages.shutdown();
                return Err(Error::NotReady(format!("{} was reset during enable", id)));
            }

            let delivery = Arc::new(ChannelDelivery::new(id));
            let events = Arc::new(ChannelEvents::new(id));
            for stage in stages.iter() {
                stage.set_event_sink(Some(events.clone() as Arc<dyn EventSink>));
            }
            record.stages = stages;
            record.delivery = delivery.clone();
            record.events = events;
            if id.kind.is_source() && id.kind != ModuleKind::Vmix {
                record.tail()?.set_delivery_sink(Some(delivery as Arc<dyn DeliverySink>));
            }
            record.generation += 1;
            record.set_status(ChannelStatus::Open);
            self.restore_implicit_pull(record)?;
            info!(channel = %id, stages = record.stages.len(), "channel enabled");
            Ok(())
        })
    }

    fn create_stages(&self, id: ChannelId, config: &ChannelConfig) -> Result<StageChain> {
        let mut attempt = 0;
        loop {
            match self.factory.create(id, config) {
                Err(Error::Busy(reason)) if attempt < self.config.enable_retries => {
                    attempt += 1;
                    warn!(channel = %id, attempt, %reason, "stage busy, retrying enable");
                    thread::sleep(self.config.retry_delay);
                }
                result => return result,
            }
        }
    }

    /// Tear the channel's stages down: OPEN -> CLOSED.
    ///
    /// Fails with `NotPermitted` while the channel is bound. Queued buffers
    /// are released and blocked pullers wake with `NotReady`.
    pub fn disable_channel(&self, id: ChannelId) -> Result<()> {
        let retired = self.table(id.kind).with(id, |record| {
            match record.status {
                ChannelStatus::Open => {}
                ChannelStatus::Bind => {
                    return Err(Error::NotPermitted(format!(
                        "{} is bound (in {}, out {})",
                        id, record.bind_ref_in, record.bind_ref_out
                    )));
                }
                status => return Err(Error::NotReady(format!("{} is {}", id, status))),
            }
            Ok(record.recycle(self.config.default_queue_depth))
        })?;
        retired.teardown();
        info!(channel = %id, "channel disabled");
        Ok(())
    }

    /// Return a channel to CLOSED from any unbound status.
    ///
    /// Destroying a CLOSED channel succeeds without effect.
    pub fn destroy_channel(&self, id: ChannelId) -> Result<()> {
        let retired = self.table(id.kind).with(id, |record| match record.status {
            ChannelStatus::Closed => Ok(None),
            ChannelStatus::Bind => Err(Error::NotPermitted(format!("{} is bound", id))),
            ChannelStatus::Ready | ChannelStatus::Open => {
                Ok(Some(record.recycle(self.config.default_queue_depth)))
            }
        })?;
        if let Some(retired) = retired {
            retired.teardown();
            info!(channel = %id, "channel destroyed");
        }
        Ok(())
    }

    /// Enable one input slot of a mixer.
    ///
    /// Enabling slot 0 installs the mixer's delivery sink, so its composed
    /// output starts flowing.
    pub fn enable_mixer_input(&self, dev: ChannelId, slot: u32) -> Result<()> {
        require_mixer(dev)?;
        self.table(dev.kind).with(dev, |record| {
            record.require(ChannelStatus::Open)?;
            let inputs = record.mixer_inputs.len();
            let enabled = record.mixer_inputs.get_mut(slot as usize).ok_or_else(|| {
                Error::InvalidArgument(format!("{} has {} inputs, got slot {}", dev, inputs, slot))
            })?;
            if *enabled {
                return Err(Error::Busy(format!("{} input {} already enabled", dev, slot)));
            }
            *enabled = true;
            if slot == 0 {
                record
                    .tail()?
                    .set_delivery_sink(Some(record.delivery.clone() as Arc<dyn DeliverySink>));
                self.restore_implicit_pull(record)?;
            }
            debug!(channel = %dev, slot, "mixer input enabled");
            Ok(())
        })
    }

    /// Disable one input slot of a mixer. Fails with `NotPermitted` while
    /// an edge still feeds the slot.
    pub fn disable_mixer_input(&self, dev: ChannelId, slot: u32) -> Result<()> {
        require_mixer(dev)?;
        let fed = self
            .edges
            .lock()
            .unwrap()
            .iter()
            .any(|edge| edge.dst == dev && edge.slot == slot);

        self.table(dev.kind).with(dev, |record| {
            record.require(ChannelStatus::Open)?;
            let inputs = record.mixer_inputs.len();
            let enabled = record.mixer_inputs.get_mut(slot as usize).ok_or_else(|| {
                Error::InvalidArgument(format!("{} has {} inputs, got slot {}", dev, inputs, slot))
            })?;
            if !*enabled {
                return Err(Error::NotReady(format!("{} input {} is not enabled", dev, slot)));
            }
            if fed {
                return Err(Error::NotPermitted(format!("{} input {} is bound", dev, slot)));
            }
            *enabled = false;
            if slot == 0 {
                record.tail()?.set_delivery_sink(None);
                record.delivery.drop_implicit();
            }
            debug!(channel = %dev, slot, "mixer input disabled");
            Ok(())
        })
    }

    /// Whether a mixer input slot is enabled.
    pub fn mixer_input_enabled(&self, dev: ChannelId, slot: u32) -> Result<bool> {
        require_mixer(dev)?;
        self.table(dev.kind).with(dev, |record| {
            Ok(record.mixer_inputs.get(slot as usize).copied().unwrap_or(false))
        })
    }
}

fn require_mixer(id: ChannelId) -> Result<()> {
    if id.kind != ModuleKind::Vmix {
        return Err(Error::InvalidArgument(format!("{} is not a mixer", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CaptureConfig, MixerConfig, MixerInput};
    use crate::config::ContextConfig;
    use crate::error::ErrorCode;
    use crate::format::{ImageInfo, PixelFormat, Rect, Rotation};
    use crate::stage::loopback::LoopbackBackend;
    use std::time::Duration;

    fn context() -> (Context, LoopbackBackend) {
        let backend = LoopbackBackend::new();
        let config = ContextConfig::default().with_retries(2, Duration::from_millis(1));
        let ctx = Context::new(config, Arc::new(backend.clone())).unwrap();
        (ctx, backend)
    }

    fn capture() -> ChannelConfig {
        ChannelConfig::Capture(CaptureConfig {
            device: "/dev/video0".into(),
            image: ImageInfo::new(16, 16, PixelFormat::Nv12),
            buffer_count: 4,
            frame_rate: 30,
            rotation: Rotation::R0,
            motion: None,
        })
    }

    fn mixer(inputs: usize) -> ChannelConfig {
        ChannelConfig::Mixer(MixerConfig {
            output: ImageInfo::new(64, 64, PixelFormat::Nv12),
            inputs: vec![
                MixerInput {
                    region: Rect::new(0, 0, 32, 32),
                    layer: 0,
                };
                inputs
            ],
            frame_rate: 30,
        })
    }

    #[test]
    fn test_set_attr_rejects_wrong_kind() {
        let (ctx, _) = context();
        let err = ctx
            .set_attr(ChannelId::new(ModuleKind::Venc, 0), capture())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_enable_retries_busy() {
        let (ctx, backend) = context();
        let vi = ChannelId::new(ModuleKind::Vi, 0);
        ctx.set_attr(vi, capture()).unwrap();

        backend.fail_next_create(ErrorCode::Busy, 2);
        ctx.enable_channel(vi).unwrap();
        assert_eq!(ctx.status(vi).unwrap(), ChannelStatus::Open);
    }

    #[test]
    fn test_enable_gives_up_after_retries() {
        let (ctx, backend) = context();
        let vi = ChannelId::new(ModuleKind::Vi, 0);
        ctx.set_attr(vi, capture()).unwrap();

        backend.fail_next_create(ErrorCode::Busy, 3);
        let err = ctx.enable_channel(vi).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);
        assert_eq!(ctx.status(vi).unwrap(), ChannelStatus::Ready);
        assert_eq!(backend.created_count(), 0);
    }

    #[test]
    fn test_mixer_slot_zero_installs_sink() {
        let (ctx, backend) = context();
        let dev = ChannelId::new(ModuleKind::Vmix, 0);
        ctx.set_attr(dev, mixer(2)).unwrap();
        ctx.enable_channel(dev).unwrap();

        let stage = backend.stage(dev).unwrap();
        assert!(!stage.has_delivery_sink());

        ctx.enable_mixer_input(dev, 1).unwrap();
        assert!(!stage.has_delivery_sink());
        ctx.enable_mixer_input(dev, 0).unwrap();
        assert!(stage.has_delivery_sink());

        let err = ctx.enable_mixer_input(dev, 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);
        let err = ctx.enable_mixer_input(dev, 2).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        ctx.disable_mixer_input(dev, 0).unwrap();
        assert!(!stage.has_delivery_sink());
        assert!(ctx.mixer_input_enabled(dev, 1).unwrap());
    }
}
