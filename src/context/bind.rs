//! Bind graph: connecting one channel's output to another channel's input.
//!
//! The edge set is the source of truth for which edges exist; each edge is
//! claimed in the set before the stages are touched so two concurrent binds
//! (or unbinds) of the same pair cannot both proceed.

use super::Context;
use crate::channel::{BindEdge, ChannelId, ChannelStatus};
use crate::error::{Error, Result};
use tracing::{debug, info};

impl Context {
    /// Connect `src`'s output to input `slot` of `dst`.
    ///
    /// Both channels move to BIND. An implicit pull queue on `src` is removed;
    /// consumers the application asked for (and luma sampling) stay.
    pub fn bind(&self, src: ChannelId, dst: ChannelId, slot: u32) -> Result<()> {
        if src == dst {
            return Err(Error::InvalidArgument(format!("{} cannot bind to itself", src)));
        }
        if !src.kind.is_source() {
            return Err(Error::InvalidArgument(format!("{} has no output", src)));
        }

        // Validate the destination and remember which incarnation we saw.
        let (dst_head, generation) = self.table(dst.kind).with(dst, |record| {
            record.require(ChannelStatus::Open)?;
            let slots = record.config()?.input_slots();
            if slot >= slots {
                return Err(Error::InvalidArgument(format!(
                    "{} has {} input slots, got slot {}",
                    dst, slots, slot
                )));
            }
            Ok((record.head()?, record.generation))
        })?;

        let edge = BindEdge { src, dst, slot };
        self.claim_pair(edge)?;

        if let Err(e) = self.table(src.kind).with(src, |record| {
            record.require(ChannelStatus::Open)?;
            record.tail()?.bind(dst_head.clone(), slot).map_err(|e| {
                Error::NotReady(format!("{} refused to feed {}: {}", src, dst, e))
            })?;
            record.bind_ref_out += 1;
            record.set_status(ChannelStatus::Bind);
            if record.delivery.drop_implicit() {
                debug!(channel = %src, "implicit pull queue superseded by bind");
            }
            Ok(())
        }) {
            self.edges.lock().unwrap().remove(&edge);
            return Err(e);
        }

        // The destination may have been recycled while unlocked.
        let committed = self.table(dst.kind).with(dst, |record| {
            if record.generation != generation || record.status < ChannelStatus::Open {
                return Err(Error::NotReady(format!("{} changed during bind", dst)));
            }
            record.bind_ref_in += 1;
            record.set_status(ChannelStatus::Bind);
            Ok(())
        });

        if let Err(e) = committed {
            self.table(src.kind).with(src, |record| {
                let _ = record.tail()?.unbind(dst_head.id());
                record.bind_ref_out -= 1;
                record.settle_bind_status();
                self.restore_implicit_pull(record)
            })?;
            self.edges.lock().unwrap().remove(&edge);
            return Err(e);
        }

        info!(%edge, "bound");
        Ok(())
    }

    /// Remove the edge from `src` to `dst`.
    ///
    /// Each side returns to OPEN once it has neither incoming nor outgoing
    /// edges. Unbinding a pair that is not bound fails with `NotReady`.
    pub fn unbind(&self, src: ChannelId, dst: ChannelId) -> Result<()> {
        let edge = {
            let mut edges = self.edges.lock().unwrap();
            let edge = edges
                .iter()
                .find(|e| e.src == src && e.dst == dst)
                .copied()
                .ok_or_else(|| Error::NotReady(format!("{} is not bound to {}", src, dst)))?;
            edges.remove(&edge);
            edge
        };

        let dst_stage = match self.table(dst.kind).with(dst, |record| record.head()) {
            Ok(stage) => stage.id(),
            Err(e) => {
                self.edges.lock().unwrap().insert(edge);
                return Err(e);
            }
        };

        if let Err(e) = self.table(src.kind).with(src, |record| {
            record.tail()?.unbind(dst_stage).map_err(|e| {
                Error::NotReady(format!("{} does not feed {}: {}", src, dst, e))
            })?;
            record.bind_ref_out = record.bind_ref_out.saturating_sub(1);
            record.settle_bind_status();
            self.restore_implicit_pull(record)
        }) {
            self.edges.lock().unwrap().insert(edge);
            return Err(e);
        }

        self.table(dst.kind).with(dst, |record| {
            record.bind_ref_in = record.bind_ref_in.saturating_sub(1);
            record.settle_bind_status();
            Ok(())
        })?;

        info!(%edge, "unbound");
        Ok(())
    }

    /// Edges leaving `src`.
    pub fn edges_from(&self, src: ChannelId) -> Vec<BindEdge> {
        self.edges
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.src == src)
            .copied()
            .collect()
    }

    /// Edges entering `dst`.
    pub fn edges_into(&self, dst: ChannelId) -> Vec<BindEdge> {
        self.edges
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.dst == dst)
            .copied()
            .collect()
    }

    fn claim_pair(&self, edge: BindEdge) -> Result<()> {
        let mut edges = self.edges.lock().unwrap();
        if edges.iter().any(|e| e.src == edge.src && e.dst == edge.dst) {
            return Err(Error::Busy(format!("{} is already bound to {}", edge.src, edge.dst)));
        }
        edges.insert(edge);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CaptureConfig, ChannelConfig, EncodeConfig, ModuleKind};
    use crate::config::ContextConfig;
    use crate::delivery::DeliveryMode;
    use crate::error::ErrorCode;
    use crate::format::{CodecType, ImageInfo, PixelFormat, Rotation};
    use crate::stage::loopback::LoopbackBackend;
    use std::sync::Arc;

    fn image() -> ImageInfo {
        ImageInfo::new(16, 16, PixelFormat::Nv12)
    }

    fn open_pair() -> (Context, LoopbackBackend, ChannelId, ChannelId) {
        let backend = LoopbackBackend::new();
        let ctx = Context::new(ContextConfig::default(), Arc::new(backend.clone())).unwrap();
        let vi = ChannelId::new(ModuleKind::Vi, 0);
        let venc = ChannelId::new(ModuleKind::Venc, 0);
        ctx.set_attr(
            vi,
            ChannelConfig::Capture(CaptureConfig {
                device: "/dev/video0".into(),
                image: image(),
                buffer_count: 4,
                frame_rate: 30,
                rotation: Rotation::R0,
                motion: None,
            }),
        )
        .unwrap();
        ctx.set_attr(
            venc,
            ChannelConfig::Encode(EncodeConfig::new(CodecType::H264, image())),
        )
        .unwrap();
        ctx.enable_channel(vi).unwrap();
        ctx.enable_channel(venc).unwrap();
        (ctx, backend, vi, venc)
    }

    #[test]
    fn test_bind_failure_mutates_nothing() {
        let (ctx, backend, vi, venc) = open_pair();
        backend.fail_next_bind();
        let err = ctx.bind(vi, venc, 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotReady);
        assert!(ctx.edges().is_empty());
        assert_eq!(ctx.status(vi).unwrap(), ChannelStatus::Open);
        assert_eq!(ctx.info(vi).unwrap().bind_ref_out, 0);
        assert_eq!(ctx.info(vi).unwrap().mode, DeliveryMode::Pull);
    }

    #[test]
    fn test_duplicate_pair_is_busy() {
        let (ctx, _, vi, venc) = open_pair();
        ctx.bind(vi, venc, 0).unwrap();
        let err = ctx.bind(vi, venc, 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);
        assert_eq!(ctx.info(venc).unwrap().bind_ref_in, 1);
    }

    #[test]
    fn test_bind_supersedes_implicit_pull() {
        let (ctx, _, vi, venc) = open_pair();
        assert_eq!(ctx.info(vi).unwrap().mode, DeliveryMode::Pull);
        ctx.bind(vi, venc, 0).unwrap();
        assert_eq!(ctx.info(vi).unwrap().mode, DeliveryMode::None);
        ctx.unbind(vi, venc).unwrap();
        assert_eq!(ctx.info(vi).unwrap().mode, DeliveryMode::Pull);
    }

    #[test]
    fn test_unbind_missing_edge() {
        let (ctx, _, vi, venc) = open_pair();
        let err = ctx.unbind(vi, venc).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotReady);
    }

    #[test]
    fn test_bad_slot_and_sink_as_source() {
        let (ctx, _, vi, venc) = open_pair();
        assert_eq!(
            ctx.bind(vi, venc, 1).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            ctx.bind(venc, vi, 0).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        let vo = ChannelId::new(ModuleKind::Vo, 0);
        assert_eq!(
            ctx.bind(vo, venc, 0).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }
}
