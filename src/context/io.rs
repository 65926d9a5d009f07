//! Buffer I/O: consumers of channel output, feeding channel input, and
//! event routing.

use super::Context;
use crate::buffer::MediaBuffer;
use crate::channel::table::ChannelRecord;
use crate::channel::{ChannelId, ChannelStatus, ModuleKind};
use crate::delivery::{
    BufferQueue, CallbackSink, DeliveryMode, DeliverySink, MAX_QUEUE_DEPTH, MIN_QUEUE_DEPTH,
    OutputCallback, OutputCallbackEx, PrimarySink,
};
use crate::error::{Error, Result};
use crate::event::{EventCallback, EventSink};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn require_output(record: &ChannelRecord) -> Result<()> {
    record.require(ChannelStatus::Open)?;
    if !record.id.kind.is_source() {
        return Err(Error::Unsupported(format!("{} has no output", record.id)));
    }
    Ok(())
}

impl Context {
    /// Change the pull queue depth (1..=64).
    pub fn set_queue_depth(&self, id: ChannelId, depth: usize) -> Result<()> {
        if !(MIN_QUEUE_DEPTH..=MAX_QUEUE_DEPTH).contains(&depth) {
            return Err(Error::InvalidArgument(format!(
                "queue depth {} outside {}..={}",
                depth, MIN_QUEUE_DEPTH, MAX_QUEUE_DEPTH
            )));
        }
        self.table(id.kind).with(id, |record| {
            record.require(ChannelStatus::Open)?;
            if let Some(queue) = record.delivery.queue() {
                queue.set_depth(depth)?;
            }
            record.queue_depth = depth;
            Ok(())
        })
    }

    /// Start an application-requested pull consumer.
    ///
    /// Unlike the implicit queue, it stays installed when the channel is
    /// bound downstream. Starting twice is a no-op.
    pub fn start_get_media_buffer(&self, id: ChannelId) -> Result<()> {
        self.table(id.kind).with(id, |record| {
            require_output(record)?;
            if let Some(primary) = record.delivery.primary()
                && primary.is_explicit()
            {
                if primary.mode() == DeliveryMode::Pull {
                    return Ok(());
                }
                return Err(Error::Busy(format!(
                    "{} already delivers by {}",
                    id,
                    primary.mode()
                )));
            }
            let queue = Arc::new(BufferQueue::new(id, record.queue_depth)?);
            record
                .delivery
                .set_primary(Some(PrimarySink::pull(queue, true)));
            debug!(channel = %id, "explicit pull started");
            Ok(())
        })
    }

    /// Stop the application-requested pull consumer, releasing whatever it
    /// still holds queued.
    pub fn stop_get_media_buffer(&self, id: ChannelId) -> Result<()> {
        self.table(id.kind).with(id, |record| {
            record.require(ChannelStatus::Open)?;
            match record.delivery.primary() {
                Some(p) if p.is_explicit() && p.mode() == DeliveryMode::Pull => {
                    record.delivery.set_primary(None);
                    self.restore_implicit_pull(record)
                }
                _ => Ok(()),
            }
        })
    }

    /// Take the next queued output buffer.
    ///
    /// `None` blocks, `Some(Duration::ZERO)` polls, anything else waits at
    /// most that long. Returns `Ok(None)` on timeout; `NotReady` when the
    /// channel has no pull queue or is disabled while waiting.
    pub fn get_media_buffer(
        &self,
        id: ChannelId,
        timeout: Option<Duration>,
    ) -> Result<Option<MediaBuffer>> {
        let queue = self.table(id.kind).with(id, |record| {
            require_output(record)?;
            record
                .delivery
                .queue()
                .ok_or_else(|| Error::NotReady(format!("{} has no pull queue", id)))
        })?;
        queue.pop(timeout)
    }

    /// The channel's current pull queue; poll its
    /// [`wake_fd`](BufferQueue::wake_fd) to wait for output.
    pub fn pull_queue(&self, id: ChannelId) -> Result<Arc<BufferQueue>> {
        self.table(id.kind).with(id, |record| {
            require_output(record)?;
            record
                .delivery
                .queue()
                .ok_or_else(|| Error::NotReady(format!("{} has no pull queue", id)))
        })
    }

    /// Install (or with `None`, remove) a plain output callback.
    pub fn register_output_callback(
        &self,
        id: ChannelId,
        callback: Option<OutputCallback>,
    ) -> Result<()> {
        let sink = callback.map(|cb| PrimarySink::callback(CallbackSink::new(id, cb), false));
        self.set_callback(id, sink, DeliveryMode::Callback)
    }

    /// Install (or with `None`, remove) an extended output callback that
    /// receives `opaque` with every buffer.
    pub fn register_output_callback_ex(
        &self,
        id: ChannelId,
        callback: Option<OutputCallbackEx>,
        opaque: u64,
    ) -> Result<()> {
        let sink = callback
            .map(|cb| PrimarySink::callback(CallbackSink::extended(id, cb, opaque), true));
        self.set_callback(id, sink, DeliveryMode::CallbackEx)
    }

    fn set_callback(
        &self,
        id: ChannelId,
        sink: Option<PrimarySink>,
        mode: DeliveryMode,
    ) -> Result<()> {
        self.table(id.kind).with(id, |record| {
            require_output(record)?;
            match sink {
                Some(sink) => {
                    record.delivery.set_primary(Some(sink));
                    debug!(channel = %id, %mode, "output callback registered");
                    Ok(())
                }
                None => {
                    if record.delivery.mode() == mode {
                        record.delivery.set_primary(None);
                        self.restore_implicit_pull(record)?;
                    }
                    Ok(())
                }
            }
        })
    }

    /// Install (or with `None`, remove) the local event callback.
    pub fn register_event_callback(
        &self,
        id: ChannelId,
        callback: Option<EventCallback>,
    ) -> Result<()> {
        let events = self.table(id.kind).with(id, |record| {
            record.require(ChannelStatus::Open)?;
            Ok(record.events.clone())
        })?;
        events.set_callback(callback);
        Ok(())
    }

    /// Make `sink` the channel's output consumer. Used by RPC sessions.
    ///
    /// Fails with `Busy` when the application already consumes the output.
    pub fn subscribe_output(&self, id: ChannelId, sink: Arc<dyn DeliverySink>) -> Result<()> {
        self.table(id.kind).with(id, |record| {
            require_output(record)?;
            if let Some(primary) = record.delivery.primary()
                && primary.is_explicit()
            {
                return Err(Error::Busy(format!(
                    "{} already delivers by {}",
                    id,
                    primary.mode()
                )));
            }
            record.delivery.set_primary(Some(PrimarySink::forward(sink)));
            Ok(())
        })
    }

    /// Remove `sink` if it is still the channel's output consumer.
    ///
    /// Returns whether it was removed. A channel that was disabled in the
    /// meantime already dropped the sink.
    pub fn unsubscribe_output(&self, id: ChannelId, sink: &Arc<dyn DeliverySink>) -> Result<bool> {
        self.table(id.kind).with(id, |record| {
            match record.delivery.primary() {
                Some(p) if p.forwards_to(sink) => {
                    record.delivery.set_primary(None);
                    if record.status >= ChannelStatus::Open {
                        self.restore_implicit_pull(record)?;
                    }
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    /// Add an event subscriber; returns its key.
    pub fn subscribe_events(&self, id: ChannelId, sink: Arc<dyn EventSink>) -> Result<u64> {
        let events = self.table(id.kind).with(id, |record| {
            record.require(ChannelStatus::Open)?;
            Ok(record.events.clone())
        })?;
        Ok(events.subscribe(sink))
    }

    /// Remove an event subscriber. Returns whether it was present.
    pub fn unsubscribe_events(&self, id: ChannelId, key: u64) -> Result<bool> {
        let events = self.table(id.kind).with(id, |record| Ok(record.events.clone()))?;
        Ok(events.unsubscribe(key))
    }

    /// Feed `buffer` into input `slot` of the channel's head stage.
    pub fn send_media_buffer(&self, id: ChannelId, slot: u32, buffer: MediaBuffer) -> Result<()> {
        let head = self.table(id.kind).with(id, |record| {
            record.require(ChannelStatus::Open)?;
            let slots = record.config()?.input_slots();
            if slot >= slots {
                return Err(Error::InvalidArgument(format!(
                    "{} has {} input slots, got slot {}",
                    id, slots, slot
                )));
            }
            if id.kind == ModuleKind::Vmix
                && !record.mixer_inputs.get(slot as usize).copied().unwrap_or(false)
            {
                return Err(Error::NotReady(format!("{} input {} is not enabled", id, slot)));
            }
            record.head()
        })?;
        head.input(buffer, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, DecodeConfig};
    use crate::config::ContextConfig;
    use crate::error::ErrorCode;
    use crate::format::{CodecType, PixelFormat};
    use crate::stage::loopback::LoopbackBackend;
    use std::sync::Mutex;

    fn open_vdec() -> (Context, LoopbackBackend, ChannelId) {
        let backend = LoopbackBackend::new();
        let ctx = Context::new(ContextConfig::default(), Arc::new(backend.clone())).unwrap();
        let vdec = ChannelId::new(ModuleKind::Vdec, 0);
        ctx.set_attr(
            vdec,
            ChannelConfig::Decode(DecodeConfig {
                codec: CodecType::H264,
                max_width: 64,
                max_height: 64,
                output_format: PixelFormat::Nv12,
            }),
        )
        .unwrap();
        ctx.enable_channel(vdec).unwrap();
        (ctx, backend, vdec)
    }

    #[test]
    fn test_send_then_pull() {
        let (ctx, _, vdec) = open_vdec();
        let buffer = ctx.create_buffer(16, false).unwrap();
        ctx.send_media_buffer(vdec, 0, buffer).unwrap();

        let out = ctx.get_media_buffer(vdec, Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(out.origin(), Some(vdec));
        assert!(ctx.get_media_buffer(vdec, Some(Duration::ZERO)).unwrap().is_none());
    }

    #[test]
    fn test_callback_replaces_pull() {
        let (ctx, backend, vdec) = open_vdec();
        ctx.send_media_buffer(vdec, 0, ctx.create_buffer(16, false).unwrap())
            .unwrap();
        assert_eq!(ctx.info(vdec).unwrap().queued, 1);

        let seen = Arc::new(Mutex::new(0));
        let seen_cb = seen.clone();
        ctx.register_output_callback(
            vdec,
            Some(Arc::new(move |_b: MediaBuffer| *seen_cb.lock().unwrap() += 1)),
        )
        .unwrap();
        assert_eq!(ctx.info(vdec).unwrap().mode, DeliveryMode::Callback);
        assert_eq!(ctx.allocator().live(), 0);

        backend
            .emit(vdec, ctx.create_buffer(16, false).unwrap())
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);

        ctx.register_output_callback(vdec, None).unwrap();
        assert_eq!(ctx.info(vdec).unwrap().mode, DeliveryMode::Pull);
    }

    #[test]
    fn test_explicit_pull_conflicts_with_callback() {
        let (ctx, _, vdec) = open_vdec();
        ctx.register_output_callback_ex(
            vdec,
            Some(Arc::new(|_c: ChannelId, _b: MediaBuffer, _o: u64| {})),
            7,
        )
        .unwrap();
        let err = ctx.start_get_media_buffer(vdec).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);

        ctx.register_output_callback_ex(vdec, None, 0).unwrap();
        ctx.start_get_media_buffer(vdec).unwrap();
        ctx.start_get_media_buffer(vdec).unwrap();
        assert_eq!(ctx.info(vdec).unwrap().mode, DeliveryMode::Pull);
        ctx.stop_get_media_buffer(vdec).unwrap();
    }

    #[test]
    fn test_queue_depth_range() {
        let (ctx, _, vdec) = open_vdec();
        assert_eq!(
            ctx.set_queue_depth(vdec, 0).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            ctx.set_queue_depth(vdec, 65).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        ctx.set_queue_depth(vdec, 64).unwrap();
        assert_eq!(ctx.info(vdec).unwrap().queue_depth, 64);
    }

    #[test]
    fn test_blocked_pull_wakes_on_disable() {
        let (ctx, _, vdec) = open_vdec();
        let ctx = Arc::new(ctx);
        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || ctx.get_media_buffer(vdec, None))
        };
        std::thread::sleep(Duration::from_millis(50));
        ctx.disable_channel(vdec).unwrap();
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotReady);
    }
}
