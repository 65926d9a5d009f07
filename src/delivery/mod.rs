//! Buffer delivery from stages to consumers.
//!
//! Every consumer of a channel's output is a [`DeliverySink`]: a callback
//! ([`CallbackSink`]), a pull queue ([`PullSink`]), a remote RPC subscriber,
//! or the luma sampler ([`LumaSampler`]). A channel installs one
//! [`ChannelDelivery`] on its output stage; it routes each produced buffer
//! to the channel's single primary sink and, for capture channels, also to
//! the luma sampler.
//!
//! Delivery never fails and never blocks the producer. A sink that cannot
//! keep up drops buffers.

mod callback;
mod luma;
mod pull;
mod queue;

pub use callback::{CallbackSink, OutputCallback, OutputCallbackEx};
pub use luma::LumaSampler;
pub use pull::PullSink;
pub use queue::{BufferQueue, MAX_QUEUE_DEPTH, MIN_QUEUE_DEPTH, PushOutcome, QueueStats};

use crate::buffer::MediaBuffer;
use crate::channel::ChannelId;
use rkyv::{Archive, Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Receives buffers produced by a stage.
pub trait DeliverySink: Send + Sync {
    /// Take ownership of one buffer. Must not block.
    fn deliver(&self, buffer: MediaBuffer);
}

/// How a channel's output is consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum DeliveryMode {
    /// No local consumer (inert, or forwarded to an RPC subscriber).
    #[default]
    None,
    /// Plain output callback.
    Callback,
    /// Extended output callback.
    CallbackEx,
    /// Luma sampling only.
    Luma,
    /// Pull queue.
    Pull,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Callback => write!(f, "CALLBACK"),
            Self::CallbackEx => write!(f, "CALLBACK_EX"),
            Self::Luma => write!(f, "LUMA"),
            Self::Pull => write!(f, "PULL"),
        }
    }
}

/// The primary consumer of a channel.
#[derive(Clone)]
pub struct PrimarySink {
    mode: DeliveryMode,
    explicit: bool,
    sink: Arc<dyn DeliverySink>,
    queue: Option<Arc<BufferQueue>>,
}

impl PrimarySink {
    /// Pull consumer. `explicit` marks it as requested by the application,
    /// which keeps it installed when the channel is bound downstream.
    pub fn pull(queue: Arc<BufferQueue>, explicit: bool) -> Self {
        Self {
            mode: DeliveryMode::Pull,
            explicit,
            sink: Arc::new(PullSink::new(queue.clone())),
            queue: Some(queue),
        }
    }

    /// Callback consumer.
    pub fn callback(sink: CallbackSink, extended: bool) -> Self {
        Self {
            mode: if extended {
                DeliveryMode::CallbackEx
            } else {
                DeliveryMode::Callback
            },
            explicit: true,
            sink: Arc::new(sink),
            queue: None,
        }
    }

    /// Any other consumer (e.g. a remote subscriber); reported as mode NONE.
    pub fn forward(sink: Arc<dyn DeliverySink>) -> Self {
        Self {
            mode: DeliveryMode::None,
            explicit: true,
            sink,
            queue: None,
        }
    }

    /// Delivery mode this sink represents.
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Whether the application asked for this consumer.
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// Queue behind a pull consumer.
    pub fn queue(&self) -> Option<&Arc<BufferQueue>> {
        self.queue.as_ref()
    }

    /// Whether this consumer forwards to exactly `sink`.
    pub fn forwards_to(&self, sink: &Arc<dyn DeliverySink>) -> bool {
        Arc::ptr_eq(&self.sink, sink)
    }

    fn retire(self) {
        if let Some(queue) = &self.queue {
            queue.close();
        }
    }
}

#[derive(Default)]
struct Routes {
    primary: Option<PrimarySink>,
    luma: Option<Arc<LumaSampler>>,
}

/// Per-channel router installed as the output stage's delivery sink.
pub struct ChannelDelivery {
    channel: ChannelId,
    routes: Mutex<Routes>,
}

impl ChannelDelivery {
    /// Router with no consumers.
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            routes: Mutex::new(Routes::default()),
        }
    }

    /// Replace the primary consumer.
    ///
    /// The previous consumer's queue (if any) is closed: its buffers are
    /// released and blocked pullers return `NotReady`.
    pub fn set_primary(&self, primary: Option<PrimarySink>) {
        let old = {
            let mut routes = self.routes.lock().unwrap();
            std::mem::replace(&mut routes.primary, primary)
        };
        if let Some(old) = old {
            debug!(channel = %self.channel, mode = %old.mode, "primary consumer replaced");
            old.retire();
        }
    }

    /// Remove the primary consumer if it was not requested by the
    /// application. Returns whether one was removed.
    pub fn drop_implicit(&self) -> bool {
        let old = {
            let mut routes = self.routes.lock().unwrap();
            match &routes.primary {
                Some(p) if !p.explicit => routes.primary.take(),
                _ => None,
            }
        };
        match old {
            Some(old) => {
                old.retire();
                true
            }
            None => false,
        }
    }

    /// The current primary consumer.
    pub fn primary(&self) -> Option<PrimarySink> {
        self.routes.lock().unwrap().primary.clone()
    }

    /// The current mode. Luma counts only when it is the sole route.
    pub fn mode(&self) -> DeliveryMode {
        let routes = self.routes.lock().unwrap();
        match (&routes.primary, &routes.luma) {
            (Some(p), _) => p.mode,
            (None, Some(_)) => DeliveryMode::Luma,
            (None, None) => DeliveryMode::None,
        }
    }

    /// Queue of the pull consumer, if that is the primary.
    pub fn queue(&self) -> Option<Arc<BufferQueue>> {
        self.routes
            .lock()
            .unwrap()
            .primary
            .as_ref()
            .and_then(|p| p.queue.clone())
    }

    /// Install or remove the luma sampler.
    pub fn set_luma(&self, luma: Option<Arc<LumaSampler>>) {
        let old = std::mem::replace(&mut self.routes.lock().unwrap().luma, luma);
        if let Some(old) = old {
            old.clear();
        }
    }

    /// The luma sampler, if running.
    pub fn luma(&self) -> Option<Arc<LumaSampler>> {
        self.routes.lock().unwrap().luma.clone()
    }

    /// Whether any consumer is installed.
    pub fn has_route(&self) -> bool {
        let routes = self.routes.lock().unwrap();
        routes.primary.is_some() || routes.luma.is_some()
    }

    /// Remove every consumer, releasing queued buffers and waking pullers.
    pub fn clear(&self) {
        let old = std::mem::take(&mut *self.routes.lock().unwrap());
        if let Some(primary) = old.primary {
            primary.retire();
        }
        if let Some(luma) = old.luma {
            luma.clear();
        }
    }
}

impl DeliverySink for ChannelDelivery {
    fn deliver(&self, buffer: MediaBuffer) {
        let (primary, luma) = {
            let routes = self.routes.lock().unwrap();
            (
                routes.primary.as_ref().map(|p| p.sink.clone()),
                routes.luma.clone(),
            )
        };

        match (primary, luma) {
            (Some(primary), Some(luma)) => {
                luma.deliver(buffer.share());
                primary.deliver(buffer);
            }
            (Some(primary), None) => primary.deliver(buffer),
            (None, Some(luma)) => luma.deliver(buffer),
            (None, None) => {
                trace!(channel = %self.channel, "no consumer, releasing buffer");
            }
        }
    }
}

impl std::fmt::Debug for ChannelDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDelivery")
            .field("channel", &self.channel)
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferAllocator;
    use crate::channel::ModuleKind;
    use crate::format::{ImageInfo, PixelFormat, Rect};
    use std::time::Duration;

    fn vi() -> ChannelId {
        ChannelId::new(ModuleKind::Vi, 0)
    }

    #[test]
    fn test_switching_mode_drains_queue() {
        let allocator = BufferAllocator::new();
        let delivery = ChannelDelivery::new(vi());
        let queue = Arc::new(BufferQueue::new(vi(), 4).unwrap());
        delivery.set_primary(Some(PrimarySink::pull(queue.clone(), false)));

        delivery.deliver(allocator.create_buffer(8, false).unwrap());
        delivery.deliver(allocator.create_buffer(8, false).unwrap());
        assert_eq!(queue.len(), 2);

        let seen = Arc::new(Mutex::new(0));
        let seen_cb = seen.clone();
        let sink = CallbackSink::new(vi(), Arc::new(move |_b: MediaBuffer| *seen_cb.lock().unwrap() += 1));
        delivery.set_primary(Some(PrimarySink::callback(sink, false)));

        assert!(queue.is_closed());
        assert_eq!(queue.len(), 0);
        assert_eq!(allocator.live(), 0);
        assert_eq!(delivery.mode(), DeliveryMode::Callback);

        delivery.deliver(allocator.create_buffer(8, false).unwrap());
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(allocator.live(), 0);
    }

    #[test]
    fn test_luma_alongside_primary() {
        let allocator = BufferAllocator::new();
        let delivery = ChannelDelivery::new(vi());
        let queue = Arc::new(BufferQueue::new(vi(), 2).unwrap());
        let luma = Arc::new(LumaSampler::new(vi()));
        delivery.set_primary(Some(PrimarySink::pull(queue.clone(), true)));
        delivery.set_luma(Some(luma.clone()));

        let info = ImageInfo::new(4, 4, PixelFormat::Gray8);
        let mut frame = allocator.create_image_buffer(info, false).unwrap();
        frame.data_mut().fill(80);
        delivery.deliver(frame);

        assert_eq!(luma.mean_luma(Rect::default()).unwrap(), 80);
        let popped = queue.pop(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(popped.data()[0], 80);
        assert_eq!(delivery.mode(), DeliveryMode::Pull);

        drop(popped);
        assert_eq!(allocator.live(), 1);
        delivery.clear();
        assert_eq!(allocator.live(), 0);
        assert_eq!(delivery.mode(), DeliveryMode::None);
    }

    #[test]
    fn test_drop_implicit_keeps_explicit() {
        let delivery = ChannelDelivery::new(vi());
        let implicit = Arc::new(BufferQueue::new(vi(), 2).unwrap());
        delivery.set_primary(Some(PrimarySink::pull(implicit.clone(), false)));
        assert!(delivery.drop_implicit());
        assert!(implicit.is_closed());
        assert!(!delivery.has_route());

        let explicit = Arc::new(BufferQueue::new(vi(), 2).unwrap());
        delivery.set_primary(Some(PrimarySink::pull(explicit.clone(), true)));
        assert!(!delivery.drop_implicit());
        assert!(!explicit.is_closed());
    }

    #[test]
    fn test_no_route_releases() {
        let allocator = BufferAllocator::new();
        let delivery = ChannelDelivery::new(vi());
        delivery.deliver(allocator.create_buffer(8, false).unwrap());
        assert_eq!(allocator.live(), 0);
    }
}
