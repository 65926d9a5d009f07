//! Channel events and their routing.
//!
//! Stages report notable conditions (motion, a finished file, end of stream)
//! through an [`EventSink`]. Each channel owns a [`ChannelEvents`] router that
//! fans an event out to at most one local callback and any number of
//! subscribers (RPC sessions). Routes are cleared when the channel is
//! disabled.

use crate::channel::ChannelId;
use crate::format::Rect;
use rkyv::{Archive, Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

// Keys are unique across routers so a stale key never matches a newer
// subscriber after the channel is re-enabled.
static NEXT_SUBSCRIBER_KEY: AtomicU64 = AtomicU64::new(1);

/// An asynchronous notification from a channel's stage.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ChannelEvent {
    /// Motion was detected inside `region`.
    MotionDetected {
        /// Bounding box of the motion.
        region: Rect,
    },
    /// The lens was covered (`true`) or uncovered (`false`).
    Occlusion {
        /// Current occlusion state.
        covered: bool,
    },
    /// A muxer finished writing a file.
    FileCreated {
        /// Path of the new file.
        path: String,
    },
    /// The stage has no more data.
    EndOfStream,
    /// The stage hit an error it could not recover from.
    StageError {
        /// Error code, see [`ErrorCode`](crate::error::ErrorCode).
        code: i32,
        /// Description.
        message: String,
    },
}

/// Receives events from a stage. Must not block.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &ChannelEvent);
}

/// A local event callback.
pub type EventCallback = Arc<dyn Fn(ChannelId, &ChannelEvent) + Send + Sync>;

#[derive(Default)]
struct Routes {
    callback: Option<EventCallback>,
    subscribers: Vec<(u64, Arc<dyn EventSink>)>,
}

/// Per-channel event router.
pub struct ChannelEvents {
    channel: ChannelId,
    routes: Mutex<Routes>,
}

impl ChannelEvents {
    /// Router for one channel.
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            routes: Mutex::new(Routes::default()),
        }
    }

    /// Replace the local callback.
    pub fn set_callback(&self, callback: Option<EventCallback>) {
        self.routes.lock().unwrap().callback = callback;
    }

    /// Add a subscriber; returns a key for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> u64 {
        let key = NEXT_SUBSCRIBER_KEY.fetch_add(1, Ordering::Relaxed);
        self.routes.lock().unwrap().subscribers.push((key, sink));
        key
    }

    /// Remove a subscriber. Returns whether it was present.
    pub fn unsubscribe(&self, key: u64) -> bool {
        let removed = {
            let mut routes = self.routes.lock().unwrap();
            let pos = routes.subscribers.iter().position(|(k, _)| *k == key);
            pos.map(|pos| routes.subscribers.remove(pos))
        };
        removed.is_some()
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.routes.lock().unwrap().subscribers.len()
    }

    /// Drop the callback and every subscriber.
    pub fn clear(&self) {
        // Dropped outside the lock: a subscriber's Drop may take other locks.
        let _old = std::mem::take(&mut *self.routes.lock().unwrap());
    }
}

impl EventSink for ChannelEvents {
    fn on_event(&self, event: &ChannelEvent) {
        let (callback, subscribers) = {
            let routes = self.routes.lock().unwrap();
            let subscribers: Vec<_> = routes.subscribers.iter().map(|(_, s)| s.clone()).collect();
            (routes.callback.clone(), subscribers)
        };
        trace!(channel = %self.channel, ?event, subscribers = subscribers.len(), "event");

        if let Some(callback) = callback {
            callback(self.channel, event);
        }
        for subscriber in subscribers {
            subscriber.on_event(event);
        }
    }
}

impl std::fmt::Debug for ChannelEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEvents")
            .field("channel", &self.channel)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
