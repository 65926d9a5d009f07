//! Push delivery: the producing thread hands each buffer to a closure.

use super::DeliverySink;
use crate::buffer::MediaBuffer;
use crate::channel::ChannelId;
use crate::observability;
use std::sync::Arc;

/// Output callback. Runs on the producing thread and must not block.
pub type OutputCallback = Arc<dyn Fn(MediaBuffer) + Send + Sync>;

/// Output callback that also receives the channel and an opaque handle.
pub type OutputCallbackEx = Arc<dyn Fn(ChannelId, MediaBuffer, u64) + Send + Sync>;

enum Callback {
    Plain(OutputCallback),
    Extended { callback: OutputCallbackEx, opaque: u64 },
}

/// Sink invoking a caller-supplied closure.
pub struct CallbackSink {
    channel: ChannelId,
    callback: Callback,
}

impl CallbackSink {
    /// Sink for a plain callback.
    pub fn new(channel: ChannelId, callback: OutputCallback) -> Self {
        Self {
            channel,
            callback: Callback::Plain(callback),
        }
    }

    /// Sink for an extended callback carrying `opaque` back to the caller.
    pub fn extended(channel: ChannelId, callback: OutputCallbackEx, opaque: u64) -> Self {
        Self {
            channel,
            callback: Callback::Extended { callback, opaque },
        }
    }
}

impl DeliverySink for CallbackSink {
    fn deliver(&self, buffer: MediaBuffer) {
        observability::record_delivered(self.channel);
        match &self.callback {
            Callback::Plain(callback) => callback(buffer),
            Callback::Extended { callback, opaque } => callback(self.channel, buffer, *opaque),
        }
    }
}
