//! Pull delivery: produced buffers wait in a [`BufferQueue`] for the consumer.

use super::queue::{BufferQueue, PushOutcome};
use super::DeliverySink;
use crate::buffer::MediaBuffer;
use crate::observability;
use std::sync::Arc;

/// Sink that enqueues every buffer for a later `get_media_buffer`.
pub struct PullSink {
    queue: Arc<BufferQueue>,
}

impl PullSink {
    /// Sink feeding `queue`.
    pub fn new(queue: Arc<BufferQueue>) -> Self {
        Self { queue }
    }

    /// The queue behind this sink.
    pub fn queue(&self) -> &Arc<BufferQueue> {
        &self.queue
    }
}

impl DeliverySink for PullSink {
    fn deliver(&self, buffer: MediaBuffer) {
        let channel = self.queue.channel();
        match self.queue.push(buffer) {
            PushOutcome::Queued => observability::record_delivered(channel),
            PushOutcome::DroppedOldest => {
                observability::record_delivered(channel);
                observability::record_dropped(channel);
            }
            PushOutcome::DroppedNew => observability::record_dropped(channel),
        }
    }
}
