//! Bounded per-channel buffer queue with a pollable wake descriptor.
//!
//! Producers never block: when the queue is at depth the oldest queued buffer
//! is dropped (or, if the consumer already holds every attributed buffer, the
//! new one is). Consumers pop with an optional timeout. Closing the queue
//! releases everything queued and wakes every waiter with `NotReady`.
//!
//! "Attributed" counts buffers still in the queue plus buffers popped but not
//! yet released: each popped buffer carries a lease back to its queue.

use crate::buffer::{Lease, LeaseOwner, MediaBuffer};
use crate::channel::ChannelId;
use crate::error::{Error, Result};
use rustix::event::{EventfdFlags, eventfd};
use rustix::fd::{BorrowedFd, OwnedFd};
use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

/// Smallest accepted queue depth.
pub const MIN_QUEUE_DEPTH: usize = 1;
/// Largest accepted queue depth.
pub const MAX_QUEUE_DEPTH: usize = 64;

/// What happened to a pushed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued without dropping anything.
    Queued,
    /// Enqueued after dropping the oldest queued buffer.
    DroppedOldest,
    /// The new buffer was dropped.
    DroppedNew,
}

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Buffers currently queued.
    pub queued: usize,
    /// Buffers popped and still held by the consumer.
    pub leased: usize,
    /// Total buffers accepted.
    pub pushed: u64,
    /// Total buffers popped.
    pub popped: u64,
    /// Total buffers dropped by backpressure.
    pub dropped: u64,
}

struct QueueState {
    buffers: VecDeque<MediaBuffer>,
    depth: usize,
    leased: usize,
    quit: bool,
    pushed: u64,
    popped: u64,
    dropped: u64,
}

struct QueueInner {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    wake: OwnedFd,
}

impl QueueInner {
    fn signal(&self) {
        let _ = rustix::io::write(&self.wake, &1u64.to_ne_bytes());
    }

    fn unsignal(&self) {
        let mut buf = [0u8; 8];
        let _ = rustix::io::read(&self.wake, &mut buf);
    }

    fn reset_wake(&self) {
        let mut buf = [0u8; 8];
        // Semaphore mode: each read takes one count; stops at EAGAIN.
        while rustix::io::read(&self.wake, &mut buf).is_ok() {}
    }
}

impl LeaseOwner for QueueInner {
    fn lease_returned(&self) {
        let mut state = self.state.lock().unwrap();
        state.leased = state.leased.saturating_sub(1);
    }
}

/// Bounded drop-oldest queue of media buffers.
pub struct BufferQueue {
    channel: ChannelId,
    inner: Arc<QueueInner>,
}

fn check_depth(depth: usize) -> Result<()> {
    if !(MIN_QUEUE_DEPTH..=MAX_QUEUE_DEPTH).contains(&depth) {
        return Err(Error::InvalidArgument(format!(
            "queue depth {} outside {}..={}",
            depth, MIN_QUEUE_DEPTH, MAX_QUEUE_DEPTH
        )));
    }
    Ok(())
}

impl BufferQueue {
    /// Create a queue holding at most `depth` attributed buffers.
    pub fn new(channel: ChannelId, depth: usize) -> Result<Self> {
        check_depth(depth)?;
        let wake = eventfd(
            0,
            EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK | EventfdFlags::SEMAPHORE,
        )?;
        Ok(Self {
            channel,
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    buffers: VecDeque::with_capacity(depth),
                    depth,
                    leased: 0,
                    quit: false,
                    pushed: 0,
                    popped: 0,
                    dropped: 0,
                }),
                not_empty: Condvar::new(),
                wake,
            }),
        })
    }

    /// Channel this queue belongs to.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Offer a buffer. Never blocks.
    pub fn push(&self, buffer: MediaBuffer) -> PushOutcome {
        let evicted;
        let outcome;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.quit {
                state.dropped += 1;
                drop(state);
                drop(buffer);
                return PushOutcome::DroppedNew;
            }

            let attributed = state.buffers.len() + state.leased;
            if attributed >= state.depth {
                if state.buffers.is_empty() {
                    state.dropped += 1;
                    drop(state);
                    trace!(channel = %self.channel, "consumer holds every buffer, dropping new");
                    drop(buffer);
                    return PushOutcome::DroppedNew;
                }
                evicted = state.buffers.pop_front();
                state.dropped += 1;
                outcome = PushOutcome::DroppedOldest;
            } else {
                evicted = None;
                outcome = PushOutcome::Queued;
                self.inner.signal();
            }

            state.buffers.push_back(buffer);
            state.pushed += 1;
        }
        self.inner.not_empty.notify_one();

        if evicted.is_some() {
            trace!(channel = %self.channel, "queue full, dropped oldest");
        }
        drop(evicted);
        outcome
    }

    /// Take the oldest buffer.
    ///
    /// `None` waits indefinitely, `Some(Duration::ZERO)` does not wait, any
    /// other value waits at most that long. Returns `Ok(None)` on timeout and
    /// `NotReady` once the queue has been closed.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<Option<MediaBuffer>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock().unwrap();

        loop {
            if state.quit {
                return Err(Error::NotReady(format!("{} queue closed", self.channel)));
            }
            if let Some(mut buffer) = state.buffers.pop_front() {
                state.leased += 1;
                state.popped += 1;
                drop(state);
                self.inner.unsignal();
                let owner: Weak<dyn LeaseOwner> = Arc::downgrade(&self.inner) as Weak<dyn LeaseOwner>;
                buffer.attach_lease(Lease::new(owner));
                return Ok(Some(buffer));
            }

            state = match deadline {
                None => self.inner.not_empty.wait(state).unwrap(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    self.inner.not_empty.wait_timeout(state, remaining).unwrap().0
                }
            };
        }
    }

    /// Release every queued buffer and zero the wake descriptor.
    pub fn drain(&self) -> usize {
        let drained: Vec<MediaBuffer> = {
            let mut state = self.inner.state.lock().unwrap();
            let drained = state.buffers.drain(..).collect();
            self.inner.reset_wake();
            drained
        };
        drained.len()
    }

    /// Close the queue: drain it and wake every waiter with `NotReady`.
    pub fn close(&self) {
        let drained: Vec<MediaBuffer> = {
            let mut state = self.inner.state.lock().unwrap();
            state.quit = true;
            let drained = state.buffers.drain(..).collect();
            self.inner.reset_wake();
            drained
        };
        self.inner.not_empty.notify_all();
        trace!(channel = %self.channel, released = drained.len(), "queue closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().quit
    }

    /// Change the depth; excess queued buffers are dropped oldest first.
    pub fn set_depth(&self, depth: usize) -> Result<()> {
        check_depth(depth)?;
        let mut evicted = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.depth = depth;
            while state.buffers.len() + state.leased > depth {
                match state.buffers.pop_front() {
                    Some(buffer) => {
                        self.inner.unsignal();
                        state.dropped += 1;
                        evicted.push(buffer);
                    }
                    None => break,
                }
            }
        }
        drop(evicted);
        Ok(())
    }

    /// Current depth.
    pub fn depth(&self) -> usize {
        self.inner.state.lock().unwrap().depth
    }

    /// Buffers currently queued.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().buffers.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().unwrap();
        QueueStats {
            queued: state.buffers.len(),
            leased: state.leased,
            pushed: state.pushed,
            popped: state.popped,
            dropped: state.dropped,
        }
    }

    /// Semaphore eventfd readable while buffers are queued, for `poll(2)`.
    ///
    /// Its counter equals the number of queued buffers. Do not read from it.
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.inner.wake.as_fd()
    }
}

impl std::fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueue")
            .field("channel", &self.channel)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferAllocator;
    use crate::channel::ModuleKind;
    use std::thread;

    fn chn() -> ChannelId {
        ChannelId::new(ModuleKind::Vi, 0)
    }

    fn numbered(allocator: &BufferAllocator, n: u64) -> MediaBuffer {
        let mut buffer = allocator.create_buffer(16, false).unwrap();
        buffer.set_timestamp_us(n);
        buffer
    }

    fn wake_count(queue: &BufferQueue) -> u64 {
        let mut count = 0;
        let mut buf = [0u8; 8];
        while rustix::io::read(queue.wake_fd(), &mut buf).is_ok() {
            count += 1;
        }
        // restore so the queue's own bookkeeping stays consistent
        for _ in 0..count {
            let _ = rustix::io::write(queue.wake_fd(), &1u64.to_ne_bytes());
        }
        count
    }

    #[test]
    fn test_depth_one_keeps_newest_unpopped() {
        let allocator = BufferAllocator::new();
        let queue = BufferQueue::new(chn(), 1).unwrap();

        assert_eq!(queue.push(numbered(&allocator, 1)), PushOutcome::Queued);
        assert_eq!(queue.push(numbered(&allocator, 2)), PushOutcome::DroppedOldest);

        assert_eq!(allocator.live(), 1);
        let got = queue.pop(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(got.timestamp_us(), 2);
    }

    #[test]
    fn test_depth_one_drops_new_while_consumer_holds() {
        let allocator = BufferAllocator::new();
        let queue = BufferQueue::new(chn(), 1).unwrap();

        queue.push(numbered(&allocator, 1));
        let held = queue.pop(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(queue.push(numbered(&allocator, 2)), PushOutcome::DroppedNew);
        assert_eq!(allocator.live(), 1);

        drop(held);
        assert_eq!(queue.push(numbered(&allocator, 3)), PushOutcome::Queued);
    }

    #[test]
    fn test_depth_three_drops_oldest() {
        let allocator = BufferAllocator::new();
        let queue = BufferQueue::new(chn(), 3).unwrap();
        for n in 1..=4 {
            queue.push(numbered(&allocator, n));
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop(Some(Duration::ZERO)).unwrap())
            .map(|b| b.timestamp_us())
            .collect();
        assert_eq!(order, vec![2, 3, 4]);
        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(allocator.live(), 0);
    }

    #[test]
    fn test_wake_fd_tracks_queued_count() {
        let allocator = BufferAllocator::new();
        let queue = BufferQueue::new(chn(), 2).unwrap();
        assert_eq!(wake_count(&queue), 0);

        queue.push(numbered(&allocator, 1));
        queue.push(numbered(&allocator, 2));
        queue.push(numbered(&allocator, 3));
        assert_eq!(wake_count(&queue), 2);

        let _b = queue.pop(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(wake_count(&queue), 1);

        queue.drain();
        assert_eq!(wake_count(&queue), 0);
    }

    #[test]
    fn test_pop_timeout_and_nonblocking() {
        let queue = BufferQueue::new(chn(), 2).unwrap();
        assert!(queue.pop(Some(Duration::ZERO)).unwrap().is_none());

        let start = Instant::now();
        assert!(queue.pop(Some(Duration::from_millis(30))).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let allocator = BufferAllocator::new();
        let queue = Arc::new(BufferQueue::new(chn(), 2).unwrap());
        queue.push(numbered(&allocator, 1));
        queue.drain();

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop(None))
        };
        thread::sleep(Duration::from_millis(30));
        queue.close();

        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotReady);
        assert_eq!(allocator.live(), 0);
    }

    #[test]
    fn test_push_after_close_releases() {
        let allocator = BufferAllocator::new();
        let queue = BufferQueue::new(chn(), 2).unwrap();
        queue.close();
        assert_eq!(queue.push(numbered(&allocator, 1)), PushOutcome::DroppedNew);
        assert_eq!(allocator.live(), 0);
    }

    #[test]
    fn test_set_depth_trims() {
        let allocator = BufferAllocator::new();
        let queue = BufferQueue::new(chn(), 4).unwrap();
        for n in 1..=4 {
            queue.push(numbered(&allocator, n));
        }
        queue.set_depth(2).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.pop(Some(Duration::ZERO)).unwrap().unwrap().timestamp_us(),
            3
        );
        assert!(queue.set_depth(0).is_err());
        assert!(queue.set_depth(65).is_err());
    }
}
