//! Server-side state of one RPC connection.
//!
//! A [`Session`] owns the connection's socket, the table of buffer handles
//! the client holds, and the channel subscriptions it made. Subscriptions are
//! installed into the [`Context`] as [`RemoteSink`] / [`RemoteEvents`]; the
//! channel owns them, the session only keeps weak references. When a channel
//! is disabled it drops its sinks, and their `Drop` removes the session's
//! entry, so nothing is written for a channel after it went away.

use super::frame::{FrameKind, write_frame};
use super::protocol::{EventPush, OutputPush};
use crate::buffer::MediaBuffer;
use crate::channel::ChannelId;
use crate::context::Context;
use crate::delivery::DeliverySink;
use crate::error::{Error, Result};
use crate::event::{ChannelEvent, EventSink};
use crate::observability::record_dropped;
use rustix::fd::BorrowedFd;
use rustix::net::{RecvAncillaryBuffer, RecvFlags, recvmsg};
use std::collections::HashMap;
use std::io::IoSliceMut;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace, warn};

/// Buffers one session may hold before further pushes are dropped.
pub const MAX_OUTSTANDING_HANDLES: usize = 64;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// One connected client.
pub struct Session {
    id: u64,
    stream: UnixStream,
    write_lock: Mutex<()>,
    handles: Mutex<HashMap<u64, MediaBuffer>>,
    next_handle: AtomicU64,
    closed: AtomicBool,
    outputs: Mutex<HashMap<ChannelId, (u64, Weak<RemoteSink>)>>,
    events: Mutex<HashMap<ChannelId, (u64, u64, Weak<RemoteEvents>)>>,
}

impl Session {
    /// Session over an accepted connection.
    pub fn new(id: u64, stream: UnixStream) -> Self {
        Self {
            id,
            stream,
            write_lock: Mutex::new(()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            outputs: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Session id, unique per server.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The connection.
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Whether the connection is known to be unusable.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the session closed and shut the socket down, waking its worker.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    /// Whether the peer hung up. Does not consume pending input.
    pub fn peer_gone(&self) -> bool {
        if self.is_closed() {
            return true;
        }
        let mut probe = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut probe)];
        let mut ancillary = RecvAncillaryBuffer::default();
        match recvmsg(
            &self.stream,
            &mut iov,
            &mut ancillary,
            RecvFlags::PEEK | RecvFlags::DONTWAIT,
        ) {
            Ok(msg) if msg.bytes == 0 => true,
            Ok(_) => false,
            Err(rustix::io::Errno::AGAIN) | Err(rustix::io::Errno::INTR) => false,
            Err(_) => true,
        }
    }

    /// Write one frame; a failed write closes the session.
    pub fn send(
        &self,
        kind: FrameKind,
        seq: u32,
        payload: &[u8],
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }
        let result = {
            let _guard = self.write_lock.lock().unwrap();
            write_frame(&self.stream, kind, seq, payload, fd)
        };
        if let Err(e) = &result {
            debug!(session = self.id, error = %e, "write failed, closing session");
            self.close();
        }
        result
    }

    // ========================================================================
    // Buffer handles
    // ========================================================================

    /// Park `buffer` in the handle table and return its handle.
    pub fn insert_handle(&self, buffer: MediaBuffer) -> Result<u64> {
        let mut handles = self.handles.lock().unwrap();
        if handles.len() >= MAX_OUTSTANDING_HANDLES {
            return Err(Error::ResourceExhausted(format!(
                "session {} holds {} buffers",
                self.id,
                handles.len()
            )));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        handles.insert(handle, buffer);
        Ok(handle)
    }

    /// Take a buffer back out of the handle table.
    pub fn take_handle(&self, handle: u64) -> Option<MediaBuffer> {
        self.handles.lock().unwrap().remove(&handle)
    }

    /// Number of handles the client holds.
    pub fn outstanding(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Forward the channel's output to this session.
    ///
    /// Subscribing twice to the same channel is a no-op.
    pub fn subscribe_output(self: &Arc<Self>, ctx: &Context, channel: ChannelId) -> Result<()> {
        let serial = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        let sink = Arc::new(RemoteSink {
            session: Arc::downgrade(self),
            channel,
            serial,
        });
        {
            let mut outputs = self.outputs.lock().unwrap();
            if let Some((_, existing)) = outputs.get(&channel)
                && existing.strong_count() > 0
            {
                return Ok(());
            }
            outputs.insert(channel, (serial, Arc::downgrade(&sink)));
        }
        // On failure `sink` drops here and removes its own entry.
        ctx.subscribe_output(channel, sink)?;
        debug!(session = self.id, %channel, "output subscribed");
        Ok(())
    }

    /// Stop forwarding the channel's output. Returns whether a live
    /// subscription was removed.
    pub fn unsubscribe_output(&self, ctx: &Context, channel: ChannelId) -> Result<bool> {
        let entry = self.outputs.lock().unwrap().remove(&channel);
        let Some(sink) = entry.and_then(|(_, weak)| weak.upgrade()) else {
            return Ok(false);
        };
        let sink: Arc<dyn DeliverySink> = sink;
        ctx.unsubscribe_output(channel, &sink)
    }

    /// Forward the channel's events to this session.
    ///
    /// Subscribing twice to the same channel is a no-op.
    pub fn subscribe_events(self: &Arc<Self>, ctx: &Context, channel: ChannelId) -> Result<()> {
        if let Some((_, _, existing)) = self.events.lock().unwrap().get(&channel)
            && existing.strong_count() > 0
        {
            return Ok(());
        }
        let serial = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        let sink = Arc::new(RemoteEvents {
            session: Arc::downgrade(self),
            channel,
            serial,
        });
        let weak = Arc::downgrade(&sink);
        let key = ctx.subscribe_events(channel, sink)?;
        self.events
            .lock()
            .unwrap()
            .insert(channel, (key, serial, weak));
        debug!(session = self.id, %channel, "events subscribed");
        Ok(())
    }

    /// Stop forwarding the channel's events. Returns whether a subscription
    /// was removed.
    pub fn unsubscribe_events(&self, ctx: &Context, channel: ChannelId) -> Result<bool> {
        let entry = self.events.lock().unwrap().remove(&channel);
        match entry {
            Some((key, _, _)) => ctx.unsubscribe_events(channel, key),
            None => Ok(false),
        }
    }

    /// Number of live output subscriptions.
    pub fn output_subscriptions(&self) -> usize {
        self.outputs
            .lock()
            .unwrap()
            .values()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    /// Drop every subscription and every held buffer.
    pub fn cleanup(&self, ctx: &Context) {
        let outputs: Vec<ChannelId> = self.outputs.lock().unwrap().keys().copied().collect();
        for channel in outputs {
            if let Err(e) = self.unsubscribe_output(ctx, channel) {
                trace!(session = self.id, %channel, error = %e, "output already gone");
            }
        }
        let events: Vec<ChannelId> = self.events.lock().unwrap().keys().copied().collect();
        for channel in events {
            if let Err(e) = self.unsubscribe_events(ctx, channel) {
                trace!(session = self.id, %channel, error = %e, "events already gone");
            }
        }
        let held = std::mem::take(&mut *self.handles.lock().unwrap());
        if !held.is_empty() {
            debug!(session = self.id, buffers = held.len(), "releasing buffers held by client");
        }
    }

    fn forget_output(&self, channel: ChannelId, serial: u64) {
        let mut outputs = self.outputs.lock().unwrap();
        if outputs.get(&channel).is_some_and(|(s, _)| *s == serial) {
            outputs.remove(&channel);
        }
    }

    fn forget_events(&self, channel: ChannelId, serial: u64) {
        let mut events = self.events.lock().unwrap();
        if events.get(&channel).is_some_and(|(_, s, _)| *s == serial) {
            events.remove(&channel);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

// ============================================================================
// Remote sinks
// ============================================================================

/// Delivery sink that pushes buffers to a session as `Output` frames.
///
/// The write happens on the producer thread and is bounded by
/// `ServerConfig::write_timeout`. A failed write closes the session.
pub struct RemoteSink {
    session: Weak<Session>,
    channel: ChannelId,
    serial: u64,
}

impl DeliverySink for RemoteSink {
    fn deliver(&self, buffer: MediaBuffer) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.is_closed() {
            return;
        }

        let info = buffer.info();
        let segment = Arc::clone(buffer.segment());
        let handle = match session.insert_handle(buffer) {
            Ok(handle) => handle,
            Err(_) => {
                trace!(session = session.id, channel = %self.channel, "client holds too many buffers, dropping");
                record_dropped(self.channel);
                return;
            }
        };

        let push = OutputPush {
            channel: self.channel,
            handle,
            info,
        };
        let sent = push
            .encode()
            .and_then(|bytes| session.send(FrameKind::Output, 0, &bytes, Some(segment.fd())));
        if let Err(e) = sent {
            warn!(session = session.id, channel = %self.channel, error = %e, "output push failed");
            session.take_handle(handle);
        }
    }
}

impl Drop for RemoteSink {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.forget_output(self.channel, self.serial);
        }
    }
}

/// Event sink that pushes events to a session as `Event` frames.
pub struct RemoteEvents {
    session: Weak<Session>,
    channel: ChannelId,
    serial: u64,
}

impl EventSink for RemoteEvents {
    fn on_event(&self, event: &ChannelEvent) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let push = EventPush {
            channel: self.channel,
            event: event.clone(),
        };
        let sent = push
            .encode()
            .and_then(|bytes| session.send(FrameKind::Event, 0, &bytes, None));
        if let Err(e) = sent {
            debug!(session = session.id, channel = %self.channel, error = %e, "event push failed");
        }
    }
}

impl Drop for RemoteEvents {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.forget_events(self.channel, self.serial);
        }
    }
}
