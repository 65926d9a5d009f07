//! RPC client.
//!
//! [`RpcClient`] mirrors the [`Context`](crate::context::Context) API over a
//! Unix socket. Calls may be made from any number of threads; a single
//! reader thread routes responses back to their callers by sequence number
//! and runs output and event callbacks.
//!
//! Buffers arrive as [`RemoteBuffer`]s mapping the server's memory. Dropping
//! one tells the server to release it; passing it to
//! [`send_media_buffer`](RpcClient::send_media_buffer) hands it back without
//! a copy.

use super::frame::{Frame, FrameKind, read_frame, write_frame};
use super::protocol::{BufferRef, EventPush, OutputPush, Request, Response};
use crate::buffer::{BufferInfo, MediaBuffer};
use crate::channel::{BindEdge, ChannelConfig, ChannelId, ChannelInfo, ChannelStatus};
use crate::context::PoolId;
use crate::error::{Error, Result};
use crate::event::EventCallback;
use crate::format::{AudioInfo, ImageInfo, Rect};
use crate::memory::{CpuSegment, MemoryType, PoolConfig};
use crate::stage::StageControl;
use rustix::fd::{BorrowedFd, OwnedFd};
use std::collections::HashMap;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Receives buffers pushed for an output subscription.
///
/// Runs on the client's reader thread: it must not make calls on the same
/// client, or it waits for a response only it could read.
pub type RemoteOutputCallback = Arc<dyn Fn(RemoteBuffer) + Send + Sync>;

struct Reply {
    response: Response,
    fds: Vec<OwnedFd>,
}

struct ClientInner {
    stream: UnixStream,
    write_lock: Mutex<()>,
    next_seq: AtomicU32,
    closed: AtomicBool,
    pending: Mutex<HashMap<u32, kanal::Sender<Reply>>>,
    outputs: Mutex<HashMap<ChannelId, RemoteOutputCallback>>,
    events: Mutex<HashMap<ChannelId, EventCallback>>,
}

impl ClientInner {
    fn send(&self, kind: FrameKind, seq: u32, payload: &[u8], fd: Option<BorrowedFd<'_>>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        let _guard = self.write_lock.lock().unwrap();
        write_frame(&self.stream, kind, seq, payload, fd)
    }

    fn call(&self, request: &Request, fd: Option<BorrowedFd<'_>>) -> Result<Reply> {
        let bytes = request.encode()?;
        let seq = loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                break seq;
            }
        };

        let (tx, rx) = kanal::bounded(1);
        self.pending.lock().unwrap().insert(seq, tx);
        // The reader sets `closed` before failing pending calls.
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().unwrap().remove(&seq);
            return Err(Error::Disconnected);
        }
        if let Err(e) = self.send(FrameKind::Request, seq, &bytes, fd) {
            self.pending.lock().unwrap().remove(&seq);
            return Err(e);
        }

        let reply = rx.recv().map_err(|_| Error::Disconnected)?;
        let response = reply.response.into_result()?;
        Ok(Reply {
            response,
            fds: reply.fds,
        })
    }

    fn notify(&self, request: &Request) {
        let sent = request
            .encode()
            .and_then(|bytes| self.send(FrameKind::Notice, 0, &bytes, None));
        if let Err(e) = sent {
            trace!(op = %request.opcode(), error = %e, "notice not sent");
        }
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

// ============================================================================
// RemoteBuffer
// ============================================================================

/// A buffer held on behalf of the server, mapped into this process.
///
/// Dereferences to [`MediaBuffer`]. Writes through
/// [`data_mut`](MediaBuffer::data_mut) are visible to the server.
pub struct RemoteBuffer {
    buffer: MediaBuffer,
    handle: Option<u64>,
    client: Weak<ClientInner>,
}

impl RemoteBuffer {
    /// Server-side handle.
    pub fn handle(&self) -> u64 {
        self.handle.unwrap_or(0)
    }

    fn into_handle(mut self) -> Option<u64> {
        self.handle.take()
    }
}

impl std::ops::Deref for RemoteBuffer {
    type Target = MediaBuffer;

    fn deref(&self) -> &MediaBuffer {
        &self.buffer
    }
}

impl std::ops::DerefMut for RemoteBuffer {
    fn deref_mut(&mut self) -> &mut MediaBuffer {
        &mut self.buffer
    }
}

impl Drop for RemoteBuffer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Some(client) = self.client.upgrade()
        {
            client.notify(&Request::ReleaseBuffer { handle });
        }
    }
}

impl std::fmt::Debug for RemoteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBuffer")
            .field("handle", &self.handle)
            .field("buffer", &self.buffer)
            .finish()
    }
}

fn adopt(
    client: &Arc<ClientInner>,
    handle: u64,
    info: &BufferInfo,
    fds: Vec<OwnedFd>,
) -> Result<RemoteBuffer> {
    let release = || client.notify(&Request::ReleaseBuffer { handle });
    let Some(fd) = fds.into_iter().next() else {
        release();
        return Err(Error::Protocol(format!("buffer {} arrived without a descriptor", handle)));
    };
    let mapped = CpuSegment::from_fd(fd, MemoryType::for_request(info.hardware))
        .and_then(|segment| MediaBuffer::from_info(Arc::new(segment), info));
    match mapped {
        Ok(buffer) => Ok(RemoteBuffer {
            buffer,
            handle: Some(handle),
            client: Arc::downgrade(client),
        }),
        Err(e) => {
            release();
            Err(e)
        }
    }
}

// ============================================================================
// RpcClient
// ============================================================================

/// Connection to an [`RpcServer`](super::RpcServer).
pub struct RpcClient {
    inner: Arc<ClientInner>,
    reader: Option<JoinHandle<()>>,
}

impl RpcClient {
    /// Connect to the server listening on `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref())?;
        let read_stream = stream.try_clone()?;
        let inner = Arc::new(ClientInner {
            stream,
            write_lock: Mutex::new(()),
            next_seq: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
        });
        let reader_inner = Arc::clone(&inner);
        let reader = thread::Builder::new()
            .name("mediaplane-client".into())
            .spawn(move || read_loop(read_stream, reader_inner))?;
        debug!(path = %path.as_ref().display(), "connected");
        Ok(Self {
            inner,
            reader: Some(reader),
        })
    }

    /// Whether the connection is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ok(&self, request: Request) -> Result<()> {
        self.inner.call(&request, None).map(|_| ())
    }

    fn buffer(&self, request: Request) -> Result<Option<RemoteBuffer>> {
        let reply = self.inner.call(&request, None)?;
        match reply.response {
            Response::Buffer { handle, info } => adopt(&self.inner, handle, &info, reply.fds).map(Some),
            Response::NoBuffer => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    fn required_buffer(&self, request: Request) -> Result<RemoteBuffer> {
        self.buffer(request)?
            .ok_or_else(|| Error::Protocol("server returned no buffer".into()))
    }

    // ========================================================================
    // Lifecycle and binding
    // ========================================================================

    /// See [`Context::set_attr`](crate::context::Context::set_attr).
    pub fn set_attr(&self, id: ChannelId, config: ChannelConfig) -> Result<()> {
        self.ok(Request::SetAttr { id, config })
    }

    /// See [`Context::get_attr`](crate::context::Context::get_attr).
    pub fn get_attr(&self, id: ChannelId) -> Result<ChannelConfig> {
        match self.inner.call(&Request::GetAttr { id }, None)?.response {
            Response::Attr(config) => Ok(config),
            other => Err(unexpected(other)),
        }
    }

    /// See [`Context::enable_channel`](crate::context::Context::enable_channel).
    pub fn enable_channel(&self, id: ChannelId) -> Result<()> {
        self.ok(Request::EnableChannel { id })
    }

    /// See [`Context::disable_channel`](crate::context::Context::disable_channel).
    pub fn disable_channel(&self, id: ChannelId) -> Result<()> {
        self.ok(Request::DisableChannel { id })
    }

    /// See [`Context::destroy_channel`](crate::context::Context::destroy_channel).
    pub fn destroy_channel(&self, id: ChannelId) -> Result<()> {
        self.ok(Request::DestroyChannel { id })
    }

    /// Enable a mixer input slot.
    pub fn enable_mixer_input(&self, dev: ChannelId, slot: u32) -> Result<()> {
        self.ok(Request::EnableMixerInput { dev, slot })
    }

    /// Disable a mixer input slot.
    pub fn disable_mixer_input(&self, dev: ChannelId, slot: u32) -> Result<()> {
        self.ok(Request::DisableMixerInput { dev, slot })
    }

    /// See [`Context::bind`](crate::context::Context::bind).
    pub fn bind(&self, src: ChannelId, dst: ChannelId, slot: u32) -> Result<()> {
        self.ok(Request::Bind { src, dst, slot })
    }

    /// See [`Context::unbind`](crate::context::Context::unbind).
    pub fn unbind(&self, src: ChannelId, dst: ChannelId) -> Result<()> {
        self.ok(Request::Unbind { src, dst })
    }

    /// Snapshot of one channel.
    pub fn info(&self, id: ChannelId) -> Result<ChannelInfo> {
        match self.inner.call(&Request::Info { id }, None)?.response {
            Response::Info(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    /// Status of one channel.
    pub fn status(&self, id: ChannelId) -> Result<ChannelStatus> {
        Ok(self.info(id)?.status)
    }

    /// Every bind edge on the server.
    pub fn edges(&self) -> Result<Vec<BindEdge>> {
        match self.inner.call(&Request::Edges, None)?.response {
            Response::Edges(edges) => Ok(edges),
            other => Err(unexpected(other)),
        }
    }

    // ========================================================================
    // Buffer I/O
    // ========================================================================

    /// Change a channel's pull queue depth.
    pub fn set_queue_depth(&self, id: ChannelId, depth: usize) -> Result<()> {
        let depth = u32::try_from(depth)
            .map_err(|_| Error::InvalidArgument(format!("queue depth {} out of range", depth)))?;
        self.ok(Request::SetQueueDepth { id, depth })
    }

    /// Install an explicit pull consumer.
    pub fn start_get_media_buffer(&self, id: ChannelId) -> Result<()> {
        self.ok(Request::StartGetMediaBuffer { id })
    }

    /// Remove the explicit pull consumer.
    pub fn stop_get_media_buffer(&self, id: ChannelId) -> Result<()> {
        self.ok(Request::StopGetMediaBuffer { id })
    }

    /// Take the next output buffer. `None` blocks; `Ok(None)` on timeout.
    pub fn get_media_buffer(
        &self,
        id: ChannelId,
        timeout: Option<Duration>,
    ) -> Result<Option<RemoteBuffer>> {
        let timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self.buffer(Request::GetMediaBuffer { id, timeout_ms })
    }

    /// Feed a server buffer into input `slot` of a channel.
    ///
    /// Ownership returns to the server; the buffer's current valid size and
    /// timestamp are applied.
    pub fn send_media_buffer(&self, id: ChannelId, slot: u32, buffer: RemoteBuffer) -> Result<()> {
        let info = buffer.info();
        let handle = buffer
            .into_handle()
            .ok_or_else(|| Error::InvalidArgument("buffer was already handed back".into()))?;
        self.ok(Request::SendMediaBuffer {
            id,
            slot,
            buffer: BufferRef::Handle(handle),
            info,
        })
    }

    /// Feed a locally allocated buffer into input `slot` of a channel.
    ///
    /// The server maps the buffer's memory; no bytes are copied.
    pub fn send_local_buffer(&self, id: ChannelId, slot: u32, buffer: &MediaBuffer) -> Result<()> {
        let request = Request::SendMediaBuffer {
            id,
            slot,
            buffer: BufferRef::Attached,
            info: buffer.info(),
        };
        self.inner.call(&request, Some(buffer.fd())).map(|_| ())
    }

    /// Allocate an untyped buffer on the server.
    pub fn create_buffer(&self, size: usize, hardware: bool) -> Result<RemoteBuffer> {
        self.required_buffer(Request::CreateBuffer {
            size: size as u64,
            hardware,
        })
    }

    /// Allocate an image buffer on the server.
    pub fn create_image_buffer(&self, info: ImageInfo, hardware: bool) -> Result<RemoteBuffer> {
        self.required_buffer(Request::CreateImageBuffer { info, hardware })
    }

    /// Allocate an audio buffer on the server.
    pub fn create_audio_buffer(&self, info: AudioInfo) -> Result<RemoteBuffer> {
        self.required_buffer(Request::CreateAudioBuffer { info })
    }

    /// Create a pool on the server.
    pub fn create_pool(&self, config: PoolConfig) -> Result<PoolId> {
        match self.inner.call(&Request::CreatePool { config }, None)?.response {
            Response::Pool(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Take a pool buffer; without `block`, `Ok(None)` when exhausted.
    pub fn get_pool_buffer(&self, pool: PoolId, block: bool) -> Result<Option<RemoteBuffer>> {
        self.buffer(Request::GetPoolBuffer { pool, block })
    }

    /// Destroy a pool.
    pub fn destroy_pool(&self, pool: PoolId) -> Result<()> {
        self.ok(Request::DestroyPool { pool })
    }

    // ========================================================================
    // Controls
    // ========================================================================

    /// Apply a runtime control.
    pub fn control(&self, id: ChannelId, control: StageControl) -> Result<()> {
        self.ok(Request::Control { id, control })
    }

    /// Start luma sampling on a capture channel.
    pub fn start_luma(&self, id: ChannelId) -> Result<()> {
        self.ok(Request::StartLuma { id })
    }

    /// Stop luma sampling.
    pub fn stop_luma(&self, id: ChannelId) -> Result<()> {
        self.ok(Request::StopLuma { id })
    }

    /// Mean luma inside `rect` of the latest frame.
    pub fn get_luma(&self, id: ChannelId, rect: Rect) -> Result<u8> {
        match self.inner.call(&Request::GetLuma { id, rect }, None)?.response {
            Response::Luma(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Receive the channel's output through `callback`.
    pub fn subscribe_output(&self, id: ChannelId, callback: RemoteOutputCallback) -> Result<()> {
        self.inner.outputs.lock().unwrap().insert(id, callback);
        let result = self.ok(Request::SubscribeOutput { id });
        if result.is_err() {
            self.inner.outputs.lock().unwrap().remove(&id);
        }
        result
    }

    /// Stop receiving the channel's output.
    pub fn unsubscribe_output(&self, id: ChannelId) -> Result<()> {
        let result = self.ok(Request::UnsubscribeOutput { id });
        self.inner.outputs.lock().unwrap().remove(&id);
        result
    }

    /// Receive the channel's events through `callback`.
    pub fn subscribe_events(&self, id: ChannelId, callback: EventCallback) -> Result<()> {
        self.inner.events.lock().unwrap().insert(id, callback);
        let result = self.ok(Request::SubscribeEvents { id });
        if result.is_err() {
            self.inner.events.lock().unwrap().remove(&id);
        }
        result
    }

    /// Stop receiving the channel's events.
    pub fn unsubscribe_events(&self, id: ChannelId) -> Result<()> {
        let result = self.ok(Request::UnsubscribeEvents { id });
        self.inner.events.lock().unwrap().remove(&id);
        result
    }

    /// Disconnect. Pending calls fail with `Disconnected`; the server
    /// releases everything this client held.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.inner.shutdown();
        if let Some(reader) = self.reader.take()
            && reader.thread().id() != thread::current().id()
            && reader.join().is_err()
        {
            warn!("client reader thread panicked");
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("closed", &self.is_closed())
            .field("pending", &self.inner.pending.lock().unwrap().len())
            .finish()
    }
}

fn unexpected(response: Response) -> Error {
    Error::Protocol(format!("unexpected response {:?}", response))
}

fn read_loop(stream: UnixStream, inner: Arc<ClientInner>) {
    loop {
        let frame = match read_frame(&stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                if !inner.closed.load(Ordering::Acquire) && !e.is_disconnect() {
                    warn!(error = %e, "client connection failed");
                }
                break;
            }
        };
        if let Err(e) = route(&inner, frame) {
            warn!(error = %e, "dropping connection");
            break;
        }
    }

    inner.shutdown();
    // Dropping the senders fails every waiting call.
    let pending = std::mem::take(&mut *inner.pending.lock().unwrap());
    if !pending.is_empty() {
        debug!(calls = pending.len(), "failing pending calls");
    }
}

fn route(inner: &Arc<ClientInner>, frame: Frame) -> Result<()> {
    match frame.header.kind {
        FrameKind::Response => {
            let response = Response::decode(&frame.payload)?;
            let waiter = inner.pending.lock().unwrap().remove(&frame.header.seq);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Reply {
                        response,
                        fds: frame.fds,
                    });
                }
                None => trace!(seq = frame.header.seq, "response without a caller"),
            }
        }
        FrameKind::Output => {
            let push = OutputPush::decode(&frame.payload)?;
            let callback = inner.outputs.lock().unwrap().get(&push.channel).cloned();
            match adopt(inner, push.handle, &push.info, frame.fds) {
                Ok(buffer) => match callback {
                    Some(callback) => callback(buffer),
                    None => trace!(channel = %push.channel, "output without a subscriber"),
                },
                Err(e) => warn!(channel = %push.channel, error = %e, "cannot map pushed buffer"),
            }
        }
        FrameKind::Event => {
            let push = EventPush::decode(&frame.payload)?;
            let callback = inner.events.lock().unwrap().get(&push.channel).cloned();
            if let Some(callback) = callback {
                callback(push.channel, &push.event);
            }
        }
        kind => {
            return Err(Error::Protocol(format!("unexpected {:?} frame from server", kind)));
        }
    }
    Ok(())
}
