//! Integration tests for the local RPC server and client.
//!
//! These tests verify that:
//! - Remote calls change state exactly like local calls and fail with the same codes
//! - Buffers cross the socket by descriptor and are released exactly once
//! - Subscriptions end with the channel and with the connection

use mediaplane::buffer::{BufferAllocator, MediaBuffer};
use mediaplane::channel::{ChannelConfig, ChannelId, FilterConfig, ModuleKind};
use mediaplane::config::{ContextConfig, ServerConfig};
use mediaplane::context::Context;
use mediaplane::error::{ErrorCode, Result};
use mediaplane::event::ChannelEvent;
use mediaplane::format::{ImageInfo, PixelFormat, Rect, Rotation};
use mediaplane::memory::PoolConfig;
use mediaplane::rpc::{RemoteBuffer, RpcClient, RpcServer, ServerHandle};
use mediaplane::stage::loopback::LoopbackBackend;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Fixture {
    ctx: Arc<Context>,
    backend: LoopbackBackend,
    server: ServerHandle,
    _dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let backend = LoopbackBackend::new();
        let ctx = Arc::new(
            Context::new(ContextConfig::default(), Arc::new(backend.clone())).unwrap(),
        );
        let config = ServerConfig::new(dir.path().join("mediaplane.sock"));
        let server = RpcServer::spawn(Arc::clone(&ctx), config).unwrap();
        Self {
            ctx,
            backend,
            server,
            _dir: dir,
        }
    }

    fn client(&self) -> RpcClient {
        RpcClient::connect(self.server.path()).unwrap()
    }

    fn frame(&self, seq: u64, fill: u8) -> MediaBuffer {
        let mut buffer = self.ctx.create_buffer(256, false).unwrap();
        buffer.set_timestamp_us(seq);
        buffer.data_mut().fill(fill);
        buffer
    }
}

fn filter() -> ChannelConfig {
    let image = ImageInfo::new(32, 16, PixelFormat::Nv12);
    ChannelConfig::Filter(FilterConfig {
        input: image,
        output: image,
        crop: None,
        rotation: Rotation::R0,
    })
}

fn rga(index: u32) -> ChannelId {
    ChannelId::new(ModuleKind::Rga, index)
}

/// Poll `cond` until it holds or two seconds pass.
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ============================================================================
// Parity with local calls
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    SetAttr(u32),
    Enable(u32),
    Disable(u32),
    Destroy(u32),
    Bind(u32, u32),
    Unbind(u32, u32),
    GetAttr(u32),
    BindOutOfRange(u32),
}

const SCRIPT: &[Op] = &[
    Op::Enable(0),
    Op::SetAttr(0),
    Op::SetAttr(0),
    Op::Enable(0),
    Op::Enable(0),
    Op::Bind(0, 1),
    Op::SetAttr(1),
    Op::Enable(1),
    Op::Bind(0, 1),
    Op::Bind(0, 1),
    Op::Bind(0, 0),
    Op::Disable(0),
    Op::Destroy(1),
    Op::Unbind(1, 0),
    Op::BindOutOfRange(0),
    Op::Unbind(0, 1),
    Op::Destroy(1),
    Op::GetAttr(1),
    Op::Disable(0),
    Op::Disable(0),
    Op::Destroy(0),
];

fn apply_local(ctx: &Context, op: Op) -> Result<()> {
    match op {
        Op::SetAttr(i) => ctx.set_attr(rga(i), filter()),
        Op::Enable(i) => ctx.enable_channel(rga(i)),
        Op::Disable(i) => ctx.disable_channel(rga(i)),
        Op::Destroy(i) => ctx.destroy_channel(rga(i)),
        Op::Bind(a, b) => ctx.bind(rga(a), rga(b), 0),
        Op::Unbind(a, b) => ctx.unbind(rga(a), rga(b)),
        Op::GetAttr(i) => ctx.get_attr(rga(i)).map(|_| ()),
        Op::BindOutOfRange(i) => ctx.bind(rga(i), ChannelId::new(ModuleKind::Vo, 99), 0),
    }
}

fn apply_remote(client: &RpcClient, op: Op) -> Result<()> {
    match op {
        Op::SetAttr(i) => client.set_attr(rga(i), filter()),
        Op::Enable(i) => client.enable_channel(rga(i)),
        Op::Disable(i) => client.disable_channel(rga(i)),
        Op::Destroy(i) => client.destroy_channel(rga(i)),
        Op::Bind(a, b) => client.bind(rga(a), rga(b), 0),
        Op::Unbind(a, b) => client.unbind(rga(a), rga(b)),
        Op::GetAttr(i) => client.get_attr(rga(i)).map(|_| ()),
        Op::BindOutOfRange(i) => client.bind(rga(i), ChannelId::new(ModuleKind::Vo, 99), 0),
    }
}

/// The same script run locally and remotely gives the same codes and state.
#[test]
fn test_remote_matches_local() {
    let fixture = Fixture::new();
    let client = fixture.client();
    let local = Context::new(ContextConfig::default(), Arc::new(LoopbackBackend::new())).unwrap();

    for (step, &op) in SCRIPT.iter().enumerate() {
        let expected = apply_local(&local, op).map_err(|e| e.code());
        let actual = apply_remote(&client, op).map_err(|e| e.code());
        assert_eq!(actual, expected, "step {} {:?}", step, op);

        for i in 0..2 {
            let want = local.info(rga(i)).unwrap();
            let got = client.info(rga(i)).unwrap();
            assert_eq!(got.status, want.status, "step {} {:?}", step, op);
            assert_eq!(got.bind_ref_in, want.bind_ref_in);
            assert_eq!(got.bind_ref_out, want.bind_ref_out);
        }
        assert_eq!(client.edges().unwrap(), local.edges());
    }
}

/// Remote errors keep their code and the attribute survives a round trip.
#[test]
fn test_remote_attr_round_trip() {
    let fixture = Fixture::new();
    let client = fixture.client();

    let err = client.get_attr(rga(2)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotReady);
    client.set_attr(rga(2), filter()).unwrap();
    assert_eq!(client.get_attr(rga(2)).unwrap(), filter());
    assert_eq!(fixture.ctx.get_attr(rga(2)).unwrap(), filter());
}

/// Oversized geometry is rejected and the session keeps serving.
#[test]
fn test_oversized_image_rejected_remotely() {
    let fixture = Fixture::new();
    let client = fixture.client();
    let huge = ImageInfo::new(u32::MAX, u32::MAX, PixelFormat::Rgba8888);

    let err = client.create_image_buffer(huge, false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    let err = client.create_pool(PoolConfig::image(huge, 2)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    client.set_attr(rga(3), filter()).unwrap();
    assert_eq!(fixture.server.session_count(), 1);
    assert_eq!(fixture.ctx.allocator().live(), 0);
}

// ============================================================================
// Buffer handoff
// ============================================================================

/// A pulled buffer maps the server's memory and is released when dropped.
#[test]
fn test_remote_pull_shares_memory() {
    let fixture = Fixture::new();
    let client = fixture.client();
    let id = rga(0);
    client.set_attr(id, filter()).unwrap();
    client.enable_channel(id).unwrap();
    client.start_get_media_buffer(id).unwrap();

    assert!(client.get_media_buffer(id, Some(Duration::ZERO)).unwrap().is_none());
    fixture.backend.emit(id, fixture.frame(11, 0x5a)).unwrap();

    let buffer = client
        .get_media_buffer(id, Some(Duration::from_secs(1)))
        .unwrap()
        .unwrap();
    assert_eq!(buffer.timestamp_us(), 11);
    assert_eq!(buffer.valid_size(), 256);
    assert!(buffer.data().iter().all(|&b| b == 0x5a));
    assert_eq!(buffer.origin(), Some(id));
    assert_eq!(fixture.ctx.allocator().live(), 1);

    drop(buffer);
    assert!(wait_for(|| fixture.ctx.allocator().live() == 0));
}

/// A server buffer filled by the client flows into a channel by handle.
#[test]
fn test_send_buffer_by_handle() {
    let fixture = Fixture::new();
    let client = fixture.client();
    let id = rga(1);
    client.set_attr(id, filter()).unwrap();
    client.enable_channel(id).unwrap();
    fixture.ctx.start_get_media_buffer(id).unwrap();

    let mut buffer: RemoteBuffer = client.create_buffer(128, false).unwrap();
    buffer.data_mut()[..4].copy_from_slice(b"mpln");
    buffer.set_valid_size(4);
    buffer.set_timestamp_us(99);
    client.send_media_buffer(id, 0, buffer).unwrap();

    let output = fixture
        .ctx
        .get_media_buffer(id, Some(Duration::ZERO))
        .unwrap()
        .unwrap();
    assert_eq!(output.data(), b"mpln");
    assert_eq!(output.timestamp_us(), 99);
    drop(output);
    assert_eq!(fixture.ctx.allocator().live(), 0);
}

/// A client-side allocation is mapped by the server without copying.
#[test]
fn test_send_local_buffer() {
    let fixture = Fixture::new();
    let client = fixture.client();
    let id = rga(2);
    client.set_attr(id, filter()).unwrap();
    client.enable_channel(id).unwrap();
    fixture.ctx.start_get_media_buffer(id).unwrap();

    let allocator = BufferAllocator::new();
    let mut local = allocator.create_buffer(64, false).unwrap();
    local.data_mut().fill(0x33);
    client.send_local_buffer(id, 0, &local).unwrap();

    let output = fixture
        .ctx
        .get_media_buffer(id, Some(Duration::ZERO))
        .unwrap()
        .unwrap();
    assert_eq!(output.size(), 64);
    local.data_mut()[0] = 0x44;
    assert_eq!(output.data()[0], 0x44);
    assert_eq!(output.data()[1], 0x33);
}

/// Disconnecting releases every buffer the client still held.
#[test]
fn test_disconnect_releases_handles() {
    let fixture = Fixture::new();
    let client = fixture.client();
    let held: Vec<RemoteBuffer> = (0..3)
        .map(|_| client.create_buffer(512, false).unwrap())
        .collect();
    assert_eq!(fixture.ctx.allocator().live(), 3);
    assert!(wait_for(|| fixture.server.session_count() == 1));

    client.close();
    assert!(wait_for(|| fixture.ctx.allocator().live() == 0));
    assert!(wait_for(|| fixture.server.session_count() == 0));
    drop(held);
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Pushed outputs arrive until the channel is disabled, then stop for good.
#[test]
fn test_disable_ends_output_subscription() {
    let fixture = Fixture::new();
    let client = fixture.client();
    let id = rga(0);
    client.set_attr(id, filter()).unwrap();
    client.enable_channel(id).unwrap();

    let (tx, rx) = mpsc::channel();
    client
        .subscribe_output(
            id,
            Arc::new(move |buffer: RemoteBuffer| {
                let _ = tx.send(buffer.timestamp_us());
            }),
        )
        .unwrap();

    fixture.backend.emit(id, fixture.frame(1, 0)).unwrap();
    fixture.backend.emit(id, fixture.frame(2, 0)).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    assert!(wait_for(|| fixture.ctx.allocator().live() == 0));
    assert_eq!(fixture.server.output_subscriptions(), 1);

    client.disable_channel(id).unwrap();
    assert_eq!(fixture.server.output_subscriptions(), 0);

    // Disable clears the configuration, so the channel is set up again.
    client.set_attr(id, filter()).unwrap();
    client.enable_channel(id).unwrap();
    fixture.backend.emit(id, fixture.frame(3, 0)).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    // The re-enabled channel queues its output locally again.
    let local = fixture.ctx.get_media_buffer(id, Some(Duration::ZERO)).unwrap();
    assert_eq!(local.map(|b| b.timestamp_us()), Some(3));
}

/// A channel consumed by the application refuses a remote subscriber.
#[test]
fn test_subscribe_conflicts_with_explicit_pull() {
    let fixture = Fixture::new();
    let client = fixture.client();
    let id = rga(4);
    fixture.ctx.set_attr(id, filter()).unwrap();
    fixture.ctx.enable_channel(id).unwrap();
    fixture.ctx.start_get_media_buffer(id).unwrap();

    let err = client.subscribe_output(id, Arc::new(|_buffer: RemoteBuffer| {})).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Busy);
}

/// Events raised by a stage reach the subscribed client.
#[test]
fn test_event_subscription() {
    let fixture = Fixture::new();
    let client = fixture.client();
    let id = rga(0);
    client.set_attr(id, filter()).unwrap();
    client.enable_channel(id).unwrap();

    let (tx, rx) = mpsc::channel();
    client
        .subscribe_events(
            id,
            Arc::new(move |channel: ChannelId, event: &ChannelEvent| {
                let _ = tx.send((channel, event.clone()));
            }),
        )
        .unwrap();

    let event = ChannelEvent::MotionDetected {
        region: Rect::new(0, 0, 8, 8),
    };
    fixture.backend.emit_event(id, event.clone()).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), (id, event));

    client.unsubscribe_events(id).unwrap();
    fixture.backend.emit_event(id, ChannelEvent::EndOfStream).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

/// Shutting the server down disconnects clients; their calls fail.
#[test]
fn test_server_shutdown_disconnects() {
    let Fixture {
        ctx,
        server,
        _dir,
        ..
    } = Fixture::new();
    let client = RpcClient::connect(server.path()).unwrap();
    client.set_attr(rga(0), filter()).unwrap();

    server.shutdown();
    assert!(wait_for(|| client.is_closed()));
    let err = client.enable_channel(rga(0)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Disconnected);
    assert_eq!(ctx.status(rga(0)).unwrap(), mediaplane::channel::ChannelStatus::Ready);
}
