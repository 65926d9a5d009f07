//! Request execution on the server.

use super::protocol::{BufferRef, Request, Response};
use super::session::Session;
use crate::buffer::MediaBuffer;
use crate::channel::ChannelId;
use crate::context::{Context, PoolId};
use crate::error::{Error, Result};
use crate::memory::{CpuSegment, MemorySegment, MemoryType};
use crate::observability::record_pool_available;
use rustix::fd::OwnedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest single wait of a blocking request before the worker checks
/// whether its client is still there.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// A response plus the segment whose descriptor goes with it.
pub struct Reply {
    /// Response payload.
    pub response: Response,
    /// Segment to attach, for `Buffer` responses.
    pub segment: Option<Arc<dyn MemorySegment>>,
}

impl Reply {
    fn plain(response: Response) -> Self {
        Self {
            response,
            segment: None,
        }
    }
}

/// Execute `request` for `session` against `ctx`.
pub fn dispatch(
    ctx: &Context,
    session: &Arc<Session>,
    request: Request,
    fds: Vec<OwnedFd>,
) -> Reply {
    let channel = request.channel();
    match execute(ctx, session, request, fds) {
        Ok(reply) => reply,
        Err(e) => Reply::plain(Response::from_error(&e, channel)),
    }
}

fn execute(
    ctx: &Context,
    session: &Arc<Session>,
    request: Request,
    fds: Vec<OwnedFd>,
) -> Result<Reply> {
    let response = match request {
        Request::SetAttr { id, config } => ctx.set_attr(id, config).map(|_| Response::Ok)?,
        Request::GetAttr { id } => Response::Attr(ctx.get_attr(id)?),
        Request::EnableChannel { id } => ctx.enable_channel(id).map(|_| Response::Ok)?,
        Request::DisableChannel { id } => ctx.disable_channel(id).map(|_| Response::Ok)?,
        Request::DestroyChannel { id } => ctx.destroy_channel(id).map(|_| Response::Ok)?,
        Request::EnableMixerInput { dev, slot } => {
            ctx.enable_mixer_input(dev, slot).map(|_| Response::Ok)?
        }
        Request::DisableMixerInput { dev, slot } => {
            ctx.disable_mixer_input(dev, slot).map(|_| Response::Ok)?
        }
        Request::Bind { src, dst, slot } => ctx.bind(src, dst, slot).map(|_| Response::Ok)?,
        Request::Unbind { src, dst } => ctx.unbind(src, dst).map(|_| Response::Ok)?,
        Request::Info { id } => Response::Info(ctx.info(id)?),
        Request::Edges => Response::Edges(ctx.edges()),
        Request::SetQueueDepth { id, depth } => {
            ctx.set_queue_depth(id, depth as usize).map(|_| Response::Ok)?
        }
        Request::StartGetMediaBuffer { id } => {
            ctx.start_get_media_buffer(id).map(|_| Response::Ok)?
        }
        Request::StopGetMediaBuffer { id } => {
            ctx.stop_get_media_buffer(id).map(|_| Response::Ok)?
        }
        Request::GetMediaBuffer { id, timeout_ms } => {
            let buffer = pull(ctx, session, id, timeout_ms.map(Duration::from_millis))?;
            return hand_out(session, buffer);
        }
        Request::SendMediaBuffer {
            id,
            slot,
            buffer,
            info,
        } => {
            let buffer = match buffer {
                BufferRef::Handle(handle) => {
                    let mut buffer = session.take_handle(handle).ok_or_else(|| {
                        Error::InvalidArgument(format!("unknown buffer handle {}", handle))
                    })?;
                    if info.valid_size > buffer.size() as u64 {
                        return Err(Error::InvalidArgument(format!(
                            "valid size {} exceeds buffer size {}",
                            info.valid_size,
                            buffer.size()
                        )));
                    }
                    buffer.set_valid_size(info.valid_size as usize);
                    buffer.set_timestamp_us(info.timestamp_us);
                    buffer
                }
                BufferRef::Attached => attached_buffer(fds, &info)?,
            };
            ctx.send_media_buffer(id, slot, buffer).map(|_| Response::Ok)?
        }
        Request::CreateBuffer { size, hardware } => {
            let buffer = ctx.create_buffer(size as usize, hardware)?;
            return hand_out(session, Some(buffer));
        }
        Request::CreateImageBuffer { info, hardware } => {
            let buffer = ctx.create_image_buffer(info, hardware)?;
            return hand_out(session, Some(buffer));
        }
        Request::CreateAudioBuffer { info } => {
            let buffer = ctx.create_audio_buffer(info)?;
            return hand_out(session, Some(buffer));
        }
        Request::CreatePool { config } => Response::Pool(ctx.create_pool(config)?),
        Request::GetPoolBuffer { pool, block } => {
            let buffer = pool_buffer(ctx, session, pool, block)?;
            if let Ok(stats) = ctx.pool_stats(pool) {
                record_pool_available(stats.available);
            }
            return hand_out(session, buffer);
        }
        Request::DestroyPool { pool } => ctx.destroy_pool(pool).map(|_| Response::Ok)?,
        Request::Control { id, control } => ctx.control(id, control).map(|_| Response::Ok)?,
        Request::StartLuma { id } => ctx.start_luma(id).map(|_| Response::Ok)?,
        Request::StopLuma { id } => ctx.stop_luma(id).map(|_| Response::Ok)?,
        Request::GetLuma { id, rect } => Response::Luma(ctx.get_luma(id, rect)?),
        Request::SubscribeOutput { id } => session.subscribe_output(ctx, id).map(|_| Response::Ok)?,
        Request::UnsubscribeOutput { id } => {
            session.unsubscribe_output(ctx, id).map(|_| Response::Ok)?
        }
        Request::SubscribeEvents { id } => session.subscribe_events(ctx, id).map(|_| Response::Ok)?,
        Request::UnsubscribeEvents { id } => {
            session.unsubscribe_events(ctx, id).map(|_| Response::Ok)?
        }
        Request::ReleaseBuffer { handle } => {
            // Unknown handles are ignored: the buffer may already have been
            // released by a session cleanup racing the notice.
            session.take_handle(handle);
            Response::Ok
        }
    };
    Ok(Reply::plain(response))
}

/// Park a buffer in the session and describe it to the client.
fn hand_out(session: &Session, buffer: Option<MediaBuffer>) -> Result<Reply> {
    let Some(buffer) = buffer else {
        return Ok(Reply::plain(Response::NoBuffer));
    };
    let info = buffer.info();
    let segment = Arc::clone(buffer.segment());
    let handle = session.insert_handle(buffer)?;
    Ok(Reply {
        response: Response::Buffer { handle, info },
        segment: Some(segment),
    })
}

/// Map a buffer the client attached to its request.
fn attached_buffer(fds: Vec<OwnedFd>, info: &crate::buffer::BufferInfo) -> Result<MediaBuffer> {
    let fd = fds
        .into_iter()
        .next()
        .ok_or_else(|| Error::Protocol("request names an attached buffer but carries no descriptor".into()))?;
    let segment = CpuSegment::from_fd(fd, MemoryType::for_request(info.hardware))?;
    MediaBuffer::from_info(Arc::new(segment), info)
}

/// Pop from the channel's pull queue in slices, giving up early if the
/// client disconnects.
fn pull(
    ctx: &Context,
    session: &Session,
    id: ChannelId,
    timeout: Option<Duration>,
) -> Result<Option<MediaBuffer>> {
    let queue = ctx.pull_queue(id)?;
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let slice = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(WAIT_SLICE),
            None => WAIT_SLICE,
        };
        if let Some(buffer) = queue.pop(Some(slice))? {
            return Ok(Some(buffer));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) || session.peer_gone() {
            return Ok(None);
        }
    }
}

/// Take a pool buffer, waiting in slices when `block` is set.
fn pool_buffer(
    ctx: &Context,
    session: &Session,
    pool: PoolId,
    block: bool,
) -> Result<Option<MediaBuffer>> {
    if !block {
        return ctx.get_pool_buffer(pool, false);
    }
    loop {
        if let Some(buffer) = ctx.get_pool_buffer_timeout(pool, WAIT_SLICE)? {
            return Ok(Some(buffer));
        }
        if session.peer_gone() {
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, DecodeConfig, ModuleKind};
    use crate::config::ContextConfig;
    use crate::error::ErrorCode;
    use crate::format::{CodecType, PixelFormat};
    use crate::stage::loopback::LoopbackBackend;
    use std::os::unix::net::UnixStream;

    fn setup() -> (Context, Arc<Session>, UnixStream) {
        let ctx = Context::new(ContextConfig::default(), Arc::new(LoopbackBackend::new())).unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        (ctx, Arc::new(Session::new(1, a)), b)
    }

    fn decode_config() -> ChannelConfig {
        ChannelConfig::Decode(DecodeConfig {
            codec: CodecType::H264,
            max_width: 64,
            max_height: 64,
            output_format: PixelFormat::Nv12,
        })
    }

    #[test]
    fn test_error_carries_code() {
        let (ctx, session, _peer) = setup();
        let id = ChannelId::new(ModuleKind::Vdec, 0);
        let reply = dispatch(&ctx, &session, Request::EnableChannel { id }, Vec::new());
        match reply.response {
            Response::Error { code, namespaced, .. } => {
                assert_eq!(code, ErrorCode::NotReady.as_i32());
                assert_eq!(namespaced, ErrorCode::NotReady.namespaced(ModuleKind::Vdec));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_buffer_handle_lifecycle() {
        let (ctx, session, _peer) = setup();
        let reply = dispatch(
            &ctx,
            &session,
            Request::CreateBuffer {
                size: 256,
                hardware: false,
            },
            Vec::new(),
        );
        let handle = match reply.response {
            Response::Buffer { handle, info } => {
                assert_eq!(info.size, 256);
                handle
            }
            other => panic!("unexpected {:?}", other),
        };
        assert!(reply.segment.is_some());
        drop(reply.segment);
        assert_eq!(ctx.allocator().live(), 1);

        dispatch(&ctx, &session, Request::ReleaseBuffer { handle }, Vec::new());
        assert_eq!(session.outstanding(), 0);
        assert_eq!(ctx.allocator().live(), 0);
    }

    #[test]
    fn test_send_by_handle_checks_valid_size() {
        let (ctx, session, _peer) = setup();
        let id = ChannelId::new(ModuleKind::Vdec, 0);
        ctx.set_attr(id, decode_config()).unwrap();
        ctx.enable_channel(id).unwrap();

        let handle = session
            .insert_handle(ctx.create_buffer(64, false).unwrap())
            .unwrap();
        let mut info = crate::buffer::BufferInfo {
            size: 64,
            valid_size: 65,
            timestamp_us: 7,
            origin: None,
            kind: crate::buffer::BufferKind::Raw,
            hardware: false,
        };
        let reply = dispatch(
            &ctx,
            &session,
            Request::SendMediaBuffer {
                id,
                slot: 0,
                buffer: BufferRef::Handle(handle),
                info,
            },
            Vec::new(),
        );
        assert!(matches!(reply.response, Response::Error { code: -1, .. }));

        let handle = session
            .insert_handle(ctx.create_buffer(64, false).unwrap())
            .unwrap();
        info.valid_size = 10;
        let reply = dispatch(
            &ctx,
            &session,
            Request::SendMediaBuffer {
                id,
                slot: 0,
                buffer: BufferRef::Handle(handle),
                info,
            },
            Vec::new(),
        );
        assert_eq!(reply.response, Response::Ok);
        let out = ctx.get_media_buffer(id, Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(out.valid_size(), 10);
        assert_eq!(out.timestamp_us(), 7);
    }

    #[test]
    fn test_polling_pull_returns_no_buffer() {
        let (ctx, session, _peer) = setup();
        let id = ChannelId::new(ModuleKind::Vdec, 0);
        ctx.set_attr(id, decode_config()).unwrap();
        ctx.enable_channel(id).unwrap();
        let reply = dispatch(
            &ctx,
            &session,
            Request::GetMediaBuffer {
                id,
                timeout_ms: Some(0),
            },
            Vec::new(),
        );
        assert_eq!(reply.response, Response::NoBuffer);
    }

    #[test]
    fn test_blocking_pull_gives_up_when_peer_leaves() {
        let (ctx, session, peer) = setup();
        let id = ChannelId::new(ModuleKind::Vdec, 0);
        ctx.set_attr(id, decode_config()).unwrap();
        ctx.enable_channel(id).unwrap();
        drop(peer);
        let reply = dispatch(
            &ctx,
            &session,
            Request::GetMediaBuffer {
                id,
                timeout_ms: None,
            },
            Vec::new(),
        );
        assert_eq!(reply.response, Response::NoBuffer);
    }
}
