//! RPC messages.
//!
//! Requests and responses are rkyv-serialized enums carried in
//! [frames](super::frame). The request's variant is its opcode; there is no
//! string dispatch.

use crate::buffer::BufferInfo;
use crate::channel::{BindEdge, ChannelConfig, ChannelId, ChannelInfo};
use crate::context::PoolId;
use crate::error::{Error, ErrorCode, Result};
use crate::event::ChannelEvent;
use crate::format::{AudioInfo, ImageInfo, Rect};
use crate::memory::PoolConfig;
use crate::stage::StageControl;
use rkyv::util::AlignedVec;

/// A buffer named in a `SendMediaBuffer` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum BufferRef {
    /// A buffer the server handed out earlier; ownership returns to it.
    Handle(u64),
    /// A buffer whose descriptor is attached to the request frame.
    Attached,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Store a channel's configuration.
    SetAttr {
        /// Channel.
        id: ChannelId,
        /// Configuration.
        config: ChannelConfig,
    },
    /// Read a channel's configuration.
    GetAttr {
        /// Channel.
        id: ChannelId,
    },
    /// READY -> OPEN.
    EnableChannel {
        /// Channel.
        id: ChannelId,
    },
    /// OPEN -> CLOSED.
    DisableChannel {
        /// Channel.
        id: ChannelId,
    },
    /// Any unbound status -> CLOSED.
    DestroyChannel {
        /// Channel.
        id: ChannelId,
    },
    /// Enable a mixer input slot.
    EnableMixerInput {
        /// Mixer device.
        dev: ChannelId,
        /// Input slot.
        slot: u32,
    },
    /// Disable a mixer input slot.
    DisableMixerInput {
        /// Mixer device.
        dev: ChannelId,
        /// Input slot.
        slot: u32,
    },
    /// Connect two channels.
    Bind {
        /// Source channel.
        src: ChannelId,
        /// Destination channel.
        dst: ChannelId,
        /// Destination input slot.
        slot: u32,
    },
    /// Disconnect two channels.
    Unbind {
        /// Source channel.
        src: ChannelId,
        /// Destination channel.
        dst: ChannelId,
    },
    /// Channel snapshot.
    Info {
        /// Channel.
        id: ChannelId,
    },
    /// Every bind edge.
    Edges,
    /// Change the pull queue depth.
    SetQueueDepth {
        /// Channel.
        id: ChannelId,
        /// New depth.
        depth: u32,
    },
    /// Install an explicit pull consumer.
    StartGetMediaBuffer {
        /// Channel.
        id: ChannelId,
    },
    /// Remove the explicit pull consumer.
    StopGetMediaBuffer {
        /// Channel.
        id: ChannelId,
    },
    /// Pop the next output buffer.
    GetMediaBuffer {
        /// Channel.
        id: ChannelId,
        /// `None` blocks, `Some(0)` polls.
        timeout_ms: Option<u64>,
    },
    /// Feed a buffer into a channel.
    SendMediaBuffer {
        /// Channel.
        id: ChannelId,
        /// Input slot.
        slot: u32,
        /// Which buffer.
        buffer: BufferRef,
        /// Metadata; `valid_size` and `timestamp_us` are applied.
        info: BufferInfo,
    },
    /// Allocate an untyped buffer.
    CreateBuffer {
        /// Bytes.
        size: u64,
        /// Hardware memory.
        hardware: bool,
    },
    /// Allocate an image buffer.
    CreateImageBuffer {
        /// Geometry.
        info: ImageInfo,
        /// Hardware memory.
        hardware: bool,
    },
    /// Allocate an audio buffer.
    CreateAudioBuffer {
        /// Format.
        info: AudioInfo,
    },
    /// Create a buffer pool.
    CreatePool {
        /// Parameters.
        config: PoolConfig,
    },
    /// Take a buffer from a pool.
    GetPoolBuffer {
        /// Pool.
        pool: PoolId,
        /// Wait for a free buffer.
        block: bool,
    },
    /// Destroy a pool.
    DestroyPool {
        /// Pool.
        pool: PoolId,
    },
    /// Apply a runtime control.
    Control {
        /// Channel.
        id: ChannelId,
        /// Control.
        control: StageControl,
    },
    /// Start luma sampling.
    StartLuma {
        /// Capture channel.
        id: ChannelId,
    },
    /// Stop luma sampling.
    StopLuma {
        /// Capture channel.
        id: ChannelId,
    },
    /// Mean luma of the latest frame.
    GetLuma {
        /// Capture channel.
        id: ChannelId,
        /// Window; empty for the whole frame.
        rect: Rect,
    },
    /// Receive the channel's output as `Output` frames.
    SubscribeOutput {
        /// Channel.
        id: ChannelId,
    },
    /// Stop receiving output.
    UnsubscribeOutput {
        /// Channel.
        id: ChannelId,
    },
    /// Receive the channel's events as `Event` frames.
    SubscribeEvents {
        /// Channel.
        id: ChannelId,
    },
    /// Stop receiving events.
    UnsubscribeEvents {
        /// Channel.
        id: ChannelId,
    },
    /// Give a buffer handle back. Sent as a notice.
    ReleaseBuffer {
        /// Handle from a `Buffer` response or `Output` push.
        handle: u64,
    },
}

/// Stable numeric identity of a request.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    SetAttr = 1,
    GetAttr = 2,
    EnableChannel = 3,
    DisableChannel = 4,
    DestroyChannel = 5,
    EnableMixerInput = 6,
    DisableMixerInput = 7,
    Bind = 16,
    Unbind = 17,
    Info = 18,
    Edges = 19,
    SetQueueDepth = 32,
    StartGetMediaBuffer = 33,
    StopGetMediaBuffer = 34,
    GetMediaBuffer = 35,
    SendMediaBuffer = 36,
    CreateBuffer = 48,
    CreateImageBuffer = 49,
    CreateAudioBuffer = 50,
    CreatePool = 51,
    GetPoolBuffer = 52,
    DestroyPool = 53,
    ReleaseBuffer = 54,
    Control = 64,
    StartLuma = 65,
    StopLuma = 66,
    GetLuma = 67,
    SubscribeOutput = 80,
    UnsubscribeOutput = 81,
    SubscribeEvents = 82,
    UnsubscribeEvents = 83,
}

impl Opcode {
    /// Name used in logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            Self::SetAttr => "set_attr",
            Self::GetAttr => "get_attr",
            Self::EnableChannel => "enable_channel",
            Self::DisableChannel => "disable_channel",
            Self::DestroyChannel => "destroy_channel",
            Self::EnableMixerInput => "enable_mixer_input",
            Self::DisableMixerInput => "disable_mixer_input",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
            Self::Info => "info",
            Self::Edges => "edges",
            Self::SetQueueDepth => "set_queue_depth",
            Self::StartGetMediaBuffer => "start_get_media_buffer",
            Self::StopGetMediaBuffer => "stop_get_media_buffer",
            Self::GetMediaBuffer => "get_media_buffer",
            Self::SendMediaBuffer => "send_media_buffer",
            Self::CreateBuffer => "create_buffer",
            Self::CreateImageBuffer => "create_image_buffer",
            Self::CreateAudioBuffer => "create_audio_buffer",
            Self::CreatePool => "create_pool",
            Self::GetPoolBuffer => "get_pool_buffer",
            Self::DestroyPool => "destroy_pool",
            Self::ReleaseBuffer => "release_buffer",
            Self::Control => "control",
            Self::StartLuma => "start_luma",
            Self::StopLuma => "stop_luma",
            Self::GetLuma => "get_luma",
            Self::SubscribeOutput => "subscribe_output",
            Self::UnsubscribeOutput => "unsubscribe_output",
            Self::SubscribeEvents => "subscribe_events",
            Self::UnsubscribeEvents => "unsubscribe_events",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u16)
    }
}

impl Request {
    /// Opcode of this request.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::SetAttr { .. } => Opcode::SetAttr,
            Self::GetAttr { .. } => Opcode::GetAttr,
            Self::EnableChannel { .. } => Opcode::EnableChannel,
            Self::DisableChannel { .. } => Opcode::DisableChannel,
            Self::DestroyChannel { .. } => Opcode::DestroyChannel,
            Self::EnableMixerInput { .. } => Opcode::EnableMixerInput,
            Self::DisableMixerInput { .. } => Opcode::DisableMixerInput,
            Self::Bind { .. } => Opcode::Bind,
            Self::Unbind { .. } => Opcode::Unbind,
            Self::Info { .. } => Opcode::Info,
            Self::Edges => Opcode::Edges,
            Self::SetQueueDepth { .. } => Opcode::SetQueueDepth,
            Self::StartGetMediaBuffer { .. } => Opcode::StartGetMediaBuffer,
            Self::StopGetMediaBuffer { .. } => Opcode::StopGetMediaBuffer,
            Self::GetMediaBuffer { .. } => Opcode::GetMediaBuffer,
            Self::SendMediaBuffer { .. } => Opcode::SendMediaBuffer,
            Self::CreateBuffer { .. } => Opcode::CreateBuffer,
            Self::CreateImageBuffer { .. } => Opcode::CreateImageBuffer,
            Self::CreateAudioBuffer { .. } => Opcode::CreateAudioBuffer,
            Self::CreatePool { .. } => Opcode::CreatePool,
            Self::GetPoolBuffer { .. } => Opcode::GetPoolBuffer,
            Self::DestroyPool { .. } => Opcode::DestroyPool,
            Self::Control { .. } => Opcode::Control,
            Self::StartLuma { .. } => Opcode::StartLuma,
            Self::StopLuma { .. } => Opcode::StopLuma,
            Self::GetLuma { .. } => Opcode::GetLuma,
            Self::SubscribeOutput { .. } => Opcode::SubscribeOutput,
            Self::UnsubscribeOutput { .. } => Opcode::UnsubscribeOutput,
            Self::SubscribeEvents { .. } => Opcode::SubscribeEvents,
            Self::UnsubscribeEvents { .. } => Opcode::UnsubscribeEvents,
            Self::ReleaseBuffer { .. } => Opcode::ReleaseBuffer,
        }
    }

    /// The channel this request is about, if any.
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Self::SetAttr { id, .. }
            | Self::GetAttr { id }
            | Self::EnableChannel { id }
            | Self::DisableChannel { id }
            | Self::DestroyChannel { id }
            | Self::Info { id }
            | Self::SetQueueDepth { id, .. }
            | Self::StartGetMediaBuffer { id }
            | Self::StopGetMediaBuffer { id }
            | Self::GetMediaBuffer { id, .. }
            | Self::SendMediaBuffer { id, .. }
            | Self::Control { id, .. }
            | Self::StartLuma { id }
            | Self::StopLuma { id }
            | Self::GetLuma { id, .. }
            | Self::SubscribeOutput { id }
            | Self::UnsubscribeOutput { id }
            | Self::SubscribeEvents { id }
            | Self::UnsubscribeEvents { id } => Some(*id),
            Self::EnableMixerInput { dev, .. } | Self::DisableMixerInput { dev, .. } => Some(*dev),
            Self::Bind { src, .. } | Self::Unbind { src, .. } => Some(*src),
            _ => None,
        }
    }
}

/// Server to client, answering one request.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum Response {
    /// Success without a value.
    Ok,
    /// Failure.
    Error {
        /// [`ErrorCode`] value.
        code: i32,
        /// Code namespaced by the request's module kind.
        namespaced: i32,
        /// Description.
        message: String,
    },
    /// A channel configuration.
    Attr(ChannelConfig),
    /// A channel snapshot.
    Info(ChannelInfo),
    /// The bind edges.
    Edges(Vec<BindEdge>),
    /// A buffer; its descriptor is attached to the frame.
    Buffer {
        /// Handle to pass back in `ReleaseBuffer` or `SendMediaBuffer`.
        handle: u64,
        /// Metadata.
        info: BufferInfo,
    },
    /// Timed out or pool exhausted.
    NoBuffer,
    /// A new pool.
    Pool(PoolId),
    /// A luma value.
    Luma(u8),
}

impl Response {
    /// Error response for `err`, namespaced by `request`'s channel kind.
    pub fn from_error(err: &Error, request: Option<ChannelId>) -> Self {
        let code = err.code();
        Self::Error {
            code: code.as_i32(),
            namespaced: request.map_or(code.as_i32(), |id| code.namespaced(id.kind)),
            message: err.to_string(),
        }
    }

    /// Turn an `Error` response back into the error.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Error { code, message, .. } => Err(ErrorCode::from_i32(code)
                .unwrap_or(ErrorCode::Protocol)
                .into_error(message)),
            other => Ok(other),
        }
    }
}

/// Payload of an `Output` frame.
#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct OutputPush {
    /// Producing channel.
    pub channel: ChannelId,
    /// Handle to release.
    pub handle: u64,
    /// Metadata.
    pub info: BufferInfo,
}

/// Payload of an `Event` frame.
#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct EventPush {
    /// Channel that raised the event.
    pub channel: ChannelId,
    /// The event.
    pub event: ChannelEvent,
}

macro_rules! wire_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                /// Serialize for the wire.
                pub fn encode(&self) -> Result<AlignedVec> {
                    rkyv::to_bytes::<rkyv::rancor::Error>(self)
                        .map_err(|e| Error::Protocol(format!("encode failed: {}", e)))
                }

                /// Validate and deserialize a payload.
                pub fn decode(bytes: &[u8]) -> Result<Self> {
                    rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
                        .map_err(|e| Error::Protocol(format!("decode failed: {}", e)))
                }
            }
        )*
    };
}

wire_codec!(Request, Response, OutputPush, EventPush);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ModuleKind;

    #[test]
    fn test_opcodes_are_distinct() {
        let id = ChannelId::new(ModuleKind::Vi, 0);
        let requests = [
            Request::EnableChannel { id },
            Request::DisableChannel { id },
            Request::Bind {
                src: id,
                dst: ChannelId::new(ModuleKind::Venc, 0),
                slot: 0,
            },
            Request::Edges,
            Request::ReleaseBuffer { handle: 1 },
        ];
        let mut codes: Vec<u16> = requests.iter().map(|r| r.opcode() as u16).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), requests.len());
        assert_eq!(Opcode::Bind.name(), "bind");
    }

    #[test]
    fn test_request_wire_form() {
        let request = Request::Control {
            id: ChannelId::new(ModuleKind::Venc, 2),
            control: StageControl::SetFrameRate(25),
        };
        let bytes = request.encode().unwrap();
        assert_eq!(Request::decode(&bytes).unwrap(), request);
        assert!(Request::decode(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_error_response_round_trip() {
        let err = Error::Busy("taken".into());
        let id = ChannelId::new(ModuleKind::Venc, 0);
        let response = Response::from_error(&err, Some(id));
        match &response {
            Response::Error { code, namespaced, .. } => {
                assert_eq!(*code, -4);
                assert_eq!(*namespaced, ErrorCode::Busy.namespaced(ModuleKind::Venc));
            }
            other => panic!("unexpected {:?}", other),
        }
        let back = response.into_result().unwrap_err();
        assert_eq!(back.code(), ErrorCode::Busy);
    }
}
