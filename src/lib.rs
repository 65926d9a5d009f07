//! # mediaplane
//!
//! Control plane for an embedded multimedia pipeline.
//!
//! Media modules (capture, coding, scaling, compositing, muxing, playback)
//! are exposed as *channels*: numbered slots per module kind that are
//! configured, enabled, bound into a processing graph, fed with buffers and
//! drained of output. A [`Context`](context::Context) owns the channel
//! tables, the bind graph, buffer allocation and pools; an
//! [`RpcServer`](rpc::RpcServer) exposes the same API to other processes
//! with zero-copy buffer handoff.
//!
//! ## Features
//!
//! - **Channel lifecycle**: CLOSED → READY → OPEN → BIND with per-kind tables
//! - **Bind graph**: refcounted edges, validated before anything is mutated
//! - **Delivery**: callbacks or bounded pull queues with drop-oldest backpressure
//! - **Buffer pools**: pre-allocated memfd-backed buffers, recycled on release
//! - **Local RPC**: rkyv frames over a Unix socket, descriptors via `SCM_RIGHTS`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mediaplane::prelude::*;
//! use mediaplane::stage::loopback::LoopbackBackend;
//!
//! let ctx = Context::new(ContextConfig::default(), Arc::new(LoopbackBackend::new()))?;
//! let vi = ChannelId::new(ModuleKind::Vi, 0);
//! let venc = ChannelId::new(ModuleKind::Venc, 0);
//!
//! ctx.set_attr(vi, capture_config)?;
//! ctx.enable_channel(vi)?;
//! ctx.set_attr(venc, encode_config)?;
//! ctx.enable_channel(venc)?;
//! ctx.bind(vi, venc, 0)?;
//!
//! while let Some(frame) = ctx.get_media_buffer(venc, None)? {
//!     sink.write_all(frame.data())?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod channel;
pub mod config;
pub mod context;
pub mod delivery;
pub mod error;
pub mod event;
pub mod format;
pub mod memory;
pub mod observability;
pub mod rpc;
pub mod stage;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{BufferAllocator, BufferInfo, BufferKind, MediaBuffer};
    pub use crate::channel::{
        BindEdge, ChannelConfig, ChannelId, ChannelInfo, ChannelStatus, ModuleKind,
    };
    pub use crate::config::{ContextConfig, ServerConfig};
    pub use crate::context::{Context, PoolId};
    pub use crate::delivery::{DeliveryMode, OutputCallback, OutputCallbackEx};
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::event::{ChannelEvent, EventCallback};
    pub use crate::format::{ImageInfo, PixelFormat, Rect};
    pub use crate::memory::{BufferPool, MemorySegment, MemoryType, PoolConfig};
    pub use crate::rpc::{RemoteBuffer, RpcClient, RpcServer, ServerHandle};
    pub use crate::stage::{StageControl, StageFactory};
    pub use std::sync::Arc;
}

pub use error::{Error, ErrorCode, Result};
