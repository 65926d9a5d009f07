//! Local RPC: the [`Context`](crate::context::Context) API over a Unix socket.
//!
//! One connection carries tagged [frames](frame): requests and notices from
//! the client, responses and pushed outputs and events from the server.
//! Buffers never cross the socket by value; their memfd descriptors travel
//! in `SCM_RIGHTS` ancillary data and both sides map the same memory.
//!
//! ```text
//!  client                               server
//!  ------                               ------
//!  Request(seq=n) ───────────────────▶  dispatch on Context
//!                 ◀───────────────────  Response(seq=n) [+ fd]
//!                 ◀───────────────────  Output(handle)  + fd   (subscribed)
//!                 ◀───────────────────  Event
//!  Notice(ReleaseBuffer) ────────────▶  drop handle
//! ```
//!
//! Every buffer the server hands out is parked in the session's handle
//! table until the client releases it, sends it back, or disconnects.

mod client;
mod dispatch;
pub mod frame;
pub mod protocol;
mod server;
mod session;

pub use client::{RemoteBuffer, RemoteOutputCallback, RpcClient};
pub use protocol::{BufferRef, Opcode, Request, Response};
pub use server::{RpcServer, ServerHandle};
pub use session::MAX_OUTSTANDING_HANDLES;
