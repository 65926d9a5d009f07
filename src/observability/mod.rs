//! Observability: metrics and tracing.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `mediaplane_buffers_delivered` | Counter | Buffers handed to a consumer (label `channel`) |
//! | `mediaplane_buffers_dropped` | Counter | Buffers released by backpressure (label `channel`) |
//! | `mediaplane_rpc_requests` | Counter | RPC requests handled (label `op`) |
//! | `mediaplane_rpc_sessions` | Gauge | Connected RPC sessions |
//! | `mediaplane_pool_buffers_available` | Gauge | Free buffers in a pool |
//!
//! Nothing is exported unless the application installs a `metrics` recorder.
//!
//! ## Tracing
//!
//! Each RPC session worker runs inside a `session` span; channel operations
//! log with a `channel` field.

mod metrics;
mod tracing_support;

pub use self::metrics::{
    SessionGauge, init_metrics, record_delivered, record_dropped, record_pool_available,
    record_rpc_request,
};
pub use tracing_support::{span_channel, span_session};
