//! Metrics collection using metrics-rs.

use crate::channel::ChannelId;
use metrics::{Gauge, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const BUFFERS_DELIVERED: &str = "mediaplane_buffers_delivered";
const BUFFERS_DROPPED: &str = "mediaplane_buffers_dropped";
const RPC_REQUESTS: &str = "mediaplane_rpc_requests";
const RPC_SESSIONS: &str = "mediaplane_rpc_sessions";
const POOL_BUFFERS_AVAILABLE: &str = "mediaplane_pool_buffers_available";

/// Initialize metrics descriptions.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        BUFFERS_DELIVERED,
        Unit::Count,
        "Buffers handed to a channel's consumer"
    );
    metrics::describe_counter!(
        BUFFERS_DROPPED,
        Unit::Count,
        "Buffers released by backpressure"
    );
    metrics::describe_counter!(RPC_REQUESTS, Unit::Count, "RPC requests handled");
    metrics::describe_gauge!(RPC_SESSIONS, Unit::Count, "Connected RPC sessions");
    metrics::describe_gauge!(
        POOL_BUFFERS_AVAILABLE,
        Unit::Count,
        "Free buffers in the most recently touched pool"
    );
}

/// Record a buffer handed to a consumer.
#[inline]
pub fn record_delivered(channel: ChannelId) {
    counter!(BUFFERS_DELIVERED, "channel" => channel.to_string()).increment(1);
}

/// Record a buffer dropped by backpressure.
#[inline]
pub fn record_dropped(channel: ChannelId) {
    counter!(BUFFERS_DROPPED, "channel" => channel.to_string()).increment(1);
}

/// Record one RPC request by operation name.
#[inline]
pub fn record_rpc_request(op: &'static str) {
    counter!(RPC_REQUESTS, "op" => op).increment(1);
}

/// Record free buffers in a pool.
#[inline]
pub fn record_pool_available(available: usize) {
    gauge!(POOL_BUFFERS_AVAILABLE).set(available as f64);
}

/// Connected-session gauge; increments on creation, decrements on drop.
pub struct SessionGauge {
    gauge: Gauge,
}

impl SessionGauge {
    /// Count one more session.
    pub fn enter() -> Self {
        let gauge = gauge!(RPC_SESSIONS);
        gauge.increment(1.0);
        Self { gauge }
    }
}

impl Drop for SessionGauge {
    fn drop(&mut self) {
        self.gauge.decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ModuleKind;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_recording_without_recorder() {
        let id = ChannelId::new(ModuleKind::Venc, 3);
        record_delivered(id);
        record_dropped(id);
        record_rpc_request("bind");
        record_pool_available(4);
        let gauge = SessionGauge::enter();
        drop(gauge);
    }
}
