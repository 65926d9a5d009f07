//! Runtime configuration.
//!
//! [`ContextConfig`] sizes the channel tables and tunes delivery and enable
//! retries; [`ServerConfig`] configures the RPC listener. Both have sensible
//! defaults and `with_*` builder methods.

use crate::channel::ModuleKind;
use crate::delivery::{MAX_QUEUE_DEPTH, MIN_QUEUE_DEPTH};
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default pull queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 2;
/// Default socket path of the daemon.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/mediaplane.sock";

/// Configuration of a [`Context`](crate::context::Context).
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Queue depth a channel starts with.
    pub default_queue_depth: usize,
    /// Extra attempts when stage creation reports `Busy`.
    pub enable_retries: u32,
    /// Pause between enable attempts.
    pub retry_delay: Duration,
    /// Queue the output of channels nobody consumes, so `get_media_buffer`
    /// works without a prior `start_get_media_buffer`.
    pub implicit_pull: bool,
    channel_counts: [usize; ModuleKind::ALL.len()],
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_queue_depth: DEFAULT_QUEUE_DEPTH,
            enable_retries: 3,
            retry_delay: Duration::from_millis(20),
            implicit_pull: true,
            channel_counts: ModuleKind::ALL.map(ModuleKind::default_channel_count),
        }
    }
}

impl ContextConfig {
    /// Set the default queue depth.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.default_queue_depth = depth;
        self
    }

    /// Set the enable retry policy.
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.enable_retries = retries;
        self.retry_delay = delay;
        self
    }

    /// Enable or disable implicit pull queues.
    pub fn with_implicit_pull(mut self, enabled: bool) -> Self {
        self.implicit_pull = enabled;
        self
    }

    /// Override the number of channels of one kind.
    pub fn with_channel_count(mut self, kind: ModuleKind, count: usize) -> Self {
        self.channel_counts[kind.index()] = count;
        self
    }

    /// Number of channels of `kind`.
    pub fn channel_count(&self, kind: ModuleKind) -> usize {
        self.channel_counts[kind.index()]
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_QUEUE_DEPTH..=MAX_QUEUE_DEPTH).contains(&self.default_queue_depth) {
            return Err(Error::InvalidArgument(format!(
                "default queue depth {} outside {}..={}",
                self.default_queue_depth, MIN_QUEUE_DEPTH, MAX_QUEUE_DEPTH
            )));
        }
        Ok(())
    }
}

/// Configuration of the RPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unix socket path to listen on.
    pub socket_path: PathBuf,
    /// A peer that cannot take a frame within this time is dropped.
    ///
    /// Output pushes are written on the producing stage's thread, so this is
    /// also the longest a stage can stall on a slow subscriber. The session
    /// is closed after the first timed-out write; later pushes return at once.
    pub write_timeout: Duration,
    /// Connections beyond this many are refused.
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            write_timeout: Duration::from_secs(2),
            max_sessions: 32,
        }
    }
}

impl ServerConfig {
    /// Config listening on `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
            ..Self::default()
        }
    }

    /// Read `MEDIAPLANE_SOCKET`, `MEDIAPLANE_WRITE_TIMEOUT_MS` and
    /// `MEDIAPLANE_MAX_SESSIONS`, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("MEDIAPLANE_SOCKET") {
            config.socket_path = PathBuf::from(path);
        }
        if let Ok(ms) = std::env::var("MEDIAPLANE_WRITE_TIMEOUT_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                Error::InvalidArgument(format!("MEDIAPLANE_WRITE_TIMEOUT_MS={:?} is not a number", ms))
            })?;
            config.write_timeout = Duration::from_millis(ms);
        }
        if let Ok(max) = std::env::var("MEDIAPLANE_MAX_SESSIONS") {
            config.max_sessions = max.parse().map_err(|_| {
                Error::InvalidArgument(format!("MEDIAPLANE_MAX_SESSIONS={:?} is not a number", max))
            })?;
        }
        Ok(config)
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the session limit.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }
}
