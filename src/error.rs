//! Error types for mediaplane.
//!
//! Every error maps onto a small negative [`ErrorCode`]. The code is what
//! crosses the RPC boundary, so a remote caller and a local caller observe
//! the same value for the same failure.

use crate::channel::ModuleKind;
use thiserror::Error;

/// Result type alias using mediaplane's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mediaplane operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Null or out-of-range channel id, malformed configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires a higher channel status than the current one.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Operation is forbidden in the current status (e.g. destroy while bound).
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Resource already configured or held by someone else.
    #[error("busy: {0}")]
    Busy(String),

    /// No buffer, memory or pool slot left.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Valid request for a combination that is not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// Malformed frame or payload on the RPC connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The RPC peer went away.
    #[error("peer disconnected")]
    Disconnected,
}

/// Numeric error codes, stable across the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// See [`Error::InvalidArgument`].
    InvalidArgument = -1,
    /// See [`Error::NotReady`].
    NotReady = -2,
    /// See [`Error::NotPermitted`].
    NotPermitted = -3,
    /// See [`Error::Busy`].
    Busy = -4,
    /// See [`Error::ResourceExhausted`].
    ResourceExhausted = -5,
    /// See [`Error::Unsupported`].
    Unsupported = -6,
    /// See [`Error::Io`] and [`Error::System`].
    Io = -7,
    /// See [`Error::Protocol`].
    Protocol = -8,
    /// See [`Error::Disconnected`].
    Disconnected = -9,
}

impl ErrorCode {
    /// Raw integer value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Parse a raw value received from the wire.
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            -1 => Self::InvalidArgument,
            -2 => Self::NotReady,
            -3 => Self::NotPermitted,
            -4 => Self::Busy,
            -5 => Self::ResourceExhausted,
            -6 => Self::Unsupported,
            -7 => Self::Io,
            -8 => Self::Protocol,
            -9 => Self::Disconnected,
            _ => return None,
        })
    }

    /// The code namespaced by module kind, e.g. `-0x302` for "not ready" on
    /// the third module kind.
    pub fn namespaced(self, kind: ModuleKind) -> i32 {
        -(0x100 * (kind.index() as i32 + 1) + (-self.as_i32()))
    }

    /// Rebuild an error carrying this code.
    pub fn into_error(self, message: impl Into<String>) -> Error {
        let message = message.into();
        match self {
            Self::InvalidArgument => Error::InvalidArgument(message),
            Self::NotReady => Error::NotReady(message),
            Self::NotPermitted => Error::NotPermitted(message),
            Self::Busy => Error::Busy(message),
            Self::ResourceExhausted => Error::ResourceExhausted(message),
            Self::Unsupported => Error::Unsupported(message),
            Self::Io => Error::Io(std::io::Error::other(message)),
            Self::Protocol => Error::Protocol(message),
            Self::Disconnected => Error::Disconnected,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotReady => "NOT_READY",
            Self::NotPermitted => "NOT_PERMITTED",
            Self::Busy => "BUSY",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Unsupported => "UNSUPPORTED",
            Self::Io => "IO",
            Self::Protocol => "PROTOCOL",
            Self::Disconnected => "DISCONNECTED",
        };
        write!(f, "{}({})", name, self.as_i32())
    }
}

impl Error {
    /// The numeric code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::NotReady(_) => ErrorCode::NotReady,
            Self::NotPermitted(_) => ErrorCode::NotPermitted,
            Self::Busy(_) => ErrorCode::Busy,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::Io(_) | Self::System(_) => ErrorCode::Io,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::Disconnected => ErrorCode::Disconnected,
        }
    }

    /// Whether this error means the RPC connection is unusable.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Disconnected => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            Self::System(errno) => {
                *errno == rustix::io::Errno::PIPE || *errno == rustix::io::Errno::CONNRESET
            }
            _ => false,
        }
    }
}
