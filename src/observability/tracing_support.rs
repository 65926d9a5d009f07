//! Tracing spans for channels and RPC sessions.

use crate::channel::ChannelId;
use tracing::{Level, Span, span};

/// Create a span for work on one channel.
///
/// # Example
///
/// ```rust,ignore
/// use mediaplane::observability::span_channel;
///
/// let span = span_channel(id);
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_channel(id: ChannelId) -> Span {
    span!(Level::DEBUG, "channel", channel = %id)
}

/// Create a span for one RPC session. The session worker runs inside it.
#[inline]
pub fn span_session(session: u64) -> Span {
    span!(Level::INFO, "session", session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ModuleKind;

    #[test]
    fn test_span_creation() {
        let _span = span_channel(ChannelId::new(ModuleKind::Vi, 0));
        let _guard = span_session(7).entered();
    }
}
