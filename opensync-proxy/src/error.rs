//! Proxy error types.

use crate::proto::RemoteError;
use opensync_types::MemberId;
use std::time::Duration;
use thiserror::Error;

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Failure modes of one outstanding request.
///
/// Transport faults (`ConnectionLost`, `Timeout`) are synthesized by the
/// proxy; `Remote` is what the plugin itself reported. The engine treats
/// all three the same way in its aggregation and only distinguishes them
/// in the reported error kind.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client task is gone; the pipe closed unexpectedly. This is the
    /// HUP condition, distinct from an application-level error.
    #[error("connection to member {0} lost")]
    ConnectionLost(MemberId),

    /// The outgoing channel is already closed; nothing was sent.
    #[error("channel to member {0} is disconnected")]
    ChannelClosed(MemberId),

    /// No reply arrived within the request kind's deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The plugin explicitly failed the request.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The request is not legal in the proxy's current state.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ProxyError {
    /// True for faults that poison the member's connection (as opposed to
    /// a per-request application error).
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProxyError::ConnectionLost(_) | ProxyError::ChannelClosed(_) | ProxyError::Timeout(_)
        )
    }
}
