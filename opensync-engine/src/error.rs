//! Engine error taxonomy.

use opensync_format::FormatError;
use opensync_group::GroupError;
use opensync_proxy::ProxyError;
use opensync_types::{MappingId, MemberId};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine.
///
/// The member-scoped variants (`Config`, `Connection`, `Timeout`, `Remote`)
/// quarantine one member for the round; the rest are round-fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A member's configuration is missing or malformed.
    #[error("member {member} configuration error: {message}")]
    Config { member: MemberId, message: String },

    /// Transport-level failure talking to a member.
    #[error("member {member} connection error: {message}")]
    Connection { member: MemberId, message: String },

    /// A member missed a phase deadline.
    #[error("member {member} timed out during {phase}")]
    Timeout { member: MemberId, phase: &'static str },

    /// A member's plugin explicitly failed a phase.
    #[error("member {member} failed {phase}: {message}")]
    Remote {
        member: MemberId,
        phase: &'static str,
        message: String,
    },

    /// A mapping was resolved before its object type finished reading.
    #[error("mapping {0} resolved before its get-changes barrier")]
    PrematureResolution(MappingId),

    /// An internal ordering invariant was broken.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The group cannot be synchronized as configured.
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// Every member failed; there is nothing left to synchronize.
    #[error("all members failed during {phase}")]
    AllMembersFailed { phase: &'static str },

    /// The round was aborted from outside.
    #[error("synchronization aborted")]
    Aborted,

    /// Group configuration or state-store failure.
    #[error(transparent)]
    Group(#[from] GroupError),

    /// Format layer failure.
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl EngineError {
    /// Maps a proxy failure for one member into the engine taxonomy.
    pub(crate) fn from_proxy(member: MemberId, phase: &'static str, err: ProxyError) -> Self {
        match err {
            ProxyError::Timeout(_) => EngineError::Timeout { member, phase },
            ProxyError::ConnectionLost(_) | ProxyError::ChannelClosed(_) => {
                EngineError::Connection {
                    member,
                    message: err.to_string(),
                }
            }
            ProxyError::Remote(remote) => EngineError::Remote {
                member,
                phase,
                message: remote.message,
            },
            ProxyError::Protocol(message) => EngineError::ProtocolViolation(message),
        }
    }
}
