//! Error types for group configuration and state stores.

use opensync_types::MemberId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for group operations.
pub type GroupResult<T> = Result<T, GroupError>;

/// Errors that can occur while loading, saving or locking a group.
#[derive(Debug, Error)]
pub enum GroupError {
    /// Filesystem error under the group config directory.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A config file could not be parsed or written.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Another engine holds the group lock.
    #[error("group at {0} is locked by another engine")]
    Locked(PathBuf),

    /// Anchor/hash store error.
    #[error("state store error: {0}")]
    Storage(String),

    /// The member id is not part of this group.
    #[error("no member with id {0}")]
    MemberNotFound(MemberId),
}
