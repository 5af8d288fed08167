//! Core types shared by every OpenSync engine crate.
//!
//! This crate holds the identifier newtypes and the [`Change`] record that
//! flows from the plugins through the member proxies into the mapping
//! engine. It has no async or I/O surface on purpose; everything here is
//! plain data.

mod change;
mod ids;

pub use change::{content_hash, Change, ChangeKind};
pub use ids::{MappingId, MemberId, ObjType, SessionId};
