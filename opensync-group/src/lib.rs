//! Group and member configuration.
//!
//! A group is the persisted unit of synchronization: an ordered set of
//! configured members, a conflict policy and a config directory on disk.
//! The engine loads a group, takes its lock (one live engine per group),
//! and reads/writes each member's anchor and hash state through
//! [`MemberStore`].

mod error;
mod group;
mod lock;
mod store;

pub use error::{GroupError, GroupResult};
pub use group::{ConflictPolicy, Group, Member};
pub use lock::GroupLock;
pub use store::MemberStore;
