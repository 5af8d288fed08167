//! The OpenSync synchronization engine.
//!
//! The engine drives a group of independent, failure-prone plugin clients
//! through a common round: connect, collect changes, group them into
//! mappings, resolve conflicts, write the winners back, mark the sync done
//! and disconnect. Each member talks over its own proxy channel; the engine
//! is one coordinating loop that multiplexes their replies, so the mapping
//! state is confined to that loop and never locked.
//!
//! Per-member failures are contained: a member that errors or times out in
//! a phase is quarantined for the rest of the round while the others
//! finish. Only a broken engine invariant or the loss of every member
//! escalates to a round-wide error, and even then teardown still runs for
//! everything that connected.

mod conflict;
mod engine;
mod error;
mod events;
mod mapping;
mod sink;
mod tracker;

pub use conflict::{ConflictResolver, Resolution};
pub use engine::{Engine, EngineConfig, EngineHandle, EngineState, SyncReport};
pub use error::{EngineError, EngineResult};
pub use events::{
    ChangeEvent, ChangeUpdate, ConflictEntry, ConflictInfo, EngineCallbacks, EngineEvent,
    EngineUpdate, MappingEvent, MappingUpdate, MemberEvent, MemberUpdate,
};
pub use mapping::{Mapping, MappingEntry, MappingState, MappingTable, ScheduledCommit};
pub use sink::{SinkEngine, SinkState};
pub use tracker::ChangeTracker;
