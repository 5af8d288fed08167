//! Status events and callback registrations.
//!
//! External observers (a CLI, a GUI) register callbacks and receive
//! incremental per-member, per-change and per-mapping updates plus
//! engine-wide phase events. Every phase start is eventually paired with a
//! success, error or timeout update for that same phase; the engine-status
//! stream carries exactly one terminal event per round.

use crate::engine::EngineHandle;
use opensync_types::{Change, MappingId, MemberId, ObjType, SessionId};
use serde::Serialize;
use std::sync::Arc;

/// Per-member status update kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemberEvent {
    Discovered,
    Connected,
    Read,
    Written,
    SyncDone,
    Disconnected,
    Error,
}

/// One per-member status update. `objtype = None` is the main sink.
#[derive(Debug, Clone, Serialize)]
pub struct MemberUpdate {
    pub session: SessionId,
    pub member: MemberId,
    pub objtype: Option<ObjType>,
    pub event: MemberEvent,
    pub error: Option<String>,
}

/// Engine-wide phase events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineEvent {
    /// The previous engine over this group died uncleanly; the round runs
    /// as a slow sync.
    PrevUnclean,
    /// All members connected all their sinks.
    Connected,
    /// All object types reached their get-changes barrier cleanly.
    Read,
    /// All scheduled commits were dispatched and acknowledged.
    Written,
    /// All healthy members acknowledged sync-done.
    SyncDone,
    /// All connected members disconnected.
    Disconnected,
    /// Conflict detection finished for every mapping of the round.
    EndConflicts,
    /// Terminal: the round completed without error.
    Successful,
    /// Terminal: the round failed; cleanup still ran.
    Error,
}

/// One engine-wide status update.
#[derive(Debug, Clone, Serialize)]
pub struct EngineUpdate {
    pub session: SessionId,
    pub event: EngineEvent,
    pub error: Option<String>,
}

/// Per-change status update kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeEvent {
    Read,
    Written,
    Error,
}

/// One per-change status update.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeUpdate {
    pub session: SessionId,
    pub member: MemberId,
    pub objtype: ObjType,
    pub uid: String,
    pub mapping: Option<MappingId>,
    pub event: ChangeEvent,
    pub error: Option<String>,
}

/// Per-mapping status update kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MappingEvent {
    Solved,
    Conflict,
    Error,
}

/// One per-mapping status update.
#[derive(Debug, Clone, Serialize)]
pub struct MappingUpdate {
    pub session: SessionId,
    pub mapping: MappingId,
    pub objtype: ObjType,
    /// The winning member once the mapping is solved.
    pub winner: Option<MemberId>,
    pub event: MappingEvent,
    pub error: Option<String>,
}

/// One side of a conflicting mapping, as handed to the conflict handler.
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    pub member: MemberId,
    pub change: Change,
}

/// A conflicting mapping awaiting an external decision.
#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub session: SessionId,
    pub mapping: MappingId,
    pub objtype: ObjType,
    pub entries: Vec<ConflictEntry>,
}

type MemberStatusFn = dyn Fn(&MemberUpdate) + Send + Sync;
type EngineStatusFn = dyn Fn(&EngineUpdate) + Send + Sync;
type ChangeStatusFn = dyn Fn(&ChangeUpdate) + Send + Sync;
type MappingStatusFn = dyn Fn(&MappingUpdate) + Send + Sync;
type ConflictFn = dyn Fn(EngineHandle, ConflictInfo) + Send + Sync;

/// Registered status callbacks.
///
/// The conflict handler is the only callback allowed to call back into the
/// engine, through the [`EngineHandle`] it receives: it may decide
/// immediately or keep the handle and solve later while the engine keeps
/// resolving other mappings.
#[derive(Default, Clone)]
pub struct EngineCallbacks {
    pub(crate) member_status: Option<Arc<MemberStatusFn>>,
    pub(crate) engine_status: Option<Arc<EngineStatusFn>>,
    pub(crate) change_status: Option<Arc<ChangeStatusFn>>,
    pub(crate) mapping_status: Option<Arc<MappingStatusFn>>,
    pub(crate) conflict: Option<Arc<ConflictFn>>,
}

impl EngineCallbacks {
    pub(crate) fn emit_member(&self, update: MemberUpdate) {
        if let Some(cb) = &self.member_status {
            cb(&update);
        }
    }

    pub(crate) fn emit_engine(&self, update: EngineUpdate) {
        if let Some(cb) = &self.engine_status {
            cb(&update);
        }
    }

    pub(crate) fn emit_change(&self, update: ChangeUpdate) {
        if let Some(cb) = &self.change_status {
            cb(&update);
        }
    }

    pub(crate) fn emit_mapping(&self, update: MappingUpdate) {
        if let Some(cb) = &self.mapping_status {
            cb(&update);
        }
    }
}
