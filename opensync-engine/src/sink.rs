//! Per-sink lifecycle state.

use opensync_types::{MemberId, ObjType};

/// Lifecycle state of one (member × objtype) sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Unconnected,
    Connected,
    Reading,
    Committing,
    Done,
    Error,
}

/// One sub-endpoint of a member: either the main sink (`objtype = None`),
/// whose connect runs before and disconnect after every per-type sink of
/// that member, or a per-objtype sink with its own independent lifecycle.
///
/// State is only ever mutated from the engine's coordinating loop.
#[derive(Debug, Clone)]
pub struct SinkEngine {
    member: MemberId,
    objtype: Option<ObjType>,
    state: SinkState,
    slow_sync: bool,
    was_connected: bool,
}

impl SinkEngine {
    /// Creates the main sink for a member.
    #[must_use]
    pub fn main(member: MemberId) -> Self {
        Self {
            member,
            objtype: None,
            state: SinkState::Unconnected,
            slow_sync: false,
            was_connected: false,
        }
    }

    /// Creates a per-objtype sink for a member.
    #[must_use]
    pub fn for_objtype(member: MemberId, objtype: ObjType) -> Self {
        Self {
            member,
            objtype: Some(objtype),
            state: SinkState::Unconnected,
            slow_sync: false,
            was_connected: false,
        }
    }

    /// The owning member.
    #[must_use]
    pub fn member(&self) -> MemberId {
        self.member
    }

    /// The sink's object type; `None` for the main sink.
    #[must_use]
    pub fn objtype(&self) -> Option<&ObjType> {
        self.objtype.as_ref()
    }

    /// True for the member's main sink.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.objtype.is_none()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SinkState {
        self.state
    }

    /// Moves the sink to a new state.
    pub fn set_state(&mut self, state: SinkState) {
        if state == SinkState::Connected {
            self.was_connected = true;
        }
        self.state = state;
    }

    /// True if the sink connected at any point this round, whatever
    /// happened to it afterwards. Teardown disconnects exactly these.
    #[must_use]
    pub fn was_connected(&self) -> bool {
        self.was_connected
    }

    /// True once the sink connected and has not errored since.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            SinkState::Connected | SinkState::Reading | SinkState::Committing | SinkState::Done
        )
    }

    /// Whether the next get-changes runs as a full resync. Set from anchor
    /// mismatch detection (or an unclean previous shutdown) before connect;
    /// the plugin reads it, this sink only carries it.
    #[must_use]
    pub fn slow_sync(&self) -> bool {
        self.slow_sync
    }

    /// Sets the slow-sync flag.
    pub fn set_slow_sync(&mut self, slow_sync: bool) {
        self.slow_sync = slow_sync;
    }

    /// Resets per-round state, keeping the sink configured.
    pub fn reset(&mut self) {
        self.state = SinkState::Unconnected;
        self.slow_sync = false;
        self.was_connected = false;
    }
}
