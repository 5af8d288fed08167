//! The engine controller: one coordinating loop over all members.

use crate::conflict::{ConflictResolver, Resolution};
use crate::error::{EngineError, EngineResult};
use crate::events::{
    ChangeEvent, ChangeUpdate, ConflictEntry, ConflictInfo, EngineCallbacks, EngineEvent,
    EngineUpdate, MappingEvent, MappingUpdate, MemberEvent, MemberUpdate,
};
use crate::mapping::{MappingState, MappingTable, ScheduledCommit};
use crate::sink::{SinkEngine, SinkState};
use crate::tracker::ChangeTracker;
use futures::future::join_all;
use opensync_format::FormatRegistry;
use opensync_group::{Group, GroupLock, Member, MemberStore};
use opensync_plugin::PluginRegistry;
use opensync_proxy::{MemberProxy, ProxyState, ProxyTimeouts, Reply, Request};
use opensync_types::{content_hash, Change, ChangeKind, MappingId, MemberId, ObjType, SessionId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine tunables.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Per-request-kind reply deadlines for every member proxy.
    pub timeouts: ProxyTimeouts,
}

/// Round state of the engine, group-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Initializing,
    Connecting,
    Reading,
    Mapping,
    Resolving,
    Committing,
    SyncDone,
    Disconnecting,
    Error,
}

#[derive(Debug)]
enum EngineCommand {
    Solve {
        mapping: MappingId,
        winner: MemberId,
    },
    Abort,
}

/// Cheap handle for calling back into a running engine.
///
/// Handed to the conflict callback; `solve` is only legal while the engine
/// is resolving (a mapping may not be solved before its object type's
/// get-changes barrier), `abort` is honored at every phase boundary.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    /// Declares the winner of a suspended conflicting mapping.
    pub fn solve(&self, mapping: MappingId, winner: MemberId) {
        let _ = self.tx.send(EngineCommand::Solve { mapping, winner });
    }

    /// Aborts the running round; cleanup still runs.
    pub fn abort(&self) {
        let _ = self.tx.send(EngineCommand::Abort);
    }
}

/// Summary of one completed round.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub session: SessionId,
    /// Commits acknowledged this round.
    pub commits: usize,
    /// Conflicts surfaced this round.
    pub conflicts: usize,
    /// True when a member was excluded but the round went on.
    pub degraded: bool,
}

struct MemberRuntime {
    member: Member,
    proxy: MemberProxy,
    store: MemberStore,
    main_sink: SinkEngine,
    sinks: BTreeMap<ObjType, SinkEngine>,
    batch_commit: bool,
    quarantined: bool,
}

impl MemberRuntime {
    fn id(&self) -> MemberId {
        self.member.id
    }
}

#[derive(Default)]
struct Round {
    error: Option<EngineError>,
    fatal: bool,
    commits: usize,
    conflicts: usize,
    engine_connected: bool,
    connect_failures: usize,
    read_failures: usize,
    commit_failures: usize,
    sync_done_failures: usize,
}

impl Round {
    fn fail(&mut self, err: EngineError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn fail_fatal(&mut self, err: EngineError) {
        self.fatal = true;
        self.fail(err);
    }
}

/// The live orchestration object wrapping a group.
///
/// Created from a loaded [`Group`], initialized once (spawns one proxy per
/// member), then driven through any number of `synchronize` rounds before
/// being finalized. All mutable round state is confined to the calling
/// task; members only ever talk back through their proxy channels.
pub struct Engine {
    group: Group,
    registry: PluginRegistry,
    formats: FormatRegistry,
    config: EngineConfig,
    callbacks: EngineCallbacks,
    lock: Option<GroupLock>,
    members: Vec<MemberRuntime>,
    active_objtypes: Vec<ObjType>,
    tables: HashMap<ObjType, MappingTable>,
    /// Uids each member's database held before the round, per objtype,
    /// loaded from the hash stores while reading.
    round_known: HashMap<ObjType, BTreeMap<MemberId, HashSet<String>>>,
    tracker: ChangeTracker,
    state: EngineState,
    session: SessionId,
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    prev_unclean: bool,
    initialized: bool,
}

impl Engine {
    /// Creates an engine over a group. Nothing is spawned until
    /// [`initialize`](Self::initialize).
    #[must_use]
    pub fn new(
        group: Group,
        registry: PluginRegistry,
        formats: FormatRegistry,
        config: EngineConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            group,
            registry,
            formats,
            config,
            callbacks: EngineCallbacks::default(),
            lock: None,
            members: Vec::new(),
            active_objtypes: Vec::new(),
            tables: HashMap::new(),
            round_known: HashMap::new(),
            tracker: ChangeTracker::new(),
            state: EngineState::Idle,
            session: SessionId::new(),
            cmd_tx,
            cmd_rx,
            prev_unclean: false,
            initialized: false,
        }
    }

    /// The wrapped group.
    #[must_use]
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Current round state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Object types active this engine (supported by at least two
    /// members). Empty before initialize.
    #[must_use]
    pub fn active_objtypes(&self) -> &[ObjType] {
        &self.active_objtypes
    }

    /// Sends a custom message straight through to one member's plugin and
    /// returns its reply. For callers that need to talk to a specific
    /// plugin outside the sync protocol.
    pub async fn call_plugin(
        &self,
        member: MemberId,
        name: &str,
        data: &[u8],
    ) -> EngineResult<Vec<u8>> {
        let rt = self
            .members
            .iter()
            .find(|rt| rt.id() == member)
            .ok_or_else(|| {
                EngineError::Misconfiguration(format!("no initialized member {member}"))
            })?;
        match rt
            .proxy
            .send_request(Request::CallPlugin {
                name: name.to_string(),
                data: data.to_vec(),
            })
            .await
        {
            Ok(Reply::Custom(reply)) => Ok(reply),
            Ok(_) => Err(EngineError::ProtocolViolation(format!(
                "member {member} sent an unexpected call reply"
            ))),
            Err(e) => Err(EngineError::from_proxy(member, "call_plugin", e)),
        }
    }

    /// The requests sent to a member this round, in send order. Used by
    /// order-audit tests and diagnostics.
    #[must_use]
    pub fn request_log(&self, member: MemberId) -> Option<Vec<opensync_proxy::SentRequest>> {
        self.members
            .iter()
            .find(|rt| rt.id() == member)
            .map(|rt| rt.proxy.request_log())
    }

    /// A handle for solve/abort calls from outside the controller loop.
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    // ── Callback registration ────────────────────────────────────

    /// Sets the per-member status callback.
    pub fn set_member_status_callback<F>(&mut self, f: F)
    where
        F: Fn(&MemberUpdate) + Send + Sync + 'static,
    {
        self.callbacks.member_status = Some(std::sync::Arc::new(f));
    }

    /// Sets the engine-wide status callback.
    pub fn set_engine_status_callback<F>(&mut self, f: F)
    where
        F: Fn(&EngineUpdate) + Send + Sync + 'static,
    {
        self.callbacks.engine_status = Some(std::sync::Arc::new(f));
    }

    /// Sets the per-change status callback.
    pub fn set_change_status_callback<F>(&mut self, f: F)
    where
        F: Fn(&ChangeUpdate) + Send + Sync + 'static,
    {
        self.callbacks.change_status = Some(std::sync::Arc::new(f));
    }

    /// Sets the per-mapping status callback.
    pub fn set_mapping_status_callback<F>(&mut self, f: F)
    where
        F: Fn(&MappingUpdate) + Send + Sync + 'static,
    {
        self.callbacks.mapping_status = Some(std::sync::Arc::new(f));
    }

    /// Sets the conflict handler. It receives an [`EngineHandle`] and may
    /// call `solve` from within its own invocation or any time later.
    pub fn set_conflict_callback<F>(&mut self, f: F)
    where
        F: Fn(EngineHandle, ConflictInfo) + Send + Sync + 'static,
    {
        self.callbacks.conflict = Some(std::sync::Arc::new(f));
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Initializes the engine: takes the group lock, spawns one client per
    /// member, gathers every initialize reply, and discovers object types.
    ///
    /// One member's failure does not keep the others from being asked, but
    /// any failure fails the initialize as a whole (after tearing the
    /// spawned clients back down).
    pub async fn initialize(&mut self) -> EngineResult<()> {
        if self.initialized {
            return Err(EngineError::ProtocolViolation(
                "engine is already initialized".into(),
            ));
        }
        self.state = EngineState::Initializing;
        info!(group = %self.group.name(), "initializing engine");

        if self.group.num_members() < 2 {
            self.state = EngineState::Idle;
            return Err(EngineError::Misconfiguration(format!(
                "group has {} member(s), at least 2 are needed",
                self.group.num_members()
            )));
        }

        let lock = GroupLock::acquire(self.group.configdir())?;
        self.prev_unclean = lock.was_unclean();
        self.lock = Some(lock);

        let mut failures: Vec<EngineError> = Vec::new();
        let mut spawned: Vec<MemberRuntime> = Vec::new();
        for member in self.group.members().to_vec() {
            let config = member.plugin_config(self.group.configdir());
            match self.registry.instantiate(&member.plugin_name, &config) {
                Ok(plugin) => {
                    let store = MemberStore::open(&config.configdir)?;
                    let proxy =
                        MemberProxy::spawn(member.id, plugin, self.config.timeouts.clone());
                    let main_sink = SinkEngine::main(member.id);
                    spawned.push(MemberRuntime {
                        member,
                        proxy,
                        store,
                        main_sink,
                        sinks: BTreeMap::new(),
                        batch_commit: false,
                        quarantined: false,
                    });
                }
                Err(e) => failures.push(EngineError::Config {
                    member: member.id,
                    message: e.to_string(),
                }),
            }
        }

        // Every spawned member gets its initialize sent and its reply
        // awaited, regardless of how its siblings fared.
        let configdir = self.group.configdir().to_path_buf();
        let init_results = join_all(spawned.iter().map(|rt| {
            let config = rt.member.plugin_config(&configdir);
            async move {
                let result = rt
                    .proxy
                    .send_request(Request::Initialize { config })
                    .await;
                (rt.id(), result)
            }
        }))
        .await;

        let mut init_ok: BTreeSet<MemberId> = BTreeSet::new();
        for (id, result) in init_results {
            match result {
                Ok(_) => {
                    init_ok.insert(id);
                }
                Err(e) => failures.push(EngineError::from_proxy(id, "initialize", e)),
            }
        }

        let discover_results = join_all(
            spawned
                .iter()
                .filter(|rt| init_ok.contains(&rt.id()))
                .map(|rt| async move {
                    let result = rt.proxy.send_request(Request::Discover).await;
                    (rt.id(), result)
                }),
        )
        .await;

        let mut discovered: HashMap<MemberId, (Vec<ObjType>, bool)> = HashMap::new();
        for (id, result) in discover_results {
            match result {
                Ok(Reply::Discovered {
                    objtypes,
                    batch_commit,
                }) => {
                    discovered.insert(id, (objtypes, batch_commit));
                }
                Ok(_) => failures.push(EngineError::ProtocolViolation(format!(
                    "member {id} sent an unexpected discover reply"
                ))),
                Err(e) => failures.push(EngineError::from_proxy(id, "discover", e)),
            }
        }

        // Sink construction: a member syncs the types its plugin offers,
        // narrowed by its configuration, and every active type must have a
        // registered format.
        if failures.is_empty() {
            let mut support: HashMap<ObjType, usize> = HashMap::new();
            for rt in &mut spawned {
                let (offered, batch) = discovered
                    .remove(&rt.id())
                    .unwrap_or_else(|| (Vec::new(), false));
                rt.batch_commit = batch;
                let configured = &rt.member.objtypes;
                let types: Vec<ObjType> = offered
                    .into_iter()
                    .filter(|t| configured.is_empty() || configured.contains(t))
                    .collect();
                if types.is_empty() {
                    failures.push(EngineError::Misconfiguration(format!(
                        "member {} has no usable object types",
                        rt.id()
                    )));
                    continue;
                }
                for objtype in types {
                    *support.entry(objtype.clone()).or_insert(0) += 1;
                    rt.sinks
                        .insert(objtype.clone(), SinkEngine::for_objtype(rt.id(), objtype));
                }
            }

            let mut active: Vec<ObjType> = support
                .into_iter()
                .filter(|(_, n)| *n >= 2)
                .map(|(t, _)| t)
                .collect();
            active.sort();

            if failures.is_empty() && active.is_empty() {
                failures.push(EngineError::Misconfiguration(
                    "members share no object type".into(),
                ));
            }
            for objtype in &active {
                if !self.formats.contains(objtype) {
                    failures.push(EngineError::Misconfiguration(format!(
                        "no format registered for objtype \"{objtype}\""
                    )));
                }
            }

            if failures.is_empty() {
                for rt in &mut spawned {
                    rt.sinks.retain(|t, _| active.contains(t));
                    if rt.sinks.is_empty() {
                        failures.push(EngineError::Misconfiguration(format!(
                            "member {} shares no object type with the group",
                            rt.id()
                        )));
                    }
                }
                self.active_objtypes = active;
            }
        }

        if !failures.is_empty() {
            for failure in &failures {
                warn!(group = %self.group.name(), "initialize failure: {failure}");
            }
            for rt in &spawned {
                let _ = rt.proxy.send_request(Request::Finalize).await;
                rt.proxy.shutdown().await;
            }
            self.lock = None;
            self.state = EngineState::Idle;
            return Err(failures.remove(0));
        }

        for rt in &spawned {
            self.emit_member(rt.id(), None, MemberEvent::Discovered, None);
        }

        self.members = spawned;
        self.initialized = true;
        self.state = EngineState::Idle;
        info!(
            group = %self.group.name(),
            members = self.members.len(),
            objtypes = ?self.active_objtypes,
            "engine initialized"
        );
        Ok(())
    }

    /// Runs one synchronization round and blocks until it finished,
    /// failed, or was aborted. The engine stays initialized; rounds can be
    /// repeated without re-initializing.
    pub async fn synchronize(&mut self) -> EngineResult<SyncReport> {
        if !self.initialized {
            return Err(EngineError::ProtocolViolation(
                "engine is not initialized".into(),
            ));
        }

        self.reset_round();
        let mut round = Round::default();
        info!(session = %self.session, "synchronization round started");

        if let Err(e) = self.prepare_slow_sync() {
            round.fail_fatal(e);
        }

        self.drain_commands(&mut round);
        if !round.fatal {
            self.phase_connect(&mut round).await;
        }
        self.drain_commands(&mut round);
        if !round.fatal {
            self.phase_read(&mut round).await;
        }
        self.drain_commands(&mut round);
        if !round.fatal {
            self.phase_map(&mut round);
        }
        if !round.fatal {
            self.phase_resolve(&mut round).await;
        }
        if !round.fatal {
            self.phase_commit(&mut round).await;
        }
        self.drain_commands(&mut round);
        if !round.fatal {
            self.phase_sync_done(&mut round).await;
        }

        if round.fatal {
            self.state = EngineState::Error;
        }
        self.phase_disconnect(&mut round).await;

        let report = SyncReport {
            session: self.session,
            commits: round.commits,
            conflicts: round.conflicts,
            degraded: self.tracker.degraded() || self.members.iter().any(|m| m.quarantined),
        };

        for table in self.tables.values_mut() {
            table.clear();
        }
        self.tables.clear();
        self.round_known.clear();
        self.tracker.clear();
        self.state = EngineState::Idle;

        match round.error.take() {
            Some(err) => {
                self.emit_engine(EngineEvent::Error, Some(err.to_string()));
                info!(session = %self.session, "round failed: {err}");
                Err(err)
            }
            None => {
                self.emit_engine(EngineEvent::Successful, None);
                info!(
                    session = %self.session,
                    commits = report.commits,
                    conflicts = report.conflicts,
                    "round successful"
                );
                Ok(report)
            }
        }
    }

    /// Tears the engine down: disconnects whatever is still connected,
    /// finalizes every member and joins the client tasks. Failures are
    /// logged, never allowed to block the teardown of other members.
    pub async fn finalize(&mut self) -> EngineResult<()> {
        if !self.initialized {
            return Err(EngineError::ProtocolViolation(
                "engine is not initialized".into(),
            ));
        }
        info!(group = %self.group.name(), "finalizing engine");

        for rt in &self.members {
            if matches!(
                rt.proxy.state(),
                ProxyState::Connected | ProxyState::Reading | ProxyState::Error
            ) {
                if let Err(e) = rt
                    .proxy
                    .send_request(Request::Disconnect { objtype: None })
                    .await
                {
                    warn!(member = %rt.id(), "disconnect during finalize failed: {e}");
                }
            }
        }
        for rt in &self.members {
            if let Err(e) = rt.proxy.send_request(Request::Finalize).await {
                warn!(member = %rt.id(), "finalize failed: {e}");
            }
        }
        for rt in &self.members {
            rt.proxy.shutdown().await;
        }

        self.members.clear();
        self.lock = None;
        self.initialized = false;
        self.state = EngineState::Idle;
        Ok(())
    }

    // ── Round phases ─────────────────────────────────────────────

    fn reset_round(&mut self) {
        self.session = SessionId::new();
        self.tracker.clear();
        self.tables.clear();
        self.round_known.clear();
        for rt in &mut self.members {
            rt.quarantined = false;
            rt.main_sink.reset();
            for sink in rt.sinks.values_mut() {
                sink.reset();
            }
            rt.proxy.clear_request_log();
        }
        // Stale commands from a previous round are meaningless now.
        while self.cmd_rx.try_recv().is_ok() {}
    }

    /// Processes pending handle commands at a phase boundary. Abort is
    /// honored here; a solve arriving outside the resolving phase is a
    /// premature resolution and kills the round.
    fn drain_commands(&mut self, round: &mut Round) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                EngineCommand::Abort => {
                    warn!(session = %self.session, "round aborted");
                    round.fail_fatal(EngineError::Aborted);
                }
                EngineCommand::Solve { mapping, .. } => {
                    round.fail_fatal(EngineError::PrematureResolution(mapping));
                }
            }
        }
    }

    fn quarantine(&mut self, member: MemberId) {
        if let Some(rt) = self.members.iter_mut().find(|rt| rt.id() == member) {
            rt.quarantined = true;
        }
    }

    fn member_anchor(member: &Member) -> String {
        content_hash(format!("{}:{}", member.plugin_name, member.config).as_bytes())
    }

    /// Sets each sink's slow-sync flag from its anchor, before connecting.
    fn prepare_slow_sync(&mut self) -> EngineResult<()> {
        let force = self.prev_unclean;
        for rt in &mut self.members {
            let anchor = Self::member_anchor(&rt.member);
            let id = rt.id();
            for (objtype, sink) in &mut rt.sinks {
                let stored = rt.store.anchor(objtype)?;
                let slow = force || stored.as_deref() != Some(anchor.as_str());
                sink.set_slow_sync(slow);
                if slow {
                    debug!(member = %id, %objtype, "slow sync");
                }
            }
        }
        if force {
            self.emit_engine(EngineEvent::PrevUnclean, None);
            self.prev_unclean = false;
        }
        Ok(())
    }

    async fn phase_connect(&mut self, round: &mut Round) {
        self.state = EngineState::Connecting;

        type Outcome = (Option<ObjType>, Result<(), EngineError>);
        let results: Vec<(usize, Vec<Outcome>)> =
            join_all(self.members.iter().enumerate().map(|(i, rt)| async move {
                let mut outcomes: Vec<Outcome> = Vec::new();
                let main = rt
                    .proxy
                    .send_request(Request::Connect {
                        objtype: None,
                        slow_sync: false,
                    })
                    .await;
                match main {
                    Ok(_) => {
                        outcomes.push((None, Ok(())));
                        for (objtype, sink) in &rt.sinks {
                            if rt.proxy.state() == ProxyState::Error {
                                outcomes.push((
                                    Some(objtype.clone()),
                                    Err(EngineError::Connection {
                                        member: rt.id(),
                                        message: "connect skipped, connection lost".into(),
                                    }),
                                ));
                                continue;
                            }
                            let result = rt
                                .proxy
                                .send_request(Request::Connect {
                                    objtype: Some(objtype.clone()),
                                    slow_sync: sink.slow_sync(),
                                })
                                .await;
                            outcomes.push((
                                Some(objtype.clone()),
                                result
                                    .map(|_| ())
                                    .map_err(|e| EngineError::from_proxy(rt.id(), "connect", e)),
                            ));
                        }
                    }
                    Err(e) => {
                        // The main sink never came up; its per-type sinks
                        // are failed too, and each failure is surfaced.
                        outcomes.push((None, Err(EngineError::from_proxy(rt.id(), "connect", e))));
                        for objtype in rt.sinks.keys() {
                            outcomes.push((
                                Some(objtype.clone()),
                                Err(EngineError::Connection {
                                    member: rt.id(),
                                    message: "connect skipped, main sink failed".into(),
                                }),
                            ));
                        }
                    }
                }
                (i, outcomes)
            }))
            .await;

        for (i, outcomes) in results {
            for (objtype, result) in outcomes {
                match result {
                    Ok(()) => {
                        match &objtype {
                            None => self.members[i].main_sink.set_state(SinkState::Connected),
                            Some(t) => {
                                if let Some(sink) = self.members[i].sinks.get_mut(t) {
                                    sink.set_state(SinkState::Connected);
                                }
                            }
                        }
                        let id = self.members[i].id();
                        self.emit_member(id, objtype, MemberEvent::Connected, None);
                    }
                    Err(e) => {
                        round.connect_failures += 1;
                        match &objtype {
                            None => self.members[i].main_sink.set_state(SinkState::Error),
                            Some(t) => {
                                if let Some(sink) = self.members[i].sinks.get_mut(t) {
                                    sink.set_state(SinkState::Error);
                                }
                            }
                        }
                        self.members[i].quarantined = true;
                        let id = self.members[i].id();
                        self.emit_member(id, objtype, MemberEvent::Error, Some(e.to_string()));
                        round.fail(e);
                    }
                }
            }
        }

        let healthy = self.members.iter().filter(|m| !m.quarantined).count();
        if healthy == 0 {
            round.fail_fatal(EngineError::AllMembersFailed { phase: "connect" });
            return;
        }
        if round.connect_failures == 0 {
            round.engine_connected = true;
            self.emit_engine(EngineEvent::Connected, None);
        }
    }

    async fn phase_read(&mut self, round: &mut Round) {
        self.state = EngineState::Reading;

        // Expectations pin down the barrier membership before anything is
        // sent: exactly the currently-healthy members per object type.
        for objtype in self.active_objtypes.clone() {
            let expected: Vec<MemberId> = self
                .members
                .iter()
                .filter(|rt| !rt.quarantined && rt.sinks.contains_key(&objtype))
                .map(MemberRuntime::id)
                .collect();
            self.tracker.expect(objtype, expected);
        }

        type ReadOutcome = (ObjType, Result<Vec<Change>, EngineError>);
        let results: Vec<(usize, Vec<ReadOutcome>)> = join_all(
            self.members
                .iter()
                .enumerate()
                .filter(|(_, rt)| !rt.quarantined)
                .map(|(i, rt)| async move {
                    let mut outcomes: Vec<ReadOutcome> = Vec::new();
                    for (objtype, sink) in &rt.sinks {
                        if rt.proxy.state() == ProxyState::Error {
                            outcomes.push((
                                objtype.clone(),
                                Err(EngineError::Connection {
                                    member: rt.id(),
                                    message: "get_changes skipped, connection lost".into(),
                                }),
                            ));
                            continue;
                        }
                        let result = rt
                            .proxy
                            .send_request(Request::GetChanges {
                                objtype: objtype.clone(),
                                slow_sync: sink.slow_sync(),
                            })
                            .await;
                        let outcome = match result {
                            Ok(Reply::Changes(changes)) => Ok(changes),
                            Ok(_) => Err(EngineError::ProtocolViolation(format!(
                                "member {} sent an unexpected get_changes reply",
                                rt.id()
                            ))),
                            Err(e) => Err(EngineError::from_proxy(rt.id(), "get_changes", e)),
                        };
                        outcomes.push((objtype.clone(), outcome));
                    }
                    (i, outcomes)
                }),
        )
        .await;

        for (i, outcomes) in results {
            let id = self.members[i].id();
            for (objtype, outcome) in outcomes {
                match outcome {
                    Ok(changes) => {
                        let known = match self.members[i].store.load_hashes(&objtype) {
                            Ok(known) => known,
                            Err(e) => {
                                round.fail_fatal(e.into());
                                return;
                            }
                        };
                        self.round_known
                            .entry(objtype.clone())
                            .or_default()
                            .insert(id, known.keys().cloned().collect());
                        for mut change in changes {
                            // A re-reported entry whose content we already
                            // saw carries no work.
                            if change.kind != ChangeKind::Deleted
                                && known.get(&change.uid) == Some(&change.hash)
                            {
                                change.kind = ChangeKind::Unmodified;
                            }
                            if change.kind != ChangeKind::Unmodified {
                                self.emit_change(
                                    id,
                                    &change,
                                    None,
                                    ChangeEvent::Read,
                                    None,
                                );
                            }
                            self.tracker.record(id, change);
                        }
                        self.tracker.mark_reported(&objtype, id);
                        if let Some(sink) = self.members[i].sinks.get_mut(&objtype) {
                            sink.set_state(SinkState::Connected);
                        }
                        self.emit_member(id, Some(objtype), MemberEvent::Read, None);
                    }
                    Err(e) => {
                        round.read_failures += 1;
                        self.tracker.mark_failed(&objtype, id);
                        if let Some(sink) = self.members[i].sinks.get_mut(&objtype) {
                            sink.set_state(SinkState::Error);
                        }
                        self.members[i].quarantined = true;
                        self.emit_member(
                            id,
                            Some(objtype),
                            MemberEvent::Error,
                            Some(e.to_string()),
                        );
                        round.fail(e);
                    }
                }
            }
        }

        for objtype in &self.active_objtypes {
            if !self.tracker.barrier_reached(objtype) {
                round.fail_fatal(EngineError::ProtocolViolation(format!(
                    "objtype \"{objtype}\" missed its get_changes barrier"
                )));
                return;
            }
        }

        let healthy = self.members.iter().filter(|m| !m.quarantined).count();
        if healthy == 0 {
            round.fail_fatal(EngineError::AllMembersFailed {
                phase: "get_changes",
            });
            return;
        }
        if round.read_failures == 0 {
            self.emit_engine(EngineEvent::Read, None);
        }
    }

    fn phase_map(&mut self, round: &mut Round) {
        self.state = EngineState::Mapping;

        let healthy: BTreeSet<MemberId> = self
            .members
            .iter()
            .filter(|m| !m.quarantined)
            .map(MemberRuntime::id)
            .collect();

        let mut next_mapping_id: u64 = 1;
        for objtype in self.active_objtypes.clone() {
            let format = match self.formats.get(&objtype) {
                Ok(format) => format,
                Err(e) => {
                    round.fail_fatal(e.into());
                    return;
                }
            };
            let members: Vec<MemberId> = self
                .members
                .iter()
                .filter(|rt| !rt.quarantined && rt.sinks.contains_key(&objtype))
                .map(MemberRuntime::id)
                .collect();

            let mut table = MappingTable::new(objtype.clone(), format, members);
            table.set_first_id(next_mapping_id);

            let changes: Vec<(MemberId, Change)> = self
                .tracker
                .take_changes(&objtype)
                .into_iter()
                .filter(|(member, _)| healthy.contains(member))
                .collect();
            table.map_changes(changes);

            let conflicts = table.check_conflicts();
            round.conflicts += conflicts.len();
            next_mapping_id = table.next_free_id();

            for mapping in table.mappings() {
                match mapping.state {
                    MappingState::Solved => self.emit_mapping(
                        mapping.id,
                        &objtype,
                        mapping.master,
                        MappingEvent::Solved,
                        None,
                    ),
                    MappingState::Conflict => self.emit_mapping(
                        mapping.id,
                        &objtype,
                        None,
                        MappingEvent::Conflict,
                        None,
                    ),
                    MappingState::Unsolved => {}
                }
            }

            self.tables.insert(objtype, table);
        }

        self.emit_engine(EngineEvent::EndConflicts, None);
    }

    async fn phase_resolve(&mut self, round: &mut Round) {
        self.state = EngineState::Resolving;
        let resolver = ConflictResolver::new(self.group.conflict_policy());

        // Mapping id → objtype of every conflict awaiting an external
        // decision. Ids are unique round-wide.
        let mut pending: BTreeMap<MappingId, ObjType> = BTreeMap::new();

        for objtype in self.active_objtypes.clone() {
            let conflict_ids: Vec<MappingId> = match self.tables.get(&objtype) {
                Some(table) => table
                    .mappings()
                    .iter()
                    .filter(|m| m.state == MappingState::Conflict)
                    .map(|m| m.id)
                    .collect(),
                None => continue,
            };

            for id in conflict_ids {
                let resolution = match self.tables.get_mut(&objtype) {
                    Some(table) => resolver.resolve(table, id),
                    None => continue,
                };
                match resolution {
                    Ok(Resolution::Solved { winner }) => {
                        self.emit_mapping(id, &objtype, Some(winner), MappingEvent::Solved, None);
                    }
                    Ok(Resolution::Duplicated { created }) => {
                        let master_of = |table: &MappingTable, id: MappingId| {
                            table.mapping(id).and_then(|m| m.master)
                        };
                        let table = &self.tables[&objtype];
                        let winner = master_of(table, id);
                        let dupes: Vec<(MappingId, Option<MemberId>)> = created
                            .iter()
                            .map(|&dupe| (dupe, master_of(table, dupe)))
                            .collect();
                        self.emit_mapping(id, &objtype, winner, MappingEvent::Solved, None);
                        for (dupe, winner) in dupes {
                            self.emit_mapping(dupe, &objtype, winner, MappingEvent::Solved, None);
                        }
                    }
                    Ok(Resolution::AwaitingCallback) => {
                        let info = self.conflict_info(&objtype, id);
                        pending.insert(id, objtype.clone());
                        match (&self.callbacks.conflict, info) {
                            (Some(callback), Some(info)) => callback(self.handle(), info),
                            _ => {
                                // Interactive policy without a handler can
                                // never resolve; fail the round instead of
                                // hanging it.
                                round.fail_fatal(EngineError::Misconfiguration(
                                    "interactive conflict policy but no conflict handler".into(),
                                ));
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        self.emit_mapping(
                            id,
                            &objtype,
                            None,
                            MappingEvent::Error,
                            Some(e.to_string()),
                        );
                        round.fail_fatal(e);
                        return;
                    }
                }
            }
        }

        // Suspension point: other mappings above already resolved; the
        // engine now waits for the external decisions, however long they
        // take, without burning a thread.
        while !pending.is_empty() {
            match self.cmd_rx.recv().await {
                Some(EngineCommand::Solve { mapping, winner }) => {
                    let Some(objtype) = pending.get(&mapping).cloned() else {
                        warn!(%mapping, "solve for a mapping that is not pending, ignored");
                        continue;
                    };
                    let result = match self.tables.get_mut(&objtype) {
                        Some(table) => table.solve(mapping, winner),
                        None => continue,
                    };
                    match result {
                        Ok(()) => {
                            pending.remove(&mapping);
                            self.emit_mapping(
                                mapping,
                                &objtype,
                                Some(winner),
                                MappingEvent::Solved,
                                None,
                            );
                        }
                        Err(e) => {
                            // Bad winner; the conflict stays pending and
                            // the caller hears about it.
                            self.emit_mapping(
                                mapping,
                                &objtype,
                                None,
                                MappingEvent::Error,
                                Some(e.to_string()),
                            );
                        }
                    }
                }
                Some(EngineCommand::Abort) => {
                    warn!(session = %self.session, "round aborted while resolving");
                    round.fail_fatal(EngineError::Aborted);
                    return;
                }
                None => {
                    round.fail_fatal(EngineError::ProtocolViolation(
                        "command channel closed while resolving".into(),
                    ));
                    return;
                }
            }
        }
    }

    async fn phase_commit(&mut self, round: &mut Round) {
        self.state = EngineState::Committing;

        let healthy: BTreeSet<MemberId> = self
            .members
            .iter()
            .filter(|m| !m.quarantined)
            .map(MemberRuntime::id)
            .collect();

        // Multiply every solved mapping and collect the commits, grouped
        // per member so each member's stream stays FIFO.
        let mut per_member: BTreeMap<MemberId, Vec<ScheduledCommit>> = BTreeMap::new();
        let empty_known = BTreeMap::new();
        for table in self.tables.values_mut() {
            let known = self
                .round_known
                .get(table.objtype())
                .unwrap_or(&empty_known);
            for commit in table.multiply(&healthy, known) {
                per_member.entry(commit.member).or_default().push(commit);
            }
        }

        for rt in &mut self.members {
            if !rt.quarantined {
                for sink in rt.sinks.values_mut() {
                    sink.set_state(SinkState::Committing);
                }
            }
        }

        type CommitOutcome = (ScheduledCommit, Result<(), EngineError>);
        let results: Vec<(MemberId, Vec<CommitOutcome>, Vec<(ObjType, Result<(), EngineError>)>)> =
            join_all(
                self.members
                    .iter()
                    .filter(|rt| !rt.quarantined)
                    .map(|rt| {
                        let commits = per_member.remove(&rt.id()).unwrap_or_default();
                        async move {
                            let mut outcomes: Vec<CommitOutcome> = Vec::new();
                            for commit in commits {
                                if rt.proxy.state() == ProxyState::Error {
                                    outcomes.push((
                                        commit,
                                        Err(EngineError::Connection {
                                            member: rt.id(),
                                            message: "commit skipped, connection lost".into(),
                                        }),
                                    ));
                                    continue;
                                }
                                let result = rt
                                    .proxy
                                    .send_request(Request::CommitChange {
                                        objtype: commit.change.objtype.clone(),
                                        change: commit.change.clone(),
                                    })
                                    .await;
                                let outcome = result
                                    .map(|_| ())
                                    .map_err(|e| EngineError::from_proxy(rt.id(), "commit", e));
                                outcomes.push((commit, outcome));
                            }

                            // Batch completion goes to every sink of a
                            // batch-capable member, commits or not.
                            let mut batch_acks: Vec<(ObjType, Result<(), EngineError>)> =
                                Vec::new();
                            if rt.batch_commit && rt.proxy.state() != ProxyState::Error {
                                for objtype in rt.sinks.keys() {
                                    let result = rt
                                        .proxy
                                        .send_request(Request::CommittedAll {
                                            objtype: objtype.clone(),
                                        })
                                        .await;
                                    batch_acks.push((
                                        objtype.clone(),
                                        result.map(|_| ()).map_err(|e| {
                                            EngineError::from_proxy(rt.id(), "committed_all", e)
                                        }),
                                    ));
                                }
                            }
                            (rt.id(), outcomes, batch_acks)
                        }
                    }),
            )
            .await;

        for (member, outcomes, batch_acks) in results {
            for (commit, outcome) in outcomes {
                match outcome {
                    Ok(()) => {
                        round.commits += 1;
                        if let Some(table) = self.tables.get_mut(&commit.change.objtype) {
                            table.mark_committed(commit.mapping, member);
                        }
                        self.emit_change(
                            member,
                            &commit.change,
                            Some(commit.mapping),
                            ChangeEvent::Written,
                            None,
                        );
                    }
                    Err(e) => {
                        round.commit_failures += 1;
                        self.emit_change(
                            member,
                            &commit.change,
                            Some(commit.mapping),
                            ChangeEvent::Error,
                            Some(e.to_string()),
                        );
                        // A dead channel quarantines the member; a mere
                        // application error keeps it in the round.
                        if matches!(
                            e,
                            EngineError::Connection { .. } | EngineError::Timeout { .. }
                        ) {
                            self.quarantine(member);
                        }
                        round.fail(e);
                    }
                }
            }
            for (objtype, outcome) in batch_acks {
                if let Err(e) = outcome {
                    round.commit_failures += 1;
                    self.emit_member(
                        member,
                        Some(objtype),
                        MemberEvent::Error,
                        Some(e.to_string()),
                    );
                    if matches!(
                        e,
                        EngineError::Connection { .. } | EngineError::Timeout { .. }
                    ) {
                        self.quarantine(member);
                    }
                    round.fail(e);
                }
            }
        }

        let mut to_emit: Vec<(MemberId, Vec<ObjType>)> = Vec::new();
        for rt in &mut self.members {
            if rt.quarantined {
                continue;
            }
            let id = rt.id();
            let mut written: Vec<ObjType> = Vec::new();
            for (objtype, sink) in &mut rt.sinks {
                sink.set_state(SinkState::Connected);
                written.push(objtype.clone());
            }
            to_emit.push((id, written));
        }
        for (id, written) in to_emit {
            for objtype in written {
                self.emit_member(id, Some(objtype), MemberEvent::Written, None);
            }
        }

        if round.commit_failures == 0 {
            self.emit_engine(EngineEvent::Written, None);
        }
    }

    async fn phase_sync_done(&mut self, round: &mut Round) {
        self.state = EngineState::SyncDone;

        type DoneOutcome = (Option<ObjType>, Result<(), EngineError>);
        let results: Vec<(usize, Vec<DoneOutcome>)> = join_all(
            self.members
                .iter()
                .enumerate()
                .filter(|(_, rt)| !rt.quarantined)
                .map(|(i, rt)| async move {
                    let mut outcomes: Vec<DoneOutcome> = Vec::new();
                    let mut targets: Vec<Option<ObjType>> =
                        rt.sinks.keys().cloned().map(Some).collect();
                    targets.push(None);
                    for objtype in targets {
                        if rt.proxy.state() == ProxyState::Error {
                            outcomes.push((
                                objtype,
                                Err(EngineError::Connection {
                                    member: rt.id(),
                                    message: "sync_done skipped, connection lost".into(),
                                }),
                            ));
                            continue;
                        }
                        let result = rt
                            .proxy
                            .send_request(Request::SyncDone {
                                objtype: objtype.clone(),
                            })
                            .await;
                        outcomes.push((
                            objtype,
                            result
                                .map(|_| ())
                                .map_err(|e| EngineError::from_proxy(rt.id(), "sync_done", e)),
                        ));
                    }
                    (i, outcomes)
                }),
        )
        .await;

        for (i, outcomes) in results {
            let id = self.members[i].id();
            let mut member_ok = true;
            for (objtype, outcome) in outcomes {
                match outcome {
                    Ok(()) => {
                        if let Some(t) = &objtype {
                            if let Some(sink) = self.members[i].sinks.get_mut(t) {
                                sink.set_state(SinkState::Done);
                            }
                        }
                        self.emit_member(id, objtype, MemberEvent::SyncDone, None);
                    }
                    Err(e) => {
                        member_ok = false;
                        round.sync_done_failures += 1;
                        self.emit_member(id, objtype, MemberEvent::Error, Some(e.to_string()));
                        round.fail(e);
                    }
                }
            }

            // Persist anchors and hashes only for members whose sync-done
            // went through; the others will slow-sync next round.
            if member_ok {
                let anchor = Self::member_anchor(&self.members[i].member);
                let objtypes: Vec<ObjType> = self.members[i].sinks.keys().cloned().collect();
                for objtype in objtypes {
                    let updates = self
                        .tables
                        .get(&objtype)
                        .map(|t| t.hash_updates(id))
                        .unwrap_or_default();
                    let store = &self.members[i].store;
                    if let Err(e) = store
                        .set_anchor(&objtype, &anchor)
                        .and_then(|()| store.update_hashes(&objtype, &updates))
                    {
                        warn!(member = %id, %objtype, "failed to persist sync state: {e}");
                        round.fail(e.into());
                    }
                }
            }
        }

        if round.sync_done_failures == 0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            self.group.set_last_sync(now);
            if let Err(e) = self.group.save() {
                warn!("failed to persist group after sync: {e}");
                round.fail(e.into());
            }
            self.emit_engine(EngineEvent::SyncDone, None);
        }
    }

    async fn phase_disconnect(&mut self, round: &mut Round) {
        self.state = EngineState::Disconnecting;

        type DiscOutcome = (Option<ObjType>, Result<(), EngineError>);
        let results: Vec<(usize, Vec<DiscOutcome>)> =
            join_all(self.members.iter().enumerate().map(|(i, rt)| async move {
                let mut outcomes: Vec<DiscOutcome> = Vec::new();
                // Per-type sinks go down first, the main sink last, and
                // only what actually connected this round.
                for (objtype, sink) in &rt.sinks {
                    if !sink.was_connected() {
                        continue;
                    }
                    let result = rt
                        .proxy
                        .send_request(Request::Disconnect {
                            objtype: Some(objtype.clone()),
                        })
                        .await;
                    outcomes.push((
                        Some(objtype.clone()),
                        result
                            .map(|_| ())
                            .map_err(|e| EngineError::from_proxy(rt.id(), "disconnect", e)),
                    ));
                }
                if rt.main_sink.was_connected() {
                    let result = rt
                        .proxy
                        .send_request(Request::Disconnect { objtype: None })
                        .await;
                    outcomes.push((
                        None,
                        result
                            .map(|_| ())
                            .map_err(|e| EngineError::from_proxy(rt.id(), "disconnect", e)),
                    ));
                }
                (i, outcomes)
            }))
            .await;

        for (i, outcomes) in results {
            let id = self.members[i].id();
            for (objtype, outcome) in outcomes {
                match outcome {
                    Ok(()) => {
                        match &objtype {
                            None => self.members[i].main_sink.set_state(SinkState::Unconnected),
                            Some(t) => {
                                if let Some(sink) = self.members[i].sinks.get_mut(t) {
                                    sink.set_state(SinkState::Unconnected);
                                }
                            }
                        }
                        self.emit_member(id, objtype, MemberEvent::Disconnected, None);
                    }
                    Err(e) => {
                        // Teardown failures never block the rest of the
                        // teardown, but they do fail the round.
                        warn!(member = %id, "disconnect failed: {e}");
                        self.emit_member(id, objtype, MemberEvent::Error, Some(e.to_string()));
                        round.fail(e);
                    }
                }
            }
        }

        if round.engine_connected {
            self.emit_engine(EngineEvent::Disconnected, None);
        }
    }

    // ── Event emission ───────────────────────────────────────────

    fn conflict_info(&self, objtype: &ObjType, id: MappingId) -> Option<ConflictInfo> {
        let table = self.tables.get(objtype)?;
        let mapping = table.mapping(id)?;
        let entries = mapping
            .entries
            .iter()
            .filter_map(|e| {
                e.change.as_ref().map(|change| ConflictEntry {
                    member: e.member,
                    change: change.clone(),
                })
            })
            .collect();
        Some(ConflictInfo {
            session: self.session,
            mapping: id,
            objtype: objtype.clone(),
            entries,
        })
    }

    fn emit_member(
        &self,
        member: MemberId,
        objtype: Option<ObjType>,
        event: MemberEvent,
        error: Option<String>,
    ) {
        self.callbacks.emit_member(MemberUpdate {
            session: self.session,
            member,
            objtype,
            event,
            error,
        });
    }

    fn emit_engine(&self, event: EngineEvent, error: Option<String>) {
        self.callbacks.emit_engine(EngineUpdate {
            session: self.session,
            event,
            error,
        });
    }

    fn emit_change(
        &self,
        member: MemberId,
        change: &Change,
        mapping: Option<MappingId>,
        event: ChangeEvent,
        error: Option<String>,
    ) {
        self.callbacks.emit_change(ChangeUpdate {
            session: self.session,
            member,
            objtype: change.objtype.clone(),
            uid: change.uid.clone(),
            mapping,
            event,
            error,
        });
    }

    fn emit_mapping(
        &self,
        mapping: MappingId,
        objtype: &ObjType,
        winner: Option<MemberId>,
        event: MappingEvent,
        error: Option<String>,
    ) {
        self.callbacks.emit_mapping(MappingUpdate {
            session: self.session,
            mapping,
            objtype: objtype.clone(),
            winner,
            event,
            error,
        });
    }
}
