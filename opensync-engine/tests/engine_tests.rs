use opensync_engine::{
    ChangeEvent, ChangeUpdate, Engine, EngineConfig, EngineError, EngineEvent, EngineUpdate,
    MappingEvent, MappingUpdate, MemberEvent, MemberUpdate,
};
use opensync_format::{FormatRegistry, PlainFormat};
use opensync_group::{ConflictPolicy, Group};
use opensync_plugin::mock::{Fault, MockPlugin, Phase};
use opensync_plugin::PluginRegistry;
use opensync_types::{Change, ChangeKind, MemberId, ObjType};
use std::sync::{Arc, Mutex};

fn contact() -> ObjType {
    ObjType::new("contact")
}

fn added(uid: &str, payload: &[u8]) -> Change {
    Change::new(uid, "contact", ChangeKind::Added, "plain", payload.to_vec())
}

#[derive(Default)]
struct Events {
    member: Mutex<Vec<MemberUpdate>>,
    engine: Mutex<Vec<EngineUpdate>>,
    change: Mutex<Vec<ChangeUpdate>>,
    mapping: Mutex<Vec<MappingUpdate>>,
}

impl Events {
    fn install(self: &Arc<Self>, engine: &mut Engine) {
        let e = self.clone();
        engine.set_member_status_callback(move |u| e.member.lock().unwrap().push(u.clone()));
        let e = self.clone();
        engine.set_engine_status_callback(move |u| e.engine.lock().unwrap().push(u.clone()));
        let e = self.clone();
        engine.set_change_status_callback(move |u| e.change.lock().unwrap().push(u.clone()));
        let e = self.clone();
        engine.set_mapping_status_callback(move |u| e.mapping.lock().unwrap().push(u.clone()));
    }

    fn engine_count(&self, event: EngineEvent) -> usize {
        self.engine.lock().unwrap().iter().filter(|u| u.event == event).count()
    }

    fn member_count(&self, member: MemberId, event: MemberEvent) -> usize {
        self.member
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.member == member && u.event == event)
            .count()
    }

    fn change_count(&self, event: ChangeEvent) -> usize {
        self.change.lock().unwrap().iter().filter(|u| u.event == event).count()
    }

    fn mapping_count(&self, event: MappingEvent) -> usize {
        self.mapping.lock().unwrap().iter().filter(|u| u.event == event).count()
    }
}

struct Fixture {
    engine: Engine,
    plugins: Vec<Arc<MockPlugin>>,
    members: Vec<MemberId>,
    events: Arc<Events>,
    _dir: tempfile::TempDir,
}

fn fixture_with_policy(num_members: usize, policy: ConflictPolicy) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut group = Group::create(dir.path(), "testgroup").unwrap();
    group.set_conflict_policy(policy);

    let mut registry = PluginRegistry::new();
    let mut plugins = Vec::new();
    let mut members = Vec::new();
    for i in 0..num_members {
        let plugin = MockPlugin::new([contact()]);
        let name = format!("mock-{i}");
        registry.register_instance(name.clone(), plugin.clone());
        members.push(group.add_member(name, "", vec![]));
        plugins.push(plugin);
    }
    group.save().unwrap();

    let mut formats = FormatRegistry::new();
    formats.register("contact", Arc::new(PlainFormat));

    let mut engine = Engine::new(group, registry, formats, EngineConfig::default());
    let events = Arc::new(Events::default());
    events.install(&mut engine);
    Fixture {
        engine,
        plugins,
        members,
        events,
        _dir: dir,
    }
}

fn fixture(num_members: usize) -> Fixture {
    fixture_with_policy(num_members, ConflictPolicy::Interactive)
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn initialize_discovers_active_objtypes() {
    let mut f = fixture(2);
    f.engine.initialize().await.unwrap();
    assert_eq!(f.engine.active_objtypes(), &[contact()]);
    assert_eq!(f.events.member_count(f.members[0], MemberEvent::Discovered), 1);
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn initialize_requires_two_members() {
    let mut f = fixture(1);
    let err = f.engine.initialize().await.unwrap_err();
    assert!(matches!(err, EngineError::Misconfiguration(_)));
}

#[tokio::test]
async fn double_initialize_is_rejected() {
    let mut f = fixture(2);
    f.engine.initialize().await.unwrap();
    let err = f.engine.initialize().await.unwrap_err();
    assert!(matches!(err, EngineError::ProtocolViolation(_)));
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn synchronize_requires_initialize() {
    let mut f = fixture(2);
    let err = f.engine.synchronize().await.unwrap_err();
    assert!(matches!(err, EngineError::ProtocolViolation(_)));
}

#[tokio::test]
async fn group_lock_refuses_second_engine() {
    let mut f = fixture(2);
    f.engine.initialize().await.unwrap();

    let group = Group::load(f._dir.path()).unwrap();
    let mut other = Engine::new(
        group,
        PluginRegistry::new(),
        FormatRegistry::new(),
        EngineConfig::default(),
    );
    let err = other.initialize().await.unwrap_err();
    assert!(matches!(err, EngineError::Group(_)));

    f.engine.finalize().await.unwrap();

    // Lock released by finalize; a fresh engine may take over now.
    let group = Group::load(f._dir.path()).unwrap();
    let mut registry = PluginRegistry::new();
    for (i, plugin) in f.plugins.iter().enumerate() {
        registry.register_instance(format!("mock-{i}"), plugin.clone());
    }
    let mut formats = FormatRegistry::new();
    formats.register("contact", Arc::new(PlainFormat));
    let mut third = Engine::new(group, registry, formats, EngineConfig::default());
    third.initialize().await.unwrap();
    third.finalize().await.unwrap();
}

// ── Basic rounds ─────────────────────────────────────────────────

#[tokio::test]
async fn identical_entries_produce_no_commits() {
    let mut f = fixture(2);
    f.plugins[0].seed_entry(&contact(), "X", b"same-content");
    f.plugins[1].seed_entry(&contact(), "X", b"same-content");

    f.engine.initialize().await.unwrap();
    let report = f.engine.synchronize().await.unwrap();

    assert_eq!(report.commits, 0);
    assert_eq!(report.conflicts, 0);
    assert!(f.plugins[0].committed().is_empty());
    assert!(f.plugins[1].committed().is_empty());
    assert_eq!(f.events.mapping_count(MappingEvent::Solved), 1);
    assert_eq!(f.events.engine_count(EngineEvent::Successful), 1);
    assert_eq!(f.events.engine_count(EngineEvent::Error), 0);
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn new_entry_propagates_to_other_member() {
    let mut f = fixture(2);
    f.plugins[0].seed_entry(&contact(), "X", b"only-on-first");

    f.engine.initialize().await.unwrap();
    let report = f.engine.synchronize().await.unwrap();

    assert_eq!(report.commits, 1);
    assert_eq!(
        f.plugins[1].entry(&contact(), "X"),
        Some(b"only-on-first".to_vec())
    );
    assert_eq!(f.events.change_count(ChangeEvent::Written), 1);
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn mismatch_conflict_invokes_handler_exactly_once() {
    let mut f = fixture(2);
    f.plugins[0].seed_entry(&contact(), "X", b"aaa");
    f.plugins[1].seed_entry(&contact(), "X", b"bb-bbb");

    let invocations = Arc::new(Mutex::new(Vec::new()));
    let seen = invocations.clone();
    f.engine.set_conflict_callback(move |handle, info| {
        seen.lock().unwrap().push(info.clone());
        let winner = info.entries[0].member;
        handle.solve(info.mapping, winner);
    });

    f.engine.initialize().await.unwrap();
    let report = f.engine.synchronize().await.unwrap();

    let seen = invocations.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].entries.len(), 2);
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.commits, 1);
    assert_eq!(f.plugins[1].entry(&contact(), "X"), Some(b"aaa".to_vec()));
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn same_same_different_is_not_a_conflict() {
    // Members 1 and 2 carry identical content, member 3 a diverged copy of
    // the same length (Similar under the plain format). The conflict
    // handler must never fire; the majority content is propagated.
    let mut f = fixture(3);
    f.plugins[0].seed_entry(&contact(), "X", b"agreed");
    f.plugins[1].seed_entry(&contact(), "X", b"agreed");
    f.plugins[2].seed_entry(&contact(), "X", b"differ");

    f.engine.set_conflict_callback(|_, info| {
        panic!("conflict handler fired for mapping {}", info.mapping);
    });

    f.engine.initialize().await.unwrap();
    let report = f.engine.synchronize().await.unwrap();

    assert_eq!(report.conflicts, 0);
    assert_eq!(report.commits, 1);
    assert_eq!(f.plugins[2].entry(&contact(), "X"), Some(b"agreed".to_vec()));
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn choose_newest_picks_by_revision() {
    let mut f = fixture_with_policy(2, ConflictPolicy::PickNewest);
    f.plugins[0].seed_entry(&contact(), "X", b"rev=100");
    f.plugins[1].seed_entry(&contact(), "X", b"rev=200");

    f.engine.initialize().await.unwrap();
    let report = f.engine.synchronize().await.unwrap();

    assert_eq!(report.commits, 1);
    assert_eq!(f.plugins[0].entry(&contact(), "X"), Some(b"rev=200".to_vec()));
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn choose_member_policy_prefers_configured_member() {
    let mut f = fixture_with_policy(2, ConflictPolicy::PickMember(MemberId::new(2)));
    f.plugins[0].seed_entry(&contact(), "X", b"aaa");
    f.plugins[1].seed_entry(&contact(), "X", b"bb-bbb");

    f.engine.initialize().await.unwrap();
    f.engine.synchronize().await.unwrap();

    assert_eq!(f.plugins[0].entry(&contact(), "X"), Some(b"bb-bbb".to_vec()));
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn duplicate_policy_keeps_both_contents() {
    let mut f = fixture_with_policy(2, ConflictPolicy::Duplicate);
    f.plugins[0].seed_entry(&contact(), "X", b"aaa");
    f.plugins[1].seed_entry(&contact(), "X", b"bbb");

    f.engine.initialize().await.unwrap();
    f.engine.synchronize().await.unwrap();

    // Both members end with the winning content under the original uid and
    // the diverged content under the duplicated uid.
    assert_eq!(f.plugins[0].entry(&contact(), "X"), Some(b"aaa".to_vec()));
    assert_eq!(f.plugins[1].entry(&contact(), "X"), Some(b"aaa".to_vec()));
    assert_eq!(f.plugins[0].entry(&contact(), "X-dupe"), Some(b"bbb".to_vec()));
    assert_eq!(f.plugins[1].entry(&contact(), "X-dupe"), Some(b"bbb".to_vec()));
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn deletion_propagates_on_later_round() {
    let mut f = fixture(2);
    f.plugins[0].seed_entry(&contact(), "X", b"shared");
    f.plugins[1].seed_entry(&contact(), "X", b"shared");

    f.engine.initialize().await.unwrap();
    f.engine.synchronize().await.unwrap();
    assert_eq!(f.plugins[1].entry_count(&contact()), 1);

    // Second round: the first member deleted the entry, the second
    // reports nothing. The hash store knows the second member holds the
    // entry, so the deletion is written there.
    f.plugins[0].stage_change(Change::deleted("X", "contact"));
    let report = f.engine.synchronize().await.unwrap();

    assert_eq!(report.commits, 1);
    assert_eq!(f.plugins[1].entry(&contact(), "X"), None);
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn modification_propagates_incrementally() {
    let mut f = fixture(2);
    f.plugins[0].seed_entry(&contact(), "X", b"version-one");
    f.plugins[1].seed_entry(&contact(), "X", b"version-one");

    f.engine.initialize().await.unwrap();
    f.engine.synchronize().await.unwrap();

    f.plugins[0].stage_change(Change::new(
        "X",
        "contact",
        ChangeKind::Modified,
        "plain",
        b"version-two".to_vec(),
    ));
    let report = f.engine.synchronize().await.unwrap();

    assert_eq!(report.commits, 1);
    assert_eq!(
        f.plugins[1].entry(&contact(), "X"),
        Some(b"version-two".to_vec())
    );
    let committed = f.plugins[1].committed();
    assert_eq!(committed.last().unwrap().kind, ChangeKind::Modified);
    f.engine.finalize().await.unwrap();
}

// ── Idempotent re-sync (anchors and hashes) ──────────────────────

#[tokio::test]
async fn repeated_rounds_are_idempotent() {
    let mut f = fixture(2);
    f.plugins[0].seed_entry(&contact(), "A", b"short");
    f.plugins[1].seed_entry(&contact(), "B", b"quite-a-bit-longer");

    f.engine.initialize().await.unwrap();
    let first = f.engine.synchronize().await.unwrap();
    assert_eq!(first.commits, 2);

    for _ in 0..2 {
        let report = f.engine.synchronize().await.unwrap();
        assert_eq!(report.commits, 0);
        assert_eq!(report.conflicts, 0);
    }
    assert_eq!(f.plugins[0].entry_count(&contact()), 2);
    assert_eq!(f.plugins[1].entry_count(&contact()), 2);
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn thousand_round_stress_loop() {
    let mut f = fixture(2);
    f.plugins[0].seed_entry(&contact(), "X", b"stable");
    f.plugins[1].seed_entry(&contact(), "X", b"stable");

    f.engine.initialize().await.unwrap();
    for i in 0..1000 {
        let report = f.engine.synchronize().await.unwrap();
        assert_eq!(report.conflicts, 0, "conflict in round {i}");
        assert_eq!(report.commits, 0, "commit in round {i}");
    }
    f.engine.finalize().await.unwrap();
}

// ── Phase ordering (request-log audit) ───────────────────────────

#[tokio::test(start_paused = true)]
async fn phase_requests_are_ordered_per_member() {
    let mut f = fixture(3);
    f.plugins[0].seed_entry(&contact(), "A", b"a");
    f.plugins[1].seed_entry(&contact(), "B", b"bbbb");
    f.plugins[2].seed_entry(&contact(), "C", b"ccccccc");
    // Skew the members' reply timing so their phases interleave on the
    // wall clock.
    f.plugins[1].set_fault(Phase::Connect, Some(contact()), Fault::Delay(200));
    f.plugins[2].set_fault(Phase::GetChanges, Some(contact()), Fault::Delay(500));

    f.engine.initialize().await.unwrap();
    f.engine.synchronize().await.unwrap();

    for &member in &f.members {
        let log = f.engine.request_log(member).unwrap();
        let indices: Vec<u8> = log.iter().filter_map(|r| r.phase_index).collect();
        assert!(!indices.is_empty());
        assert!(
            indices.windows(2).all(|w| w[0] <= w[1]),
            "member {member} sent phases out of order: {indices:?}"
        );
    }
    f.engine.finalize().await.unwrap();
}

// ── Batch commit ─────────────────────────────────────────────────

#[tokio::test]
async fn batch_commit_signal_is_sent_and_state_converges() {
    let dir = tempfile::tempdir().unwrap();
    let mut group = Group::create(dir.path(), "batchgroup").unwrap();
    let mut registry = PluginRegistry::new();
    let mut plugins = Vec::new();
    for i in 0..2 {
        let plugin = MockPlugin::with_batch_commit([contact()]);
        registry.register_instance(format!("mock-{i}"), plugin.clone());
        group.add_member(format!("mock-{i}"), "", vec![]);
        plugins.push(plugin);
    }
    group.save().unwrap();
    let mut formats = FormatRegistry::new();
    formats.register("contact", Arc::new(PlainFormat));
    let mut engine = Engine::new(group, registry, formats, EngineConfig::default());

    plugins[0].seed_entry(&contact(), "X", b"payload");
    engine.initialize().await.unwrap();
    let report = engine.synchronize().await.unwrap();

    assert_eq!(report.commits, 1);
    assert_eq!(plugins[1].entry(&contact(), "X"), Some(b"payload".to_vec()));
    // Both batch-capable members got the completion signal for their sink.
    for plugin in &plugins {
        assert!(plugin
            .invocations()
            .iter()
            .any(|i| i.phase == Phase::CommittedAll));
    }
    engine.finalize().await.unwrap();
}

// ── Unclean shutdown detection ───────────────────────────────────

#[tokio::test]
async fn stale_lock_forces_slow_sync_once() {
    let mut f = fixture(2);
    std::fs::write(f._dir.path().join("lock"), b"").unwrap();

    f.engine.initialize().await.unwrap();
    f.engine.synchronize().await.unwrap();
    assert_eq!(f.events.engine_count(EngineEvent::PrevUnclean), 1);

    f.engine.synchronize().await.unwrap();
    // Only the first round after the unclean shutdown reports it.
    assert_eq!(f.events.engine_count(EngineEvent::PrevUnclean), 1);
    f.engine.finalize().await.unwrap();
}

// ── Interactive resolution from another task ─────────────────────

#[tokio::test]
async fn conflict_can_be_solved_from_a_spawned_task() {
    let mut f = fixture(2);
    f.plugins[0].seed_entry(&contact(), "X", b"aaa");
    f.plugins[1].seed_entry(&contact(), "X", b"bb-bbb");

    f.engine.set_conflict_callback(move |handle, info| {
        // Decide later, elsewhere; the engine suspends without blocking.
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            handle.solve(info.mapping, info.entries[1].member);
        });
    });

    f.engine.initialize().await.unwrap();
    let report = f.engine.synchronize().await.unwrap();
    assert_eq!(report.commits, 1);
    assert_eq!(f.plugins[0].entry(&contact(), "X"), Some(b"bb-bbb".to_vec()));
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn abort_from_conflict_handler_cleans_up() {
    let mut f = fixture(2);
    f.plugins[0].seed_entry(&contact(), "X", b"aaa");
    f.plugins[1].seed_entry(&contact(), "X", b"bb-bbb");

    f.engine.set_conflict_callback(|handle, _| handle.abort());

    f.engine.initialize().await.unwrap();
    let err = f.engine.synchronize().await.unwrap_err();
    assert!(matches!(err, EngineError::Aborted));

    // Everything that connected was still torn down.
    for &member in &f.members {
        assert_eq!(f.events.member_count(member, MemberEvent::Disconnected), 2);
    }
    assert_eq!(f.events.engine_count(EngineEvent::Error), 1);
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn premature_solve_is_round_fatal() {
    let mut f = fixture(2);
    let handle = Arc::new(Mutex::new(None));
    let slot = handle.clone();

    f.engine.initialize().await.unwrap();
    *handle.lock().unwrap() = Some(f.engine.handle());

    // A solve issued while the engine is still connecting is a premature
    // resolution and must kill the round.
    let events = f.events.clone();
    let fired = Arc::new(Mutex::new(false));
    let fired2 = fired.clone();
    f.engine.set_member_status_callback(move |u| {
        events.member.lock().unwrap().push(u.clone());
        if u.event == MemberEvent::Connected {
            let mut fired = fired2.lock().unwrap();
            if !*fired {
                *fired = true;
                if let Some(handle) = slot.lock().unwrap().as_ref() {
                    handle.solve(opensync_types::MappingId::new(1), MemberId::new(1));
                }
            }
        }
    });

    let err = f.engine.synchronize().await.unwrap_err();
    assert!(matches!(err, EngineError::PrematureResolution(_)));
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn call_plugin_round_trips_through_the_proxy() {
    let mut f = fixture(2);
    f.engine.initialize().await.unwrap();

    let reply = f
        .engine
        .call_plugin(f.members[0], "ping", b"abc")
        .await
        .unwrap();
    assert_eq!(reply, b"ping:abc");

    let err = f
        .engine
        .call_plugin(MemberId::new(42), "ping", b"")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Misconfiguration(_)));
    f.engine.finalize().await.unwrap();
}

#[tokio::test]
async fn interactive_policy_without_handler_fails_round() {
    let mut f = fixture(2);
    f.plugins[0].seed_entry(&contact(), "X", b"aaa");
    f.plugins[1].seed_entry(&contact(), "X", b"bb-bbb");

    f.engine.initialize().await.unwrap();
    let err = f.engine.synchronize().await.unwrap_err();
    assert!(matches!(err, EngineError::Misconfiguration(_)));
    f.engine.finalize().await.unwrap();
}
