use opensync_group::{ConflictPolicy, Group, GroupError, GroupLock, MemberStore};
use opensync_types::{MemberId, ObjType};

fn contact() -> ObjType {
    ObjType::new("contact")
}

// ── Group persistence ────────────────────────────────────────────

#[test]
fn create_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut group = Group::create(dir.path(), "pim").unwrap();
    group.add_member("evolution", "cfg-a", vec![contact()]);
    group.add_member("irmc", "cfg-b", vec![]);
    group.set_conflict_policy(ConflictPolicy::PickNewest);
    group.save().unwrap();

    let loaded = Group::load(dir.path()).unwrap();
    assert_eq!(loaded.name(), "pim");
    assert_eq!(loaded.num_members(), 2);
    assert_eq!(loaded.conflict_policy(), ConflictPolicy::PickNewest);
    assert_eq!(loaded.members()[0].plugin_name, "evolution");
    assert_eq!(loaded.members()[0].objtypes, vec![contact()]);
    assert_eq!(loaded.members()[1].config, "cfg-b");
}

#[test]
fn member_ids_are_stable_and_increasing() {
    let dir = tempfile::tempdir().unwrap();
    let mut group = Group::create(dir.path(), "g").unwrap();
    let a = group.add_member("p1", "", vec![]);
    let b = group.add_member("p2", "", vec![]);
    assert_eq!(a, MemberId::new(1));
    assert_eq!(b, MemberId::new(2));

    group.remove_member(a).unwrap();
    let c = group.add_member("p3", "", vec![]);
    // Ids are never reused.
    assert_eq!(c, MemberId::new(3));
}

#[test]
fn remove_member_deletes_its_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut group = Group::create(dir.path(), "g").unwrap();
    let a = group.add_member("p1", "", vec![]);
    group.add_member("p2", "", vec![]);
    group.save().unwrap();

    let member_dir = dir.path().join("member-1");
    assert!(member_dir.exists());

    group.remove_member(a).unwrap();
    assert!(!member_dir.exists());
    assert_eq!(group.num_members(), 1);
}

#[test]
fn remove_unknown_member_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut group = Group::create(dir.path(), "g").unwrap();
    let err = group.remove_member(MemberId::new(9)).unwrap_err();
    assert!(matches!(err, GroupError::MemberNotFound(_)));
}

#[test]
fn last_sync_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let mut group = Group::create(dir.path(), "g").unwrap();
    assert_eq!(group.last_sync(), None);
    group.set_last_sync(1_700_000_000_000);
    group.save().unwrap();

    let loaded = Group::load(dir.path()).unwrap();
    assert_eq!(loaded.last_sync(), Some(1_700_000_000_000));
}

#[test]
fn delete_removes_configdir() {
    let dir = tempfile::tempdir().unwrap();
    let configdir = dir.path().join("group");
    let group = Group::create(&configdir, "g").unwrap();
    assert!(configdir.exists());
    group.delete().unwrap();
    assert!(!configdir.exists());
}

// ── Locking ──────────────────────────────────────────────────────

#[test]
fn second_lock_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let _held = GroupLock::acquire(dir.path()).unwrap();
    let err = GroupLock::acquire(dir.path()).unwrap_err();
    assert!(matches!(err, GroupError::Locked(_)));
}

#[test]
fn lock_is_released_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    {
        let _held = GroupLock::acquire(dir.path()).unwrap();
    }
    let relock = GroupLock::acquire(dir.path()).unwrap();
    // Clean release removed the file, so this is not an unclean restart.
    assert!(!relock.was_unclean());
}

#[test]
fn stale_lock_file_reports_unclean() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lock"), b"").unwrap();

    let lock = GroupLock::acquire(dir.path()).unwrap();
    assert!(lock.was_unclean());
}

// ── Member store: anchors ────────────────────────────────────────

#[test]
fn anchor_round_trip() {
    let store = MemberStore::open_in_memory().unwrap();
    assert_eq!(store.anchor(&contact()).unwrap(), None);

    store.set_anchor(&contact(), "anchor-1").unwrap();
    assert_eq!(store.anchor(&contact()).unwrap(), Some("anchor-1".into()));

    store.set_anchor(&contact(), "anchor-2").unwrap();
    assert_eq!(store.anchor(&contact()).unwrap(), Some("anchor-2".into()));
}

#[test]
fn anchor_mismatch_detection() {
    let store = MemberStore::open_in_memory().unwrap();
    // Nothing stored yet: not a mismatch (first sync is slow anyway).
    assert!(!store.anchor_mismatch(&contact(), "a").unwrap());

    store.set_anchor(&contact(), "a").unwrap();
    assert!(!store.anchor_mismatch(&contact(), "a").unwrap());
    assert!(store.anchor_mismatch(&contact(), "b").unwrap());
}

#[test]
fn anchors_are_scoped_per_objtype() {
    let store = MemberStore::open_in_memory().unwrap();
    store.set_anchor(&contact(), "a").unwrap();
    assert_eq!(store.anchor(&ObjType::new("event")).unwrap(), None);
}

// ── Member store: hashes ─────────────────────────────────────────

#[test]
fn hashes_round_trip() {
    let store = MemberStore::open_in_memory().unwrap();
    store
        .update_hashes(
            &contact(),
            &[
                ("a".into(), Some("h1".into())),
                ("b".into(), Some("h2".into())),
            ],
        )
        .unwrap();

    let hashes = store.load_hashes(&contact()).unwrap();
    assert_eq!(hashes.len(), 2);
    assert_eq!(hashes.get("a"), Some(&"h1".to_string()));
}

#[test]
fn hash_update_overwrites_and_deletes() {
    let store = MemberStore::open_in_memory().unwrap();
    store
        .update_hashes(&contact(), &[("a".into(), Some("h1".into()))])
        .unwrap();
    store
        .update_hashes(
            &contact(),
            &[("a".into(), Some("h2".into())), ("b".into(), None)],
        )
        .unwrap();

    let hashes = store.load_hashes(&contact()).unwrap();
    assert_eq!(hashes.get("a"), Some(&"h2".to_string()));

    store.update_hashes(&contact(), &[("a".into(), None)]).unwrap();
    assert!(store.load_hashes(&contact()).unwrap().is_empty());
}

#[test]
fn store_persists_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = MemberStore::open(dir.path()).unwrap();
        store.set_anchor(&contact(), "anchor").unwrap();
        store
            .update_hashes(&contact(), &[("a".into(), Some("h1".into()))])
            .unwrap();
    }
    let store = MemberStore::open(dir.path()).unwrap();
    assert_eq!(store.anchor(&contact()).unwrap(), Some("anchor".into()));
    assert_eq!(store.load_hashes(&contact()).unwrap().len(), 1);
}
