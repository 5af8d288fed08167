//! Per-objtype collection barrier for reported changes.
//!
//! Mapping decisions need a complete cross-member snapshot, so changes are
//! buffered here until every active member's sink for an object type has
//! reported — successfully or with a tolerated failure. A failed member
//! does not hold the barrier back; it degrades the round and is excluded
//! from commit scheduling instead.

use opensync_types::{Change, ChangeKind, MemberId, ObjType};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct ObjTypeBucket {
    expected: BTreeSet<MemberId>,
    reported: BTreeSet<MemberId>,
    failed: BTreeSet<MemberId>,
    changes: Vec<(MemberId, Change)>,
    seen: HashSet<(MemberId, String, String)>,
}

/// Buffers get-changes results per object type until the barrier.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    buckets: HashMap<ObjType, ObjTypeBucket>,
    degraded: bool,
}

impl ChangeTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares which members are expected to report for an object type
    /// this round.
    pub fn expect(&mut self, objtype: ObjType, members: impl IntoIterator<Item = MemberId>) {
        let bucket = self.buckets.entry(objtype).or_default();
        bucket.expected.extend(members);
    }

    /// Records one reported change. Idempotent under redelivery: the same
    /// (member, uid, hash) is dropped. Unmodified reports are kept out of
    /// the buffer entirely; they carry no mapping work.
    pub fn record(&mut self, member: MemberId, change: Change) {
        if change.kind == ChangeKind::Unmodified {
            trace!(%member, uid = %change.uid, "dropping unmodified change");
            return;
        }
        let bucket = self.buckets.entry(change.objtype.clone()).or_default();
        let key = (member, change.uid.clone(), change.hash.clone());
        if !bucket.seen.insert(key) {
            trace!(%member, uid = %change.uid, "duplicate change dropped");
            return;
        }
        bucket.changes.push((member, change));
    }

    /// Marks a member's get-changes for an object type as complete.
    pub fn mark_reported(&mut self, objtype: &ObjType, member: MemberId) {
        if let Some(bucket) = self.buckets.get_mut(objtype) {
            bucket.reported.insert(member);
        }
    }

    /// Marks a member's get-changes for an object type as failed. The
    /// barrier still releases for the others; the round is degraded.
    pub fn mark_failed(&mut self, objtype: &ObjType, member: MemberId) {
        if let Some(bucket) = self.buckets.get_mut(objtype) {
            bucket.failed.insert(member);
            debug!(%member, %objtype, "member failed get_changes, round degraded");
        }
        self.degraded = true;
    }

    /// True once every expected member for the object type has reported or
    /// failed.
    #[must_use]
    pub fn barrier_reached(&self, objtype: &ObjType) -> bool {
        self.buckets.get(objtype).is_some_and(|bucket| {
            bucket
                .expected
                .iter()
                .all(|m| bucket.reported.contains(m) || bucket.failed.contains(m))
        })
    }

    /// Members whose report failed for the object type.
    #[must_use]
    pub fn failed_members(&self, objtype: &ObjType) -> Vec<MemberId> {
        self.buckets
            .get(objtype)
            .map(|b| b.failed.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Takes the buffered changes for an object type. Only legal once the
    /// barrier is reached; the caller asserts that.
    pub fn take_changes(&mut self, objtype: &ObjType) -> Vec<(MemberId, Change)> {
        self.buckets
            .get_mut(objtype)
            .map(|b| std::mem::take(&mut b.changes))
            .unwrap_or_default()
    }

    /// True if any member failed to report this round.
    #[must_use]
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    /// Clears all per-round state.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.degraded = false;
    }
}
