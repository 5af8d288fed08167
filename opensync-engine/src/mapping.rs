//! Grouping of reported changes into cross-member mappings.
//!
//! A mapping is the set of changes — at most one per member — believed to
//! denote the same logical entry. Changes are mapped only after the object
//! type's barrier, in (uid, member) order, so the resulting grouping is a
//! pure function of the round's change set: reply interleaving can never
//! produce a different table.

use crate::error::{EngineError, EngineResult};
use opensync_format::{CmpResult, ObjFormat};
use opensync_types::{Change, ChangeKind, MappingId, MemberId, ObjType};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Resolution state of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Unsolved,
    Solved,
    Conflict,
}

/// One member's side of a mapping.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub member: MemberId,
    /// The member's reported change, or the change scheduled to be written
    /// to it. `None` only transiently while a mapping is being built.
    pub change: Option<Change>,
    /// True when this side must be committed to its member.
    pub dirty: bool,
    /// True once the commit was acknowledged.
    pub committed: bool,
}

/// A group of changes denoting one logical entry.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub id: MappingId,
    pub objtype: ObjType,
    pub state: MappingState,
    /// Entries ordered by member id.
    pub entries: Vec<MappingEntry>,
    /// Winning member once solved.
    pub master: Option<MemberId>,
    multiplied: bool,
}

impl Mapping {
    fn new(id: MappingId, objtype: ObjType) -> Self {
        Self {
            id,
            objtype,
            state: MappingState::Unsolved,
            entries: Vec::new(),
            master: None,
            multiplied: false,
        }
    }

    /// True if the mapping has an entry for the member.
    #[must_use]
    pub fn has_member(&self, member: MemberId) -> bool {
        self.entries.iter().any(|e| e.member == member)
    }

    /// The entry for a member, if present.
    #[must_use]
    pub fn entry(&self, member: MemberId) -> Option<&MappingEntry> {
        self.entries.iter().find(|e| e.member == member)
    }

    fn entry_mut(&mut self, member: MemberId) -> Option<&mut MappingEntry> {
        self.entries.iter_mut().find(|e| e.member == member)
    }

    fn push_entry(&mut self, member: MemberId, change: Option<Change>, dirty: bool) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.member > member)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            pos,
            MappingEntry {
                member,
                change,
                dirty,
                committed: false,
            },
        );
    }

    /// Smallest member id present, used by the similar-candidate tie-break.
    fn min_member(&self) -> Option<MemberId> {
        self.entries.first().map(|e| e.member)
    }
}

/// One commit the resolver scheduled toward a losing member.
#[derive(Debug, Clone)]
pub struct ScheduledCommit {
    pub member: MemberId,
    pub mapping: MappingId,
    pub change: Change,
}

/// The per-objtype mapping table.
pub struct MappingTable {
    objtype: ObjType,
    format: Arc<dyn ObjFormat>,
    /// Active members for this object type, sorted.
    members: Vec<MemberId>,
    mappings: Vec<Mapping>,
    next_id: u64,
}

impl MappingTable {
    /// Creates a table for one object type.
    pub fn new(
        objtype: ObjType,
        format: Arc<dyn ObjFormat>,
        members: impl IntoIterator<Item = MemberId>,
    ) -> Self {
        let mut members: Vec<MemberId> = members.into_iter().collect();
        members.sort_unstable();
        members.dedup();
        Self {
            objtype,
            format,
            members,
            mappings: Vec::new(),
            next_id: 1,
        }
    }

    /// The table's object type.
    #[must_use]
    pub fn objtype(&self) -> &ObjType {
        &self.objtype
    }

    /// The format implementation this table compares with.
    #[must_use]
    pub fn format(&self) -> Arc<dyn ObjFormat> {
        self.format.clone()
    }

    /// All mappings.
    #[must_use]
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Looks up a mapping by id.
    #[must_use]
    pub fn mapping(&self, id: MappingId) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.id == id)
    }

    /// Number of mappings still in conflict.
    #[must_use]
    pub fn num_conflicts(&self) -> usize {
        self.mappings
            .iter()
            .filter(|m| m.state == MappingState::Conflict)
            .count()
    }

    /// Drops all mappings; called when the round ends.
    pub fn clear(&mut self) {
        self.mappings.clear();
        self.next_id = 1;
    }

    /// Sets the first mapping id this table hands out. The engine gives
    /// each table a disjoint range so mapping ids are unique round-wide.
    pub fn set_first_id(&mut self, first: u64) {
        self.next_id = first;
    }

    /// The next mapping id this table would hand out.
    #[must_use]
    pub fn next_free_id(&self) -> u64 {
        self.next_id
    }

    // ── Grouping ─────────────────────────────────────────────────

    /// Assigns every buffered change to a mapping.
    ///
    /// Changes are sorted by (uid, member) first so that the grouping and
    /// the mapping ids are reproducible regardless of arrival order.
    pub fn map_changes(&mut self, mut changes: Vec<(MemberId, Change)>) {
        changes.sort_by(|(ma, ca), (mb, cb)| ca.uid.cmp(&cb.uid).then(ma.cmp(mb)));
        for (member, change) in changes {
            self.map_one(member, change);
        }
    }

    fn map_one(&mut self, member: MemberId, change: Change) {
        // Uid equivalence binds strongest: two members reporting the same
        // uid are talking about the same logical entry even when the
        // content diverged (that is exactly the conflicting case).
        if let Some(idx) = self.mappings.iter().position(|m| {
            m.state == MappingState::Unsolved
                && m.entries
                    .iter()
                    .any(|e| e.change.as_ref().is_some_and(|c| c.uid == change.uid))
        }) {
            let mapping = &mut self.mappings[idx];
            match mapping.entry_mut(member) {
                Some(entry) => entry.change = Some(change),
                None => mapping.push_entry(member, Some(change), false),
            }
            trace!(mapping = %mapping.id, %member, "change joined mapping by uid");
            return;
        }

        // Content scan over unsolved mappings that have no entry for this
        // member yet. A mapping qualifies only if no entry mismatches; one
        // Same entry attaches outright, otherwise the best Similar
        // candidate wins the documented tie-break (smallest member id
        // already present). Tombstones never group by content.
        let mut same_candidate: Option<usize> = None;
        let mut similar_candidates: Vec<usize> = Vec::new();

        if change.kind != ChangeKind::Deleted {
            for (idx, mapping) in self.mappings.iter().enumerate() {
                if mapping.state != MappingState::Unsolved || mapping.has_member(member) {
                    continue;
                }
                let mut saw_same = false;
                let mut saw_similar = false;
                let mut compatible = true;
                for entry in &mapping.entries {
                    let Some(other) = &entry.change else { continue };
                    if other.kind == ChangeKind::Deleted {
                        compatible = false;
                        break;
                    }
                    match self.format.compare(&change.payload, &other.payload) {
                        CmpResult::Same => saw_same = true,
                        CmpResult::Similar => saw_similar = true,
                        CmpResult::Mismatch => {
                            compatible = false;
                            break;
                        }
                    }
                }
                if !compatible {
                    continue;
                }
                if saw_same {
                    same_candidate.get_or_insert(idx);
                } else if saw_similar {
                    similar_candidates.push(idx);
                }
            }
        }

        let target = same_candidate.or_else(|| {
            similar_candidates
                .into_iter()
                .min_by_key(|&idx| self.mappings[idx].min_member())
        });

        match target {
            Some(idx) => {
                self.mappings[idx].push_entry(member, Some(change), false);
                trace!(mapping = %self.mappings[idx].id, %member, "change joined mapping by content");
            }
            None => {
                let id = MappingId::new(self.next_id);
                self.next_id += 1;
                let mut mapping = Mapping::new(id, self.objtype.clone());
                mapping.push_entry(member, Some(change), false);
                self.mappings.push(mapping);
                trace!(mapping = %id, %member, "new mapping");
            }
        }
    }

    // ── Conflict detection ───────────────────────────────────────

    /// True when two changes carry the same content. Tombstones only match
    /// tombstones.
    fn same_content(&self, a: &Change, b: &Change) -> bool {
        match (a.kind == ChangeKind::Deleted, b.kind == ChangeKind::Deleted) {
            (true, true) => true,
            (true, false) | (false, true) => false,
            (false, false) => {
                a.hash == b.hash
                    || self.format.compare(&a.payload, &b.payload) == CmpResult::Same
            }
        }
    }

    /// Groups a mapping's entries into content classes. Each class is a
    /// set of entry indices with identical content, ordered largest first,
    /// ties broken by smallest member id.
    fn content_classes(&self, mapping: &Mapping) -> Vec<Vec<usize>> {
        let mut classes: Vec<Vec<usize>> = Vec::new();
        for (idx, entry) in mapping.entries.iter().enumerate() {
            let Some(change) = &entry.change else { continue };
            let found = classes.iter_mut().find(|class| {
                let rep = &mapping.entries[class[0]];
                rep.change
                    .as_ref()
                    .is_some_and(|other| self.same_content(change, other))
            });
            match found {
                Some(class) => class.push(idx),
                None => classes.push(vec![idx]),
            }
        }
        classes.sort_by_key(|class| {
            (
                std::cmp::Reverse(class.len()),
                mapping.entries[class[0]].member,
            )
        });
        classes
    }

    /// Classifies every unsolved mapping after the barrier.
    ///
    /// One content class solves the mapping outright. A strict plurality
    /// class wins silently — identical entries on two members with a
    /// diverged third is a propagate, never a conflict. Only tied largest
    /// classes make a real conflict.
    ///
    /// Returns the ids of mappings now in conflict.
    pub fn check_conflicts(&mut self) -> Vec<MappingId> {
        let mut conflicts = Vec::new();
        for idx in 0..self.mappings.len() {
            if self.mappings[idx].state != MappingState::Unsolved {
                continue;
            }
            let classes = self.content_classes(&self.mappings[idx]);
            let mapping = &self.mappings[idx];
            let decided = match classes.len() {
                0 => Some(None),
                1 => Some(Some(mapping.entries[classes[0][0]].member)),
                _ if classes[0].len() > classes[1].len() => {
                    Some(Some(mapping.entries[classes[0][0]].member))
                }
                _ => None,
            };
            let mapping = &mut self.mappings[idx];
            match decided {
                Some(master) => {
                    mapping.state = MappingState::Solved;
                    mapping.master = master;
                    debug!(mapping = %mapping.id, ?master, "mapping solved");
                }
                None => {
                    mapping.state = MappingState::Conflict;
                    debug!(mapping = %mapping.id, entries = mapping.entries.len(), "mapping in conflict");
                    conflicts.push(mapping.id);
                }
            }
        }
        conflicts
    }

    // ── Resolution ───────────────────────────────────────────────

    /// Solves a conflicting mapping by declaring one member's entry the
    /// winner.
    pub fn solve(&mut self, id: MappingId, winner: MemberId) -> EngineResult<()> {
        let mapping = self
            .mappings
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| {
                EngineError::ProtocolViolation(format!("solve for unknown mapping {id}"))
            })?;
        if mapping.entry(winner).is_none() {
            return Err(EngineError::ProtocolViolation(format!(
                "solve for mapping {id}: member {winner} has no entry"
            )));
        }
        mapping.master = Some(winner);
        mapping.state = MappingState::Solved;
        debug!(mapping = %id, %winner, "mapping solved externally");
        Ok(())
    }

    /// Resolves a conflict by keeping every divergent content under a
    /// fresh uid: the class owning the smallest member id keeps the
    /// original mapping, every other class becomes a new mapping whose
    /// duplicated entry is added to all active members.
    pub fn duplicate(&mut self, id: MappingId) -> EngineResult<Vec<MappingId>> {
        let idx = self
            .mappings
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| {
                EngineError::ProtocolViolation(format!("duplicate for unknown mapping {id}"))
            })?;

        let classes = self.content_classes(&self.mappings[idx]);
        if classes.is_empty() {
            self.mappings[idx].state = MappingState::Solved;
            return Ok(Vec::new());
        }

        // The class containing the overall smallest member keeps the
        // original uid; re-sort so it leads.
        let mut classes = classes;
        let lead = classes
            .iter()
            .position(|class| {
                class
                    .iter()
                    .any(|&i| Some(self.mappings[idx].entries[i].member) == self.mappings[idx].min_member())
            })
            .unwrap_or(0);
        classes.swap(0, lead);

        let keeper = self.mappings[idx].entries[classes[0][0]].member;
        self.mappings[idx].master = Some(keeper);
        self.mappings[idx].state = MappingState::Solved;

        let mut created = Vec::new();
        for class in classes.iter().skip(1) {
            let rep = &self.mappings[idx].entries[class[0]];
            let Some(rep_change) = rep.change.clone() else { continue };
            if rep_change.kind == ChangeKind::Deleted {
                continue;
            }
            let (new_uid, payload) = self.format.duplicate(&rep_change.uid, &rep_change.payload);
            let copy = Change::new(
                new_uid,
                self.objtype.clone(),
                ChangeKind::Added,
                rep_change.format.clone(),
                payload,
            );

            let new_id = MappingId::new(self.next_id);
            self.next_id += 1;
            let mut mapping = Mapping::new(new_id, self.objtype.clone());
            mapping.state = MappingState::Solved;
            mapping.master = Some(rep.member);
            mapping.multiplied = true;
            for &member in &self.members {
                mapping.push_entry(member, Some(copy.clone()), true);
            }
            debug!(original = %id, duplicate = %new_id, "conflict duplicated into new mapping");
            self.mappings.push(mapping);
            created.push(new_id);
        }
        Ok(created)
    }

    // ── Master multiplication / commit scheduling ────────────────

    /// Propagates each solved mapping's winning content to every losing
    /// active member, skipping quarantined ones, and returns the scheduled
    /// commits.
    ///
    /// `known_uids` lists the uids each member's database held before the
    /// round (from its hash store); it decides whether an absent member
    /// receives an add, a modify, or — for a deleted winner — a delete.
    pub fn multiply(
        &mut self,
        healthy: &BTreeSet<MemberId>,
        known_uids: &BTreeMap<MemberId, HashSet<String>>,
    ) -> Vec<ScheduledCommit> {
        let mut scheduled = Vec::new();
        for idx in 0..self.mappings.len() {
            if self.mappings[idx].state != MappingState::Solved {
                continue;
            }
            if !self.mappings[idx].multiplied {
                self.multiply_one(idx, healthy, known_uids);
                self.mappings[idx].multiplied = true;
            }
            let mapping = &self.mappings[idx];
            for entry in &mapping.entries {
                if entry.dirty && !entry.committed && healthy.contains(&entry.member) {
                    if let Some(change) = &entry.change {
                        scheduled.push(ScheduledCommit {
                            member: entry.member,
                            mapping: mapping.id,
                            change: change.clone(),
                        });
                    }
                }
            }
        }
        scheduled
    }

    fn multiply_one(
        &mut self,
        idx: usize,
        healthy: &BTreeSet<MemberId>,
        known_uids: &BTreeMap<MemberId, HashSet<String>>,
    ) {
        let Some(master) = self.mappings[idx].master else {
            return;
        };
        let Some(master_change) = self.mappings[idx]
            .entry(master)
            .and_then(|e| e.change.clone())
        else {
            warn!(mapping = %self.mappings[idx].id, "solved mapping has no master change");
            return;
        };

        let members = self.members.clone();
        let objtype = self.objtype.clone();
        for member in members {
            if member == master || !healthy.contains(&member) {
                continue;
            }
            let existing = self.mappings[idx]
                .entry(member)
                .and_then(|e| e.change.clone());
            match existing {
                Some(ref theirs) if self.same_content(theirs, &master_change) => {
                    // Already carries the winning content.
                }
                Some(theirs) => {
                    let change = if master_change.kind == ChangeKind::Deleted {
                        Change::deleted(theirs.uid.clone(), objtype.clone())
                    } else {
                        let kind = if theirs.kind == ChangeKind::Deleted {
                            ChangeKind::Added
                        } else {
                            ChangeKind::Modified
                        };
                        Change::new(
                            theirs.uid.clone(),
                            objtype.clone(),
                            kind,
                            master_change.format.clone(),
                            master_change.payload.clone(),
                        )
                    };
                    if let Some(entry) = self.mappings[idx].entry_mut(member) {
                        entry.change = Some(change);
                        entry.dirty = true;
                    }
                }
                None => {
                    // No change reported by that member this round. Its
                    // hash store tells whether the entry exists there at
                    // all: a deleted winner only produces a delete where
                    // the entry is actually present, and a content winner
                    // is a modify there rather than an add.
                    let present = known_uids
                        .get(&member)
                        .is_some_and(|uids| uids.contains(&master_change.uid));
                    if master_change.kind == ChangeKind::Deleted {
                        if present {
                            let del =
                                Change::deleted(master_change.uid.clone(), objtype.clone());
                            self.mappings[idx].push_entry(member, Some(del), true);
                        }
                    } else {
                        let kind = if present {
                            ChangeKind::Modified
                        } else {
                            ChangeKind::Added
                        };
                        let add = Change::new(
                            master_change.uid.clone(),
                            objtype.clone(),
                            kind,
                            master_change.format.clone(),
                            master_change.payload.clone(),
                        );
                        self.mappings[idx].push_entry(member, Some(add), true);
                    }
                }
            }
        }
    }

    /// Marks one member's side of a mapping as committed.
    pub fn mark_committed(&mut self, id: MappingId, member: MemberId) {
        if let Some(mapping) = self.mappings.iter_mut().find(|m| m.id == id) {
            if let Some(entry) = mapping.entry_mut(member) {
                entry.dirty = false;
                entry.committed = true;
            }
        }
    }

    /// Final per-member (uid → hash) rows for the hash store, reflecting
    /// what each healthy member's database holds after the round.
    pub fn hash_updates(&self, member: MemberId) -> Vec<(String, Option<String>)> {
        let mut updates = Vec::new();
        for mapping in &self.mappings {
            if let Some(entry) = mapping.entry(member) {
                // A side whose commit never went through keeps its old row.
                if entry.dirty && !entry.committed {
                    continue;
                }
                if let Some(change) = &entry.change {
                    let value = match change.kind {
                        ChangeKind::Deleted => None,
                        _ => Some(change.hash.clone()),
                    };
                    updates.push((change.uid.clone(), value));
                }
            }
        }
        updates
    }
}
