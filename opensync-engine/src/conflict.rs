//! Conflict resolution policies.

use crate::error::EngineResult;
use crate::mapping::MappingTable;
use opensync_group::ConflictPolicy;
use opensync_types::{MappingId, MemberId};
use tracing::{debug, warn};

/// Outcome of applying the policy to one conflicting mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The mapping was solved; the winner's content will be multiplied.
    Solved { winner: MemberId },
    /// Every divergent side was kept under a fresh uid.
    Duplicated { created: Vec<MappingId> },
    /// The interactive policy is in charge; the mapping stays suspended
    /// until an external `solve` arrives. Other mappings keep resolving.
    AwaitingCallback,
}

/// Applies the group's conflict policy to conflicting mappings.
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    /// Creates a resolver for the given policy.
    #[must_use]
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// The policy this resolver applies.
    #[must_use]
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Resolves one conflicting mapping in the table.
    ///
    /// The engine guarantees the mapping's object type reached its barrier
    /// before this is called; resolving earlier is a round-fatal
    /// programming error surfaced upstream.
    pub fn resolve(&self, table: &mut MappingTable, id: MappingId) -> EngineResult<Resolution> {
        match self.policy {
            ConflictPolicy::Interactive => Ok(Resolution::AwaitingCallback),
            ConflictPolicy::Duplicate => {
                let created = table.duplicate(id)?;
                Ok(Resolution::Duplicated { created })
            }
            ConflictPolicy::PickMember(preferred) => {
                let winner = match table.mapping(id).and_then(|m| m.entry(preferred)) {
                    Some(_) => preferred,
                    None => {
                        let fallback = self.lowest_member(table, id);
                        warn!(
                            mapping = %id, %preferred,
                            "preferred member has no entry, falling back to member {fallback}"
                        );
                        fallback
                    }
                };
                table.solve(id, winner)?;
                Ok(Resolution::Solved { winner })
            }
            ConflictPolicy::PickNewest => {
                let winner = self.newest_member(table, id);
                table.solve(id, winner)?;
                Ok(Resolution::Solved { winner })
            }
        }
    }

    fn lowest_member(&self, table: &MappingTable, id: MappingId) -> MemberId {
        table
            .mapping(id)
            .and_then(|m| m.entries.first())
            .map(|e| e.member)
            .unwrap_or(MemberId::new(0))
    }

    /// Picks the entry with the newest revision timestamp. Entries whose
    /// payload carries no revision are skipped; if none carries one, the
    /// lowest member id wins and the divergence is logged rather than
    /// silently invented.
    fn newest_member(&self, table: &MappingTable, id: MappingId) -> MemberId {
        let format = table.format();
        let mut best: Option<(i64, MemberId)> = None;
        if let Some(mapping) = table.mapping(id) {
            for entry in &mapping.entries {
                let Some(change) = &entry.change else { continue };
                match format.revision(&change.payload) {
                    Ok(rev) => {
                        let candidate = (rev, entry.member);
                        // On equal revisions the lower member id wins, so
                        // resolution stays deterministic.
                        let better = match best {
                            None => true,
                            Some((brev, bmember)) => {
                                rev > brev || (rev == brev && entry.member < bmember)
                            }
                        };
                        if better {
                            best = Some(candidate);
                        }
                    }
                    Err(e) => {
                        debug!(mapping = %id, member = %entry.member, "no revision: {e}");
                    }
                }
            }
        }
        match best {
            Some((_, member)) => member,
            None => {
                let fallback = self.lowest_member(table, id);
                warn!(mapping = %id, "no entry carries a revision, falling back to member {fallback}");
                fallback
            }
        }
    }
}
