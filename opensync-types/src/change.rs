//! The change record reported by members and consumed by the mapping engine.

use crate::ids::ObjType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What kind of modification a member reported for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The entry is new on that member.
    Added,
    /// The entry existed before and its content changed.
    Modified,
    /// The entry was removed on that member.
    Deleted,
    /// The entry was re-reported without a content change.
    Unmodified,
}

/// Computes the lowercase-hex SHA-256 fingerprint of a payload.
#[must_use]
pub fn content_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// One reported modification from one member.
///
/// The payload is an opaque serialized record in the named format; the core
/// never inspects it beyond handing it to the format layer for comparison.
/// `hash` is the SHA-256 of the payload, empty for deletions, and is what
/// the tracker deduplicates on and the mapping engine uses for cheap
/// equality checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Member-local unique identifier of the entry.
    pub uid: String,
    /// Object type this entry belongs to.
    pub objtype: ObjType,
    /// Kind of modification.
    pub kind: ChangeKind,
    /// Name of the serialization format of `payload`.
    pub format: String,
    /// Opaque serialized entry content. Empty for deletions.
    pub payload: Vec<u8>,
    /// SHA-256 content fingerprint, empty for deletions.
    pub hash: String,
}

impl Change {
    /// Creates a change carrying content; the hash is computed here.
    pub fn new(
        uid: impl Into<String>,
        objtype: impl Into<ObjType>,
        kind: ChangeKind,
        format: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        let hash = content_hash(&payload);
        Self {
            uid: uid.into(),
            objtype: objtype.into(),
            kind,
            format: format.into(),
            payload,
            hash,
        }
    }

    /// Creates a payload-less tombstone for a deleted entry.
    pub fn deleted(uid: impl Into<String>, objtype: impl Into<ObjType>) -> Self {
        Self {
            uid: uid.into(),
            objtype: objtype.into(),
            kind: ChangeKind::Deleted,
            format: String::new(),
            payload: Vec::new(),
            hash: String::new(),
        }
    }

    /// True if this change carries entry content.
    #[must_use]
    pub fn has_data(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Returns a copy of this change retargeted as a commit to another
    /// member: an `Added` propagation keeps uid and content but drops any
    /// member-local notion of prior state.
    #[must_use]
    pub fn as_propagation(&self, kind: ChangeKind) -> Self {
        let mut copy = self.clone();
        copy.kind = kind;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_per_payload() {
        let a = Change::new("x", "contact", ChangeKind::Added, "plain", b"abc".to_vec());
        let b = Change::new("y", "contact", ChangeKind::Modified, "plain", b"abc".to_vec());
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn deleted_has_no_data() {
        let d = Change::deleted("x", "contact");
        assert!(!d.has_data());
        assert!(d.hash.is_empty());
        assert_eq!(d.kind, ChangeKind::Deleted);
    }

    #[test]
    fn serde_round_trip() {
        let c = Change::new("uid-1", "event", ChangeKind::Added, "plain", b"hello".to_vec());
        let json = serde_json::to_string(&c).unwrap();
        let back: Change = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }
}
