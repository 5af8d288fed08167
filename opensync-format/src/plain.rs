//! Plain-text format used by tests and demos.

use crate::{CmpResult, FormatError, FormatResult, ObjFormat};

/// Byte-oriented format with the comparison convention the engine test
/// suite relies on: identical bytes are `Same`, payloads of equal length
/// with different bytes are `Similar`, everything else is `Mismatch`.
///
/// An optional `rev=<millis>` first line carries the revision timestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainFormat;

impl ObjFormat for PlainFormat {
    fn compare(&self, a: &[u8], b: &[u8]) -> CmpResult {
        if a == b {
            CmpResult::Same
        } else if a.len() == b.len() {
            CmpResult::Similar
        } else {
            CmpResult::Mismatch
        }
    }

    fn duplicate(&self, uid: &str, payload: &[u8]) -> (String, Vec<u8>) {
        (format!("{uid}-dupe"), payload.to_vec())
    }

    fn revision(&self, payload: &[u8]) -> FormatResult<i64> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| FormatError::Malformed(e.to_string()))?;
        let first = text.lines().next().unwrap_or("");
        let Some(rev) = first.strip_prefix("rev=") else {
            return Err(FormatError::NoRevision(
                "payload has no rev= header line".into(),
            ));
        };
        rev.trim()
            .parse::<i64>()
            .map_err(|e| FormatError::Malformed(format!("bad rev= value: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_are_same() {
        assert_eq!(PlainFormat.compare(b"xxx", b"xxx"), CmpResult::Same);
    }

    #[test]
    fn equal_length_is_similar() {
        assert_eq!(PlainFormat.compare(b"xxx", b"xxy"), CmpResult::Similar);
    }

    #[test]
    fn different_length_is_mismatch() {
        assert_eq!(PlainFormat.compare(b"xxx", b"xxxx"), CmpResult::Mismatch);
    }

    #[test]
    fn duplicate_renames() {
        let (uid, payload) = PlainFormat.duplicate("entry", b"data");
        assert_eq!(uid, "entry-dupe");
        assert_eq!(payload, b"data");
    }

    #[test]
    fn revision_parses_header() {
        assert_eq!(PlainFormat.revision(b"rev=1500\nbody").unwrap(), 1500);
        assert!(PlainFormat.revision(b"no header").is_err());
    }
}
