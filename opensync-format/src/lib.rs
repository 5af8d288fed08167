//! Format capability interface.
//!
//! The mapping engine never understands entry content itself; it delegates
//! content comparison, duplication and revision extraction to a per-objtype
//! [`ObjFormat`] implementation supplied by the format layer. Real format
//! converters (vCard, vCalendar, …) live outside this repository; the crate
//! ships only the interface, the registry, and a plain-text format used by
//! tests and demos.

mod plain;
mod registry;

pub use plain::PlainFormat;
pub use registry::FormatRegistry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for format operations.
pub type FormatResult<T> = Result<T, FormatError>;

/// Errors reported by format implementations.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The payload carries no usable revision information.
    #[error("no revision in payload: {0}")]
    NoRevision(String),

    /// The payload could not be parsed in the declared format.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// No format is registered for the given object type.
    #[error("no format registered for objtype \"{0}\"")]
    UnknownObjType(String),
}

/// Outcome of comparing two entry payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpResult {
    /// The payloads denote the same entry with the same content.
    Same,
    /// The payloads likely denote the same entry with differing content.
    Similar,
    /// The payloads denote different entries.
    Mismatch,
}

/// Per-objtype content operations supplied by the format layer.
///
/// Implementations must be pure: `compare` may not depend on anything but
/// the two payloads, since mapping determinism is built on it.
pub trait ObjFormat: Send + Sync {
    /// Compares two payloads.
    fn compare(&self, a: &[u8], b: &[u8]) -> CmpResult;

    /// Produces a duplicated copy of an entry under a fresh uid, used when
    /// a conflict is resolved by keeping both sides.
    fn duplicate(&self, uid: &str, payload: &[u8]) -> (String, Vec<u8>);

    /// Extracts the revision timestamp (milliseconds since the epoch) from
    /// a payload, used by the choose-newest conflict policy.
    fn revision(&self, payload: &[u8]) -> FormatResult<i64>;
}
