//! Static objtype → format dispatch table.

use crate::{FormatError, FormatResult, ObjFormat};
use opensync_types::ObjType;
use std::collections::HashMap;
use std::sync::Arc;

/// Closed dispatch table from object type to its format implementation.
///
/// Built once before the engine initializes; the engine refuses to start a
/// round for an object type that has no registered format.
#[derive(Default, Clone)]
pub struct FormatRegistry {
    formats: HashMap<ObjType, Arc<dyn ObjFormat>>,
}

impl FormatRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a format for an object type, replacing any previous one.
    pub fn register(&mut self, objtype: impl Into<ObjType>, format: Arc<dyn ObjFormat>) {
        self.formats.insert(objtype.into(), format);
    }

    /// Looks up the format for an object type.
    pub fn get(&self, objtype: &ObjType) -> FormatResult<Arc<dyn ObjFormat>> {
        self.formats
            .get(objtype)
            .cloned()
            .ok_or_else(|| FormatError::UnknownObjType(objtype.to_string()))
    }

    /// True if a format is registered for the object type.
    #[must_use]
    pub fn contains(&self, objtype: &ObjType) -> bool {
        self.formats.contains_key(objtype)
    }
}
