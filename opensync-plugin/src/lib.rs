//! Plugin capability interface.
//!
//! A plugin is one data source or sink (an address book, a mobile device, a
//! calendar server). The engine never links plugin code directly; it talks
//! to a [`SyncPlugin`] through a member proxy, and plugins are produced by
//! name through the [`PluginRegistry`]. Real plugin bodies live outside
//! this repository; the [`mock`] module ships the instrumented test double
//! the engine suites are built on.

pub mod mock;

mod registry;

pub use registry::{PluginFactory, PluginRegistry};

use async_trait::async_trait;
use opensync_types::{Change, ObjType};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors a plugin can report to the engine.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The member configuration is missing or malformed.
    #[error("plugin configuration error: {0}")]
    Config(String),

    /// The plugin explicitly failed the requested operation.
    #[error("{0}")]
    Remote(String),

    /// The requested capability is not provided by this plugin.
    #[error("operation not supported by plugin")]
    Unsupported,

    /// The plugin's connection to its backing store is gone; the serving
    /// task terminates and the proxy surfaces this as a hangup, not as an
    /// application error.
    #[error("plugin connection lost")]
    Hup,
}

/// Opaque per-member configuration handed to a plugin at initialize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Raw config blob as stored in the member's config file.
    pub data: String,
    /// The member's private config directory (anchor/hash stores live
    /// next to it).
    pub configdir: PathBuf,
}

/// The capability interface every data-source plugin implements.
///
/// `objtype = None` addresses the member's main sink: the object-type
/// independent channel whose connect runs before, and disconnect after,
/// all per-type sinks (one authenticated session shared by all types).
#[async_trait]
pub trait SyncPlugin: Send + Sync {
    /// Prepares plugin state from the member configuration.
    async fn initialize(&self, config: &PluginConfig) -> PluginResult<()>;

    /// Reports the object types this plugin can synchronize.
    async fn discover(&self) -> PluginResult<Vec<ObjType>>;

    /// Opens the connection for one sink.
    async fn connect(&self, objtype: Option<&ObjType>, slow_sync: bool) -> PluginResult<()>;

    /// Reports the changes since the last sync for one object type; a slow
    /// sync reports the full database as additions.
    async fn get_changes(&self, objtype: &ObjType, slow_sync: bool) -> PluginResult<Vec<Change>>;

    /// Writes one change into the plugin's store.
    async fn commit(&self, objtype: &ObjType, change: &Change) -> PluginResult<()>;

    /// Optional batch-completion signal after a run of commits. Plugins
    /// that return `false` from [`supports_batch_commit`] never receive it.
    ///
    /// [`supports_batch_commit`]: SyncPlugin::supports_batch_commit
    async fn committed_all(&self, objtype: &ObjType) -> PluginResult<()>;

    /// Marks a successful sync for one sink.
    async fn sync_done(&self, objtype: Option<&ObjType>) -> PluginResult<()>;

    /// Closes the connection for one sink.
    async fn disconnect(&self, objtype: Option<&ObjType>) -> PluginResult<()>;

    /// Releases all plugin state. Must not fail; errors here are logged
    /// and ignored by the engine.
    async fn finalize(&self);

    /// Whether the plugin accepts the `committed_all` batch signal.
    fn supports_batch_commit(&self) -> bool {
        false
    }

    /// Custom message passthrough for callers that need to talk to a
    /// specific plugin directly. Plugins without custom commands keep the
    /// default.
    async fn call(&self, _name: &str, _data: &[u8]) -> PluginResult<Vec<u8>> {
        Err(PluginError::Unsupported)
    }
}
