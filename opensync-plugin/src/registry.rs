//! Name-keyed plugin factory table.

use crate::{PluginConfig, PluginError, PluginResult, SyncPlugin};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory producing a plugin instance from a member's configuration.
pub type PluginFactory =
    Arc<dyn Fn(&PluginConfig) -> PluginResult<Arc<dyn SyncPlugin>> + Send + Sync>;

/// Registry of available plugins, keyed by plugin name.
///
/// The engine resolves each member's `plugin_name` here when it spawns the
/// member's client; an unknown name fails that member's initialize.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin factory under a name, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PluginConfig) -> PluginResult<Arc<dyn SyncPlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Registers a fixed, pre-built plugin instance under a name. Used by
    /// tests that need to keep a handle on the instance the engine drives.
    pub fn register_instance(&mut self, name: impl Into<String>, plugin: Arc<dyn SyncPlugin>) {
        self.register(name, move |_| Ok(plugin.clone()));
    }

    /// Instantiates the named plugin for a member.
    pub fn instantiate(
        &self,
        name: &str,
        config: &PluginConfig,
    ) -> PluginResult<Arc<dyn SyncPlugin>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PluginError::Config(format!("unknown plugin \"{name}\"")))?;
        factory(config)
    }

    /// True if a plugin is registered under the name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}
