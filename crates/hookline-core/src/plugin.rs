use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use hookline_plugin_sdk::{FormNode, PluginManifest};
use serde_json::Value;

use crate::event::{Event, EventBus, EventKind};

/// Lifecycle contract between the host and a reactive plugin.
pub trait HostPlugin: Send {
    fn manifest(&self) -> &PluginManifest;

    /// Applies a freshly saved settings object. Plugins may rewrite keys that
    /// must not persist, such as one-shot triggers.
    fn init(&mut self, settings: &mut Value) -> Result<()>;

    /// Registers the plugin's handlers. Subscriptions are held by the plugin
    /// and released in [`HostPlugin::stop`].
    fn subscribe(&mut self, bus: &EventBus);

    fn state(&self) -> bool;

    /// Settings form tree plus the default settings object.
    fn form(&self) -> Result<(Vec<FormNode>, Value)>;

    fn stop(&mut self) -> Result<()>;
}

/// Persisted settings per plugin id, replayed into [`HostPlugin::init`].
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    entries: BTreeMap<String, Value>,
}

impl ConfigStore {
    pub fn get(&self, plugin_id: &str) -> Option<&Value> {
        self.entries.get(plugin_id)
    }

    pub fn set(&mut self, plugin_id: &str, settings: Value) {
        self.entries.insert(plugin_id.to_string(), settings);
    }
}

/// Minimal stand-in for the host's plugin manager: owns the bus, the stored
/// settings and the installed plugins.
#[derive(Default)]
pub struct PluginRuntime {
    bus: EventBus,
    store: ConfigStore,
    plugins: Vec<Box<dyn HostPlugin>>,
    stopped: bool,
}

impl PluginRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Initialises `plugin` from any stored settings and subscribes it. The
    /// handlers it registers must match the events its manifest declares.
    pub fn install(&mut self, mut plugin: Box<dyn HostPlugin>) -> Result<()> {
        let id = plugin.manifest().id.clone();
        if self.stopped {
            bail!("cannot install `{id}` into a stopped runtime");
        }
        let version = plugin.manifest().semver()?;
        let mut settings = self
            .store
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        plugin
            .init(&mut settings)
            .with_context(|| format!("failed to initialise plugin `{id}`"))?;
        self.store.set(&id, settings);

        let before = EventKind::ALL.map(|kind| self.bus.subscriber_count(kind));
        plugin.subscribe(&self.bus);
        for (kind, before) in EventKind::ALL.into_iter().zip(before) {
            let subscribed = self.bus.subscriber_count(kind) > before;
            if subscribed != plugin.manifest().subscribes_to(kind.as_str()) {
                // dropping the plugin releases whatever it did subscribe
                bail!("plugin `{id}` handles `{kind}` contrary to its manifest");
            }
        }
        tracing::info!(plugin = %id, %version, "plugin installed");
        self.plugins.push(plugin);
        Ok(())
    }

    /// Stores `settings` for `plugin_id` and re-applies them. Returns the
    /// settings as stored after the plugin had its say.
    pub fn save_settings(&mut self, plugin_id: &str, mut settings: Value) -> Result<&Value> {
        let plugin = self
            .plugins
            .iter_mut()
            .find(|plugin| plugin.manifest().id == plugin_id)
            .with_context(|| format!("plugin `{plugin_id}` is not installed"))?;
        plugin
            .init(&mut settings)
            .with_context(|| format!("failed to apply settings for `{plugin_id}`"))?;
        self.store.set(plugin_id, settings);
        self.store
            .get(plugin_id)
            .context("settings vanished from the store")
    }

    pub fn settings(&self, plugin_id: &str) -> Option<&Value> {
        self.store.get(plugin_id)
    }

    pub fn plugin(&self, plugin_id: &str) -> Option<&dyn HostPlugin> {
        self.plugins
            .iter()
            .find(|plugin| plugin.manifest().id == plugin_id)
            .map(|plugin| plugin.as_ref())
    }

    pub fn manifests(&self) -> Vec<&PluginManifest> {
        self.plugins.iter().map(|plugin| plugin.manifest()).collect()
    }

    pub fn publish(&self, event: &Event) -> usize {
        self.bus.publish(event)
    }

    /// Stops every plugin once. Failures are logged and never interrupt
    /// teardown.
    pub fn stop_all(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for plugin in &mut self.plugins {
            let id = plugin.manifest().id.clone();
            if let Err(err) = plugin.stop() {
                tracing::error!(plugin = %id, error = %err, "plugin stop failed");
            }
        }
    }
}

impl Drop for PluginRuntime {
    fn drop(&mut self) {
        self.stop_all();
    }
}
