pub mod config;
pub mod event;
pub mod host;
pub mod memory;
pub mod plugin;
pub mod ratio_watcher;
pub mod tag_adder;

#[cfg(test)]
pub(crate) mod test_support;

pub use event::{Event, EventBus, EventKind};
pub use plugin::{HostPlugin, PluginRuntime};
pub use ratio_watcher::RatioWatcher;
pub use tag_adder::TagOnDownloadAdded;

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Every plugin this crate ships, bound to `host`.
pub fn builtin_plugins(host: &host::HostContext) -> Vec<Box<dyn HostPlugin>> {
    vec![
        Box::new(TagOnDownloadAdded::new(host.clone())) as Box<dyn HostPlugin>,
        Box::new(RatioWatcher::new(host.clone())),
    ]
}

/// Builds a runtime with every built-in plugin installed against `host`,
/// replaying any settings already stored for them.
pub fn runtime_with_builtins(
    host: &host::HostContext,
    stored: impl IntoIterator<Item = (String, serde_json::Value)>,
) -> anyhow::Result<PluginRuntime> {
    let mut runtime = PluginRuntime::new();
    for plugin in builtin_plugins(host) {
        runtime.install(plugin)?;
    }
    for (id, settings) in stored {
        runtime.save_settings(&id, settings)?;
    }
    Ok(runtime)
}
