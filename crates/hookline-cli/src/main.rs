use std::{fs, path::PathBuf, sync::Arc, sync::OnceLock};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hookline_core::{
    config::{RatioWatcherConfig, TagAdderConfig},
    memory::{HostFixture, InMemoryHost},
    ratio_watcher, runtime_with_builtins, tag_adder, HostPlugin, RatioWatcher, TagOnDownloadAdded,
};
use hookline_plugin_sdk::PluginManifest;
use regex::Regex;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_HOST: &str = "demos/host.toml";

#[derive(Parser, Debug)]
#[command(name = "hookline", author, version, about = "Reactive host plugins harness")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the built-in plugins against a host fixture and replay its events.
    Replay {
        #[arg(long, value_name = "FILE", default_value = DEFAULT_HOST)]
        host: PathBuf,
    },
    /// Interact with stored plugin settings (validate, sample output, etc.)
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect the built-in plugins.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Print a plugin's settings form and defaults for the given host.
    Form {
        #[arg(value_name = "PLUGIN")]
        plugin: String,
        #[arg(long, value_name = "FILE", default_value = DEFAULT_HOST)]
        host: PathBuf,
    },
    /// Dump the resolved host fixture as JSON.
    Diag {
        #[arg(long, value_name = "FILE", default_value = DEFAULT_HOST)]
        host: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the settings a host fixture stores for one plugin.
    Validate {
        #[arg(value_name = "PLUGIN")]
        plugin: String,
        #[arg(long, value_name = "FILE", default_value = DEFAULT_HOST)]
        host: PathBuf,
    },
    /// Prints the bundled example host fixture.
    Example,
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists the plugins shipped with this build.
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::Replay { host } => handle_replay(host),
        Commands::Config { command } => handle_config(command),
        Commands::Plugins { command } => handle_plugins(command),
        Commands::Form { plugin, host } => handle_form(plugin, host),
        Commands::Diag { host } => handle_diag(host),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().ok();
    Ok(())
}

fn handle_replay(path: PathBuf) -> Result<()> {
    let fixture = load_fixture(&path)?;
    let host = Arc::new(InMemoryHost::from_fixture(&fixture));
    let context = host.context(fixture.host.clone());
    let mut runtime = runtime_with_builtins(&context, fixture.settings.clone())?;

    for event in &fixture.events {
        let delivered = runtime.publish(event);
        tracing::info!(event = %event.kind, handlers = delivered, "event replayed");
    }
    runtime.stop_all();

    let summary = serde_json::json!({
        "tag_calls": host.tag_calls(),
        "notifications": host.notifications(),
        "settings": fixture
            .settings
            .keys()
            .filter_map(|id| runtime.settings(id).map(|s| (id.clone(), s.clone())))
            .collect::<serde_json::Map<_, _>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { plugin, host } => {
            let fixture = load_fixture(&host)?;
            let settings = fixture
                .settings
                .get(&plugin)
                .with_context(|| format!("{} stores no settings for `{plugin}`", host.display()))?;
            match plugin.as_str() {
                tag_adder::PLUGIN_ID => TagAdderConfig::validate(settings)?,
                ratio_watcher::PLUGIN_ID => RatioWatcherConfig::validate(settings)?,
                other => bail!("unknown plugin `{other}`"),
            }
            println!("settings OK: {plugin} in {}", host.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../../../demos/host.toml"));
        }
    }
    Ok(())
}

fn handle_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List => {
            for manifest in builtin_manifests() {
                println!(
                    "- {} v{} ({}){}",
                    manifest.id,
                    manifest.version,
                    manifest.events.join(", "),
                    manifest
                        .description
                        .as_ref()
                        .map(|d| format!(": {d}"))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn builtin_manifests() -> Vec<PluginManifest> {
    vec![tag_adder::manifest(), ratio_watcher::manifest()]
}

fn handle_form(plugin: String, path: PathBuf) -> Result<()> {
    let fixture = load_fixture(&path)?;
    let host = Arc::new(InMemoryHost::from_fixture(&fixture));
    let context = host.context(fixture.host.clone());
    let plugin: Box<dyn HostPlugin> = match plugin.as_str() {
        tag_adder::PLUGIN_ID => Box::new(TagOnDownloadAdded::new(context)),
        ratio_watcher::PLUGIN_ID => Box::new(RatioWatcher::new(context)),
        other => bail!("unknown plugin `{other}`"),
    };
    let (form, defaults) = plugin.form()?;
    let json = serde_json::json!({ "form": form, "defaults": defaults });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn handle_diag(path: PathBuf) -> Result<()> {
    let fixture = load_fixture(&path)?;
    let json = serde_json::to_string_pretty(&fixture)?;
    println!("{json}");
    Ok(())
}

fn load_fixture(path: &PathBuf) -> Result<HostFixture> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read host fixture {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    let fixture = toml::from_str::<HostFixture>(&expanded)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(fixture)
}

fn interpolate_env(input: &str) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}").unwrap());
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_placeholders_fall_back_to_defaults() {
        let out = interpolate_env("app_domain = \"${HOOKLINE_TEST_UNSET_DOMAIN:http://mp.local}\"").unwrap();
        assert_eq!(out, "app_domain = \"http://mp.local\"");
    }

    #[test]
    fn bundled_fixture_parses() {
        let fixture: HostFixture =
            toml::from_str(&interpolate_env(include_str!("../../../demos/host.toml")).unwrap()).unwrap();
        assert!(!fixture.downloaders.is_empty());
        assert!(fixture.settings.contains_key(ratio_watcher::PLUGIN_ID));
        assert!(fixture.settings.contains_key(tag_adder::PLUGIN_ID));
        TagAdderConfig::validate(&fixture.settings[tag_adder::PLUGIN_ID]).unwrap();
        RatioWatcherConfig::validate(&fixture.settings[ratio_watcher::PLUGIN_ID]).unwrap();
    }
}
