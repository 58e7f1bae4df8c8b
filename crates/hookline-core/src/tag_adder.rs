//! Adds per-downloader tags to every download the host hands off.

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use hookline_plugin_sdk::{FormNode, PluginManifest};
use serde_json::{Map, Value};

use crate::{
    config::{custom_tags_key, TagAdderConfig, ENABLED_KEY},
    event::{DownloadAdded, Event, EventBus, EventHandler, EventKind, Subscription},
    host::{DownloaderDirectory, DownloaderService, HostContext, HostError, HostResult},
    plugin::HostPlugin,
};

pub const PLUGIN_ID: &str = "DownloaderTagAdder";

pub fn manifest() -> PluginManifest {
    PluginManifest {
        id: PLUGIN_ID.into(),
        name: "Downloader tag adder".into(),
        description: Some("Tags qBittorrent and Transmission downloads when they are added".into()),
        icon: Some("world.png".into()),
        version: "1.0.1".into(),
        author: Some("velor2012".into()),
        author_url: Some("https://github.com/velor2012".into()),
        config_prefix: "Downloader_Tag_Adder".into(),
        order: 21,
        auth_level: 2,
        events: vec![EventKind::DownloadAdded.as_str().into()],
    }
}

pub struct TagOnDownloadAdded {
    manifest: PluginManifest,
    host: HostContext,
    config: Arc<RwLock<TagAdderConfig>>,
    subscription: Option<Subscription>,
}

impl TagOnDownloadAdded {
    pub fn new(host: HostContext) -> Self {
        Self {
            manifest: manifest(),
            host,
            config: Arc::default(),
            subscription: None,
        }
    }

    pub fn config(&self) -> TagAdderConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HostPlugin for TagOnDownloadAdded {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn init(&mut self, settings: &mut Value) -> Result<()> {
        tracing::info!(plugin = PLUGIN_ID, "initialising");
        let downloaders = self.host.downloaders.configs();
        let config = TagAdderConfig::from_settings(settings, &downloaders);
        tracing::info!(
            plugin = PLUGIN_ID,
            enabled = config.enabled,
            downloaders = config.downloaders.len(),
            "configuration applied"
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    fn subscribe(&mut self, bus: &EventBus) {
        let handler = DownloadAddedHandler {
            config: self.config.clone(),
            downloaders: self.host.downloaders.clone(),
        };
        self.subscription = Some(bus.subscribe(EventKind::DownloadAdded, Arc::new(handler)));
    }

    fn state(&self) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enabled
    }

    fn form(&self) -> Result<(Vec<FormNode>, Value)> {
        let downloaders = self.host.downloaders.configs();

        let mut rows = vec![FormNode::row(vec![FormNode::col(
            12,
            vec![FormNode::switch(ENABLED_KEY, "Enable plugin")],
        )])];
        for downloader in &downloaders {
            rows.push(FormNode::row(vec![FormNode::col(
                12,
                vec![FormNode::textarea(
                    custom_tags_key(&downloader.name),
                    format!("{} - custom tags", downloader.name),
                    3,
                )
                .prop("placeholder", "One tag per line\ne.g.\nmovies\nseries\nanime")],
            )]));
        }
        rows.push(FormNode::row(vec![FormNode::col(
            12,
            vec![FormNode::alert(
                "info",
                "One tag per line. Every listed tag is added to each new download of that downloader.",
            )],
        )]));

        let mut defaults = Map::new();
        defaults.insert(ENABLED_KEY.into(), Value::Bool(false));
        for downloader in &downloaders {
            defaults.insert(custom_tags_key(&downloader.name), Value::String(String::new()));
        }
        Ok((vec![FormNode::form(rows)], Value::Object(defaults)))
    }

    fn stop(&mut self) -> Result<()> {
        tracing::info!(plugin = PLUGIN_ID, "stopping");
        self.subscription.take();
        Ok(())
    }
}

struct DownloadAddedHandler {
    config: Arc<RwLock<TagAdderConfig>>,
    downloaders: Arc<dyn DownloaderDirectory>,
}

impl DownloadAddedHandler {
    fn resolve(&self, name: &str) -> HostResult<DownloaderService> {
        self.downloaders
            .service(name)
            .ok_or_else(|| HostError::UnknownDownloader(name.to_string()))
    }
}

impl EventHandler for DownloadAddedHandler {
    fn name(&self) -> &str {
        PLUGIN_ID
    }

    fn handle(&self, event: &Event) -> Result<()> {
        let (payload, tags) = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            if !config.enabled {
                tracing::debug!(plugin = PLUGIN_ID, "plugin disabled; ignoring download");
                return Ok(());
            }
            let Some(payload) = event
                .payload::<DownloadAdded>()
                .filter(|payload| !payload.hash.trim().is_empty() && !payload.downloader.trim().is_empty())
            else {
                tracing::warn!(plugin = PLUGIN_ID, "download event carried no usable payload");
                return Ok(());
            };
            let tags = config.tags_for(&payload.downloader).to_vec();
            (payload, tags)
        };

        let service = match self.resolve(&payload.downloader) {
            Ok(service) => service,
            Err(err) => {
                tracing::error!(plugin = PLUGIN_ID, hash = %payload.hash, error = %err, "download left untagged");
                return Ok(());
            }
        };
        let tagger = match service.live_tagger() {
            Ok(tagger) => tagger,
            Err(err) => {
                tracing::error!(plugin = PLUGIN_ID, hash = %payload.hash, error = %err, "download left untagged");
                return Ok(());
            }
        };
        if tags.is_empty() {
            tracing::debug!(plugin = PLUGIN_ID, downloader = %service.name, "no tags configured");
            return Ok(());
        }

        tagger.apply(&payload.hash, &tags).with_context(|| {
            format!(
                "failed to tag {} on {} ({})",
                payload.hash, service.name, service.kind
            )
        })?;
        metrics::counter!("hookline_tags_applied_total", "mode" => tagger.mode()).increment(1);
        tracing::info!(
            plugin = PLUGIN_ID,
            downloader = %service.name,
            hash = %payload.hash,
            mode = tagger.mode(),
            tags = ?tags,
            "tags applied"
        );
        Ok(())
    }
}
