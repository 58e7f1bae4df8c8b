//! Typed views over the flat key/value settings object the host persists for
//! each plugin.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::host::{DownloaderConfig, SiteInfo};

pub const ENABLED_KEY: &str = "enabled";
pub const RUN_ONCE_KEY: &str = "onlyonce";

pub fn custom_tags_key(downloader: &str) -> String {
    format!("{downloader}_custom_tags")
}

pub fn site_enabled_key(site: &str) -> String {
    format!("{site}_enabled")
}

pub fn site_ratio_key(site: &str) -> String {
    format!("{site}_ratio")
}

/// Read-only accessor with the lenient coercions the settings form produces:
/// switches may arrive as bools, numbers or strings, and number fields as
/// strings.
#[derive(Debug, Clone, Copy)]
pub struct Settings<'a> {
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Settings<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self {
            map: value.as_object(),
        }
    }

    pub fn is_object(&self) -> bool {
        self.map.is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.is_some_and(|map| map.contains_key(key))
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.map?.get(key)
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            Some(Value::String(s)) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "on" | "yes"
            ),
            _ => false,
        }
    }

    pub fn text(&self, key: &str) -> Option<&'a str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Numeric value of `key`; `Ok(None)` when absent, null or blank.
    pub fn number(&self, key: &str) -> Result<Option<f64>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(Some(n)),
                _ => bail!("`{key}` must be a number, got `{s}`"),
            },
            Some(other) => bail!("`{key}` must be a number, got {other}"),
        }
    }
}

/// Splits textarea input into tags: one per line, surrounding whitespace
/// removed, blank lines and repeats dropped, first occurrence order kept.
pub fn parse_tag_lines(input: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for line in input.lines() {
        let tag = line.trim();
        if tag.is_empty() || tags.iter().any(|t| t == tag) {
            continue;
        }
        tags.push(tag.to_string());
    }
    tags
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagAdderConfig {
    pub enabled: bool,
    pub downloaders: BTreeMap<String, Vec<String>>,
}

impl TagAdderConfig {
    /// Builds the configuration for the downloaders the host currently knows.
    /// Keys naming other downloaders are ignored.
    pub fn from_settings(settings: &Value, downloaders: &[DownloaderConfig]) -> Self {
        let settings = Settings::new(settings);
        let mut config = Self {
            enabled: settings.flag(ENABLED_KEY),
            downloaders: BTreeMap::new(),
        };
        for downloader in downloaders {
            let key = custom_tags_key(&downloader.name);
            if let Some(text) = settings.text(&key) {
                config
                    .downloaders
                    .insert(downloader.name.clone(), parse_tag_lines(text));
            }
        }
        config
    }

    /// Configured tags for `downloader`; empty when unconfigured.
    pub fn tags_for(&self, downloader: &str) -> &[String] {
        self.downloaders
            .get(downloader)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn validate(settings: &Value) -> Result<()> {
        let view = Settings::new(settings);
        let Some(map) = view.map else {
            bail!("settings must be a JSON object");
        };
        for (key, value) in map {
            if key.ends_with("_custom_tags") && !(value.is_string() || value.is_null()) {
                bail!("`{key}` must be newline separated text");
            }
        }
        Ok(())
    }
}

/// Alert threshold for one site. Anything that is not a positive ratio means
/// the site was never given a threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Threshold {
    #[default]
    Unset,
    Ratio(f64),
}

impl Threshold {
    pub fn from_value(value: Option<f64>) -> Self {
        match value {
            Some(ratio) if ratio > 0.0 => Threshold::Ratio(ratio),
            _ => Threshold::Unset,
        }
    }

    pub fn ratio(&self) -> Option<f64> {
        match self {
            Threshold::Ratio(ratio) => Some(*ratio),
            Threshold::Unset => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteRatioSettings {
    pub enabled: bool,
    pub threshold: Threshold,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatioWatcherConfig {
    pub enabled: bool,
    pub run_once: bool,
    pub sites: BTreeMap<String, SiteRatioSettings>,
}

impl RatioWatcherConfig {
    pub fn from_settings(settings: &Value, sites: &[SiteInfo]) -> Self {
        let view = Settings::new(settings);
        let mut config = Self {
            enabled: view.flag(ENABLED_KEY),
            run_once: view.flag(RUN_ONCE_KEY),
            sites: BTreeMap::new(),
        };
        for site in sites {
            let enabled_key = site_enabled_key(&site.name);
            let ratio_key = site_ratio_key(&site.name);
            if !view.contains(&enabled_key) && !view.contains(&ratio_key) {
                continue;
            }
            let threshold = match view.number(&ratio_key) {
                Ok(value) => Threshold::from_value(value),
                Err(err) => {
                    tracing::warn!(site = %site.name, error = %err, "ignoring unreadable ratio threshold");
                    Threshold::Unset
                }
            };
            config.sites.insert(
                site.name.clone(),
                SiteRatioSettings {
                    enabled: view.flag(&enabled_key),
                    threshold,
                },
            );
        }
        config
    }

    /// Settings for `site` if it is configured and switched on.
    pub fn enabled_site(&self, site: &str) -> Option<&SiteRatioSettings> {
        self.sites.get(site).filter(|settings| settings.enabled)
    }

    pub fn validate(settings: &Value) -> Result<()> {
        let view = Settings::new(settings);
        let Some(map) = view.map else {
            bail!("settings must be a JSON object");
        };
        for key in map.keys().filter(|key| key.ends_with("_ratio")) {
            if let Some(ratio) = view.number(key)? {
                if ratio < 0.0 && ratio != -1.0 {
                    bail!("`{key}` must be a positive ratio, got {ratio}");
                }
            }
        }
        Ok(())
    }
}
