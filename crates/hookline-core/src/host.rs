//! Narrow interfaces onto the host application's helper services.
//!
//! Plugins never talk to a download client, the site database or a message
//! channel directly; they go through these traits, which the host implements.

use std::{collections::BTreeSet, fmt, sync::Arc};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("downloader `{0}` is not configured")]
    UnknownDownloader(String),

    #[error("downloader `{0}` has no live client")]
    Detached(String),

    #[error("downloader `{0}` is offline")]
    Offline(String),

    #[error("downloader rpc failed: {0}")]
    Rpc(String),

    #[error("site store error: {0}")]
    Store(String),

    #[error("notification channel error: {0}")]
    Notify(String),
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Download client families the host ships drivers for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloaderKind {
    Qbittorrent,
    Transmission,
    #[serde(untagged)]
    Other(String),
}

impl DownloaderKind {
    /// Whether the driver's native "set tags" call keeps tags already on the item.
    pub fn tags_are_additive(&self) -> bool {
        matches!(self, DownloaderKind::Qbittorrent)
    }
}

impl fmt::Display for DownloaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloaderKind::Qbittorrent => f.write_str("qbittorrent"),
            DownloaderKind::Transmission => f.write_str("transmission"),
            DownloaderKind::Other(name) => f.write_str(name),
        }
    }
}

/// Downloader entry as configured in the host, whether or not it is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloaderConfig {
    pub name: String,
    pub kind: DownloaderKind,
}

/// Driver whose tag call adds to the existing tag set.
pub trait AdditiveTagger: Send + Sync {
    fn is_offline(&self) -> bool;
    fn add_tags(&self, hash: &str, tags: &[String]) -> HostResult<()>;
}

/// Driver whose tag call overwrites the existing tag set, so callers pass the
/// current tags along for the driver to merge.
pub trait ReplacingTagger: Send + Sync {
    fn is_offline(&self) -> bool;
    fn tags(&self, hash: &str) -> HostResult<Vec<String>>;
    fn set_tags(&self, hash: &str, tags: &[String], existing: &[String]) -> HostResult<()>;
}

/// Tagging capability of a resolved downloader, fixed when the service is resolved.
#[derive(Clone)]
pub enum Tagger {
    Additive(Arc<dyn AdditiveTagger>),
    Replacing(Arc<dyn ReplacingTagger>),
}

impl Tagger {
    pub fn is_offline(&self) -> bool {
        match self {
            Tagger::Additive(client) => client.is_offline(),
            Tagger::Replacing(client) => client.is_offline(),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Tagger::Additive(_) => "additive",
            Tagger::Replacing(_) => "replacing",
        }
    }

    /// Applies `tags` to the item with exactly one tag-setting call.
    pub fn apply(&self, hash: &str, tags: &[String]) -> HostResult<()> {
        match self {
            Tagger::Additive(client) => client.add_tags(hash, tags),
            Tagger::Replacing(client) => {
                let existing = client.tags(hash)?;
                client.set_tags(hash, tags, &existing)
            }
        }
    }
}

impl fmt::Debug for Tagger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tagger").field(&self.mode()).finish()
    }
}

/// Union of `existing` and `tags`, keeping the first occurrence of each tag in
/// that order. This is the membership a replacing driver must end up with.
pub fn merge_tags(tags: &[String], existing: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    existing
        .iter()
        .chain(tags)
        .filter(|tag| seen.insert(tag.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone)]
pub struct DownloaderService {
    pub name: String,
    pub kind: DownloaderKind,
    /// `None` when the host knows the downloader but has no live client for it.
    pub instance: Option<Tagger>,
}

impl DownloaderService {
    /// The attached client, provided it is reachable right now.
    pub fn live_tagger(&self) -> HostResult<&Tagger> {
        let tagger = self
            .instance
            .as_ref()
            .ok_or_else(|| HostError::Detached(self.name.clone()))?;
        if tagger.is_offline() {
            return Err(HostError::Offline(self.name.clone()));
        }
        Ok(tagger)
    }
}

pub trait DownloaderDirectory: Send + Sync {
    fn configs(&self) -> Vec<DownloaderConfig>;
    fn service(&self, name: &str) -> Option<DownloaderService>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub pri: i32,
}

fn default_active() -> bool {
    true
}

/// One persisted snapshot of the user's statistics on a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRatioSample {
    pub name: String,
    #[serde(default)]
    pub domain: String,
    pub ratio: Option<f64>,
    pub updated_day: NaiveDate,
}

pub trait SiteStore: Send + Sync {
    fn sites(&self) -> HostResult<Vec<SiteInfo>>;
    fn user_data(&self) -> HostResult<Vec<SiteRatioSample>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    SiteMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub text: String,
    pub link: Option<String>,
}

pub trait Notifier: Send + Sync {
    fn post(&self, notification: Notification) -> HostResult<()>;
}

/// Host-wide settings a plugin may read but never writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub app_domain: Option<String>,
}

impl HostConfig {
    /// Deep link to a plugin's page in the host UI.
    pub fn plugin_link(&self, plugin_id: &str) -> Option<String> {
        let domain = self.app_domain.as_deref()?.trim_end_matches('/');
        if domain.is_empty() {
            return None;
        }
        Some(format!("{domain}/#/plugins?tab=installed&id={plugin_id}"))
    }
}

/// Bundle of collaborators handed to every plugin at construction.
#[derive(Clone)]
pub struct HostContext {
    pub config: HostConfig,
    pub downloaders: Arc<dyn DownloaderDirectory>,
    pub sites: Arc<dyn SiteStore>,
    pub notifier: Arc<dyn Notifier>,
}
