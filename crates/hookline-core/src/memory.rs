//! In-memory host used by the `hookline` harness and the test suites. Every
//! collaborator call is recorded so callers can assert on side effects.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    event::Event,
    host::{
        merge_tags, AdditiveTagger, DownloaderConfig, DownloaderDirectory, DownloaderKind,
        DownloaderService, HostConfig, HostContext, HostError, HostResult, Notification, Notifier,
        ReplacingTagger, SiteInfo, SiteRatioSample, SiteStore, Tagger,
    },
};

/// Serializable description of a host: what it knows, what it stores, and the
/// events it will emit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostFixture {
    pub host: HostConfig,
    pub downloaders: Vec<DownloaderFixture>,
    pub sites: Vec<SiteInfo>,
    pub samples: Vec<SiteRatioSample>,
    pub settings: BTreeMap<String, Value>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderFixture {
    pub name: String,
    pub kind: DownloaderKind,
    #[serde(default = "yes")]
    pub online: bool,
    /// `false` models a downloader that is configured but has no live client.
    #[serde(default = "yes")]
    pub attached: bool,
    #[serde(default)]
    pub torrents: BTreeMap<String, Vec<String>>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TagCall {
    Add {
        downloader: String,
        hash: String,
        tags: Vec<String>,
    },
    Get {
        downloader: String,
        hash: String,
    },
    Set {
        downloader: String,
        hash: String,
        tags: Vec<String>,
        existing: Vec<String>,
    },
}

type CallLog = Arc<Mutex<Vec<TagCall>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fake download client. Its tag semantics follow its kind: qBittorrent-like
/// clients add, the rest merge the `existing` list they are handed.
pub struct MemoryClient {
    name: String,
    online: AtomicBool,
    failing: AtomicBool,
    torrents: Mutex<BTreeMap<String, Vec<String>>>,
    calls: CallLog,
}

impl MemoryClient {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Makes every tag call fail with an RPC error after it is recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_rpc(&self) -> HostResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HostError::Rpc(format!("{} rejected the request", self.name)));
        }
        Ok(())
    }

    pub fn torrent_tags(&self, hash: &str) -> Vec<String> {
        lock(&self.torrents).get(hash).cloned().unwrap_or_default()
    }
}

impl AdditiveTagger for MemoryClient {
    fn is_offline(&self) -> bool {
        !self.online.load(Ordering::SeqCst)
    }

    fn add_tags(&self, hash: &str, tags: &[String]) -> HostResult<()> {
        lock(&self.calls).push(TagCall::Add {
            downloader: self.name.clone(),
            hash: hash.to_string(),
            tags: tags.to_vec(),
        });
        self.check_rpc()?;
        let mut torrents = lock(&self.torrents);
        let current = torrents.entry(hash.to_string()).or_default();
        *current = merge_tags(tags, current);
        Ok(())
    }
}

impl ReplacingTagger for MemoryClient {
    fn is_offline(&self) -> bool {
        !self.online.load(Ordering::SeqCst)
    }

    fn tags(&self, hash: &str) -> HostResult<Vec<String>> {
        lock(&self.calls).push(TagCall::Get {
            downloader: self.name.clone(),
            hash: hash.to_string(),
        });
        self.check_rpc()?;
        Ok(self.torrent_tags(hash))
    }

    fn set_tags(&self, hash: &str, tags: &[String], existing: &[String]) -> HostResult<()> {
        lock(&self.calls).push(TagCall::Set {
            downloader: self.name.clone(),
            hash: hash.to_string(),
            tags: tags.to_vec(),
            existing: existing.to_vec(),
        });
        self.check_rpc()?;
        lock(&self.torrents).insert(hash.to_string(), merge_tags(tags, existing));
        Ok(())
    }
}

struct DownloaderEntry {
    config: DownloaderConfig,
    attached: bool,
    client: Arc<MemoryClient>,
}

#[derive(Default)]
pub struct InMemoryHost {
    downloaders: Vec<DownloaderEntry>,
    sites: Mutex<Vec<SiteInfo>>,
    samples: Mutex<Vec<SiteRatioSample>>,
    notifications: Mutex<Vec<Notification>>,
    tag_calls: CallLog,
    user_data_reads: AtomicUsize,
    store_down: AtomicBool,
    notifier_down: AtomicBool,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: &HostFixture) -> Self {
        let mut host = Self::new();
        for downloader in &fixture.downloaders {
            host.add_downloader(downloader.clone());
        }
        host.set_sites(fixture.sites.clone());
        host.set_samples(fixture.samples.clone());
        host
    }

    pub fn add_downloader(&mut self, fixture: DownloaderFixture) -> Arc<MemoryClient> {
        let client = Arc::new(MemoryClient {
            name: fixture.name.clone(),
            online: AtomicBool::new(fixture.online),
            failing: AtomicBool::new(false),
            torrents: Mutex::new(fixture.torrents),
            calls: self.tag_calls.clone(),
        });
        self.downloaders.push(DownloaderEntry {
            config: DownloaderConfig {
                name: fixture.name,
                kind: fixture.kind,
            },
            attached: fixture.attached,
            client: client.clone(),
        });
        client
    }

    pub fn client(&self, name: &str) -> Option<Arc<MemoryClient>> {
        self.downloaders
            .iter()
            .find(|entry| entry.config.name == name)
            .map(|entry| entry.client.clone())
    }

    pub fn set_sites(&self, sites: Vec<SiteInfo>) {
        *lock(&self.sites) = sites;
    }

    pub fn set_samples(&self, samples: Vec<SiteRatioSample>) {
        *lock(&self.samples) = samples;
    }

    pub fn tag_calls(&self) -> Vec<TagCall> {
        lock(&self.tag_calls).clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.notifications).clone()
    }

    pub fn user_data_reads(&self) -> usize {
        self.user_data_reads.load(Ordering::SeqCst)
    }

    /// Makes site and user-data reads fail. Reads are still counted.
    pub fn set_store_down(&self, down: bool) {
        self.store_down.store(down, Ordering::SeqCst);
    }

    pub fn set_notifier_down(&self, down: bool) {
        self.notifier_down.store(down, Ordering::SeqCst);
    }

    pub fn context(self: &Arc<Self>, config: HostConfig) -> HostContext {
        HostContext {
            config,
            downloaders: self.clone(),
            sites: self.clone(),
            notifier: self.clone(),
        }
    }
}

impl DownloaderDirectory for InMemoryHost {
    fn configs(&self) -> Vec<DownloaderConfig> {
        self.downloaders
            .iter()
            .map(|entry| entry.config.clone())
            .collect()
    }

    fn service(&self, name: &str) -> Option<DownloaderService> {
        let entry = self
            .downloaders
            .iter()
            .find(|entry| entry.config.name == name)?;
        let instance = entry.attached.then(|| {
            if entry.config.kind.tags_are_additive() {
                Tagger::Additive(entry.client.clone())
            } else {
                Tagger::Replacing(entry.client.clone())
            }
        });
        Some(DownloaderService {
            name: entry.config.name.clone(),
            kind: entry.config.kind.clone(),
            instance,
        })
    }
}

impl SiteStore for InMemoryHost {
    fn sites(&self) -> HostResult<Vec<SiteInfo>> {
        if self.store_down.load(Ordering::SeqCst) {
            return Err(HostError::Store("site table unavailable".into()));
        }
        Ok(lock(&self.sites).clone())
    }

    fn user_data(&self) -> HostResult<Vec<SiteRatioSample>> {
        self.user_data_reads.fetch_add(1, Ordering::SeqCst);
        if self.store_down.load(Ordering::SeqCst) {
            return Err(HostError::Store("user data unavailable".into()));
        }
        Ok(lock(&self.samples).clone())
    }
}

impl Notifier for InMemoryHost {
    fn post(&self, notification: Notification) -> HostResult<()> {
        if self.notifier_down.load(Ordering::SeqCst) {
            return Err(HostError::Notify(format!("`{}` was not delivered", notification.title)));
        }
        tracing::info!(title = %notification.title, "notification posted");
        lock(&self.notifications).push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloader(name: &str, kind: DownloaderKind) -> DownloaderFixture {
        DownloaderFixture {
            name: name.into(),
            kind,
            online: true,
            attached: true,
            torrents: BTreeMap::new(),
        }
    }

    #[test]
    fn directory_selects_tagger_by_kind() {
        let mut host = InMemoryHost::new();
        host.add_downloader(downloader("qb", DownloaderKind::Qbittorrent));
        host.add_downloader(downloader("tr", DownloaderKind::Transmission));
        let mut detached = downloader("idle", DownloaderKind::Transmission);
        detached.attached = false;
        host.add_downloader(detached);

        assert!(matches!(host.service("qb").unwrap().instance, Some(Tagger::Additive(_))));
        assert!(matches!(host.service("tr").unwrap().instance, Some(Tagger::Replacing(_))));
        assert!(host.service("idle").unwrap().instance.is_none());
        assert!(host.service("missing").is_none());
    }

    #[test]
    fn fixture_parses_from_toml_shaped_json() {
        let fixture: HostFixture = serde_json::from_value(serde_json::json!({
            "host": { "app_domain": "http://mp.local" },
            "downloaders": [{ "name": "tr", "kind": "transmission", "torrents": { "abc": ["keep"] } }],
            "sites": [{ "id": 1, "name": "alpha" }],
            "samples": [{ "name": "alpha", "ratio": 0.5, "updated_day": "2024-05-01" }],
            "settings": { "RatioWatcher": { "enabled": true } },
            "events": [{ "kind": "site.refreshed", "data": { "site_id": "*" } }],
        }))
        .unwrap();
        let host = InMemoryHost::from_fixture(&fixture);
        assert_eq!(host.client("tr").unwrap().torrent_tags("abc"), vec!["keep".to_string()]);
        assert!(fixture.sites[0].is_active);
        assert_eq!(fixture.events.len(), 1);
    }

    #[test]
    fn failing_collaborators_return_host_errors() {
        let mut host = InMemoryHost::new();
        let client = host.add_downloader(downloader("tr", DownloaderKind::Transmission));
        client.set_failing(true);
        assert!(matches!(ReplacingTagger::tags(client.as_ref(), "abc"), Err(HostError::Rpc(_))));
        assert_eq!(host.tag_calls().len(), 1);

        host.set_store_down(true);
        assert!(matches!(host.user_data(), Err(HostError::Store(_))));
        assert!(matches!(host.sites(), Err(HostError::Store(_))));
        assert_eq!(host.user_data_reads(), 1);

        host.set_notifier_down(true);
        let posted = host.post(Notification {
            kind: crate::host::NotificationKind::SiteMessage,
            title: "t".into(),
            text: String::new(),
            link: None,
        });
        assert!(matches!(posted, Err(HostError::Notify(_))));
        assert!(host.notifications().is_empty());
    }
}
