//! Watches per-site share ratios after every full site refresh and sends one
//! batched notification when any enabled site falls below its threshold.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use anyhow::{Context, Result};
use hookline_plugin_sdk::{FormNode, PluginManifest};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    config::{site_enabled_key, site_ratio_key, RatioWatcherConfig, ENABLED_KEY, RUN_ONCE_KEY},
    event::{Event, EventBus, EventHandler, EventKind, SiteRefreshed, Subscription},
    host::{HostContext, Notification, NotificationKind, SiteInfo, SiteRatioSample},
    plugin::HostPlugin,
};

pub const PLUGIN_ID: &str = "RatioWatcher";
pub const ALERT_TITLE: &str = "Site share ratio too low";

/// Ratio reported for sites that take no part in alerting.
pub const EXCLUDED_RATIO: f64 = -1.0;

pub fn manifest() -> PluginManifest {
    PluginManifest {
        id: PLUGIN_ID.into(),
        name: "Site share ratio monitor".into(),
        description: Some("Sends a notification when a site's share ratio drops below a threshold".into()),
        icon: Some("world.png".into()),
        version: "1.0.1".into(),
        author: Some("velor2012".into()),
        author_url: Some("https://github.com/velor2012".into()),
        config_prefix: "ShareRatioAlter".into(),
        order: 21,
        auth_level: 2,
        events: vec![EventKind::SiteRefreshed.as_str().into()],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", content = "ratio", rename_all = "lowercase")]
pub enum RatioStatus {
    Measured(f64),
    /// Site is watched but its latest sample has no ratio.
    Unknown,
    /// Site is not configured or switched off.
    Excluded,
}

impl RatioStatus {
    pub fn value(&self) -> f64 {
        match self {
            RatioStatus::Measured(ratio) => *ratio,
            RatioStatus::Unknown | RatioStatus::Excluded => EXCLUDED_RATIO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteRatio {
    pub name: String,
    pub status: RatioStatus,
}

/// Keeps the newest sample of every site, by `updated_day`. Among samples of
/// the same day the one appearing later in `samples` wins. Sites keep the
/// order of their first appearance.
pub fn latest_samples(samples: Vec<SiteRatioSample>) -> Vec<SiteRatioSample> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut latest: Vec<SiteRatioSample> = Vec::new();
    for sample in samples {
        match index.get(&sample.name) {
            Some(&slot) => {
                if sample.updated_day >= latest[slot].updated_day {
                    latest[slot] = sample;
                }
            }
            None => {
                index.insert(sample.name.clone(), latest.len());
                latest.push(sample);
            }
        }
    }
    latest
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Latest ratio per site, highest first, with unwatched and unknown sites
/// last.
pub fn aggregate(samples: Vec<SiteRatioSample>, config: &RatioWatcherConfig) -> Vec<SiteRatio> {
    let mut report: Vec<SiteRatio> = latest_samples(samples)
        .into_iter()
        .map(|sample| {
            let status = match (config.enabled_site(&sample.name), sample.ratio) {
                (None, _) => RatioStatus::Excluded,
                (Some(_), Some(ratio)) if ratio.is_finite() => RatioStatus::Measured(round2(ratio)),
                (Some(_), _) => RatioStatus::Unknown,
            };
            SiteRatio {
                name: sample.name,
                status,
            }
        })
        .collect();
    report.sort_by(|a, b| b.status.value().total_cmp(&a.status.value()));
    report
}

/// One line group per watched site whose ratio is under its threshold.
pub fn violations(report: &[SiteRatio], config: &RatioWatcherConfig) -> Vec<String> {
    report
        .iter()
        .filter_map(|entry| {
            let RatioStatus::Measured(ratio) = entry.status else {
                return None;
            };
            let threshold = config.enabled_site(&entry.name)?.threshold.ratio()?;
            tracing::debug!(plugin = PLUGIN_ID, site = %entry.name, ratio, threshold, "checking ratio");
            (ratio < threshold).then(|| {
                format!(
                    "{} share ratio too low!\nratio: {ratio:.2} threshold: {threshold:.2}\n------------",
                    entry.name
                )
            })
        })
        .collect()
}

/// The aggregation and alert pass shared by the event handler and the manual
/// trigger.
struct RatioCheck {
    host: HostContext,
    config: Arc<RwLock<RatioWatcherConfig>>,
}

impl RatioCheck {
    /// Runs one pass and returns the number of violating sites.
    fn run(&self) -> Result<usize> {
        let samples = self
            .host
            .sites
            .user_data()
            .context("failed to load site user data")?;
        let config = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let report = aggregate(samples, &config);
        tracing::info!(plugin = PLUGIN_ID, sites = report.len(), "site ratios aggregated");

        let lines = violations(&report, &config);
        if lines.is_empty() {
            return Ok(0);
        }
        let notification = Notification {
            kind: NotificationKind::SiteMessage,
            title: ALERT_TITLE.into(),
            text: lines.join("\n"),
            link: self.host.config.plugin_link(PLUGIN_ID),
        };
        self.host
            .notifier
            .post(notification)
            .context("failed to send ratio alert")?;
        metrics::counter!("hookline_ratio_alerts_total").increment(1);
        tracing::info!(plugin = PLUGIN_ID, violations = lines.len(), "ratio alert sent");
        Ok(lines.len())
    }
}

pub struct RatioWatcher {
    manifest: PluginManifest,
    check: Arc<RatioCheck>,
    subscription: Option<Subscription>,
}

impl RatioWatcher {
    pub fn new(host: HostContext) -> Self {
        Self {
            manifest: manifest(),
            check: Arc::new(RatioCheck {
                host,
                config: Arc::default(),
            }),
            subscription: None,
        }
    }

    pub fn config(&self) -> RatioWatcherConfig {
        self.check
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Active sites in priority order; these are the configurable entities.
    fn site_options(&self) -> Vec<SiteInfo> {
        match self.check.host.sites.sites() {
            Ok(sites) => {
                let mut sites: Vec<SiteInfo> = sites.into_iter().filter(|site| site.is_active).collect();
                sites.sort_by_key(|site| site.pri);
                sites
            }
            Err(err) => {
                tracing::warn!(plugin = PLUGIN_ID, error = %err, "failed to list sites");
                Vec::new()
            }
        }
    }
}

impl HostPlugin for RatioWatcher {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn init(&mut self, settings: &mut Value) -> Result<()> {
        tracing::info!(plugin = PLUGIN_ID, "initialising");
        let sites = self.site_options();
        let mut config = RatioWatcherConfig::from_settings(settings, &sites);
        let run_once = config.run_once;
        if run_once {
            config.run_once = false;
            if let Some(map) = settings.as_object_mut() {
                map.insert(RUN_ONCE_KEY.into(), Value::Bool(false));
            }
        }
        tracing::info!(
            plugin = PLUGIN_ID,
            enabled = config.enabled,
            sites = config.sites.len(),
            "configuration applied"
        );
        *self
            .check
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;

        if run_once {
            tracing::info!(plugin = PLUGIN_ID, "running one check now");
            if let Err(err) = self.check.run() {
                tracing::error!(plugin = PLUGIN_ID, error = %err, "manual ratio check failed");
            }
        }
        Ok(())
    }

    fn subscribe(&mut self, bus: &EventBus) {
        let handler = SiteRefreshedHandler {
            check: self.check.clone(),
        };
        self.subscription = Some(bus.subscribe(EventKind::SiteRefreshed, Arc::new(handler)));
    }

    fn state(&self) -> bool {
        self.check
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enabled
    }

    fn form(&self) -> Result<(Vec<FormNode>, Value)> {
        let sites = self.site_options();

        let mut rows = vec![FormNode::row(vec![
            FormNode::col(12, vec![FormNode::switch(ENABLED_KEY, "Enable plugin")]),
            FormNode::col(12, vec![FormNode::switch(RUN_ONCE_KEY, "Run once now")]).prop("md", 4),
        ])];
        for site in &sites {
            rows.push(FormNode::row(vec![
                FormNode::col(
                    6,
                    vec![FormNode::number_field(site_ratio_key(&site.name), site.name.clone())
                        .prop("hint", "Notify when the share ratio drops below this value")],
                ),
                FormNode::col(
                    4,
                    vec![FormNode::switch(site_enabled_key(&site.name), "Enabled")],
                ),
            ]));
        }

        let mut defaults = Map::new();
        defaults.insert(ENABLED_KEY.into(), Value::Bool(false));
        defaults.insert(RUN_ONCE_KEY.into(), Value::Bool(false));
        for site in &sites {
            defaults.insert(site_enabled_key(&site.name), Value::Bool(false));
        }
        Ok((rows, Value::Object(defaults)))
    }

    fn stop(&mut self) -> Result<()> {
        tracing::info!(plugin = PLUGIN_ID, "stopping");
        self.subscription.take();
        Ok(())
    }
}

struct SiteRefreshedHandler {
    check: Arc<RatioCheck>,
}

impl EventHandler for SiteRefreshedHandler {
    fn name(&self) -> &str {
        PLUGIN_ID
    }

    fn handle(&self, event: &Event) -> Result<()> {
        let enabled = self
            .check
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enabled;
        if !enabled {
            tracing::debug!(plugin = PLUGIN_ID, "plugin disabled; ignoring refresh");
            return Ok(());
        }
        let Some(refresh) = event.payload::<SiteRefreshed>() else {
            tracing::warn!(plugin = PLUGIN_ID, "site refresh event carried no usable payload");
            return Ok(());
        };
        if !refresh.covers_all_sites() {
            tracing::debug!(plugin = PLUGIN_ID, site = %refresh.site_id, "single-site refresh ignored");
            return Ok(());
        }
        self.check.run().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;
    use crate::{event::ALL_SITES, host::HostConfig, memory::InMemoryHost, test_support::count_errors};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn sample(name: &str, ratio: Option<f64>, d: u32) -> SiteRatioSample {
        SiteRatioSample {
            name: name.into(),
            domain: format!("{name}.example"),
            ratio,
            updated_day: day(d),
        }
    }

    fn site(id: i64, name: &str, pri: i32) -> SiteInfo {
        SiteInfo {
            id,
            name: name.into(),
            domain: format!("{name}.example"),
            is_active: true,
            pri,
        }
    }

    fn sites() -> Vec<SiteInfo> {
        vec![site(1, "alpha", 1), site(2, "beta", 2), site(3, "gamma", 3)]
    }

    fn watched(settings: Value) -> RatioWatcherConfig {
        RatioWatcherConfig::from_settings(&settings, &sites())
    }

    fn setup(samples: Vec<SiteRatioSample>, settings: Value) -> (Arc<InMemoryHost>, EventBus, RatioWatcher, Value) {
        let host = InMemoryHost::new();
        host.set_sites(sites());
        host.set_samples(samples);
        let host = Arc::new(host);
        let bus = EventBus::new();
        let mut plugin = RatioWatcher::new(host.context(HostConfig {
            app_domain: Some("http://mp.local".into()),
        }));
        let mut settings = settings;
        plugin.init(&mut settings).unwrap();
        plugin.subscribe(&bus);
        (host, bus, plugin, settings)
    }

    fn all_enabled() -> Value {
        json!({
            "enabled": true,
            "alpha_enabled": true, "alpha_ratio": 1.0,
            "beta_enabled": true, "beta_ratio": 1.0,
            "gamma_enabled": true, "gamma_ratio": 1.0,
        })
    }

    #[test]
    fn newest_sample_wins() {
        let latest = latest_samples(vec![sample("alpha", Some(1.2), 2), sample("alpha", Some(0.5), 1)]);
        assert_eq!(latest, vec![sample("alpha", Some(1.2), 2)]);
    }

    #[test]
    fn same_day_ties_go_to_the_later_sample() {
        let latest = latest_samples(vec![
            sample("alpha", Some(0.7), 3),
            sample("beta", Some(2.0), 1),
            sample("alpha", Some(0.9), 3),
        ]);
        assert_eq!(latest, vec![sample("alpha", Some(0.9), 3), sample("beta", Some(2.0), 1)]);
    }

    #[test]
    fn unwatched_sites_report_minus_one() {
        let config = watched(json!({ "alpha_enabled": true, "beta_enabled": false }));
        let report = aggregate(
            vec![
                sample("alpha", Some(0.5), 1),
                sample("alpha", Some(1.234), 2),
                sample("beta", Some(3.0), 2),
                sample("gamma", Some(4.0), 2),
            ],
            &config,
        );
        assert_eq!(
            report,
            vec![
                SiteRatio { name: "alpha".into(), status: RatioStatus::Measured(1.23) },
                SiteRatio { name: "beta".into(), status: RatioStatus::Excluded },
                SiteRatio { name: "gamma".into(), status: RatioStatus::Excluded },
            ]
        );
        assert_eq!(report[1].status.value(), EXCLUDED_RATIO);
    }

    #[test]
    fn report_is_sorted_by_ratio_descending() {
        let report = aggregate(
            vec![
                sample("alpha", Some(0.5), 1),
                sample("beta", None, 1),
                sample("gamma", Some(3.0), 1),
            ],
            &watched(all_enabled()),
        );
        let names: Vec<&str> = report.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["gamma", "alpha", "beta"]);
        assert_eq!(report[2].status, RatioStatus::Unknown);
    }

    #[test]
    fn violations_batch_into_one_notification() {
        let (host, bus, _plugin, _) = setup(
            vec![
                sample("alpha", Some(0.5), 1),
                sample("beta", Some(2.0), 1),
                sample("gamma", None, 1),
            ],
            all_enabled(),
        );
        bus.publish(&Event::site_refreshed(ALL_SITES));

        let sent = host.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, ALERT_TITLE);
        assert_eq!(sent[0].kind, NotificationKind::SiteMessage);
        assert_eq!(
            sent[0].text,
            "alpha share ratio too low!\nratio: 0.50 threshold: 1.00\n------------"
        );
        assert_eq!(
            sent[0].link.as_deref(),
            Some("http://mp.local/#/plugins?tab=installed&id=RatioWatcher")
        );
    }

    #[test]
    fn violation_lines_keep_two_decimals() {
        let config = watched(json!({ "alpha_enabled": true, "alpha_ratio": 1.0 }));
        let report = vec![SiteRatio { name: "alpha".into(), status: RatioStatus::Measured(0.8) }];
        assert_eq!(
            violations(&report, &config),
            vec!["alpha share ratio too low!\nratio: 0.80 threshold: 1.00\n------------".to_string()]
        );
    }

    #[test]
    fn unreadable_user_data_is_logged_not_raised() {
        let (host, bus, _plugin, _) = setup(vec![sample("alpha", Some(0.5), 1)], all_enabled());
        host.set_store_down(true);
        let mut delivered = 0;
        let errors = count_errors(|| {
            delivered = bus.publish(&Event::site_refreshed(ALL_SITES));
        });
        assert_eq!(delivered, 1);
        assert_eq!(errors, 1);
        assert_eq!(host.user_data_reads(), 1);
        assert!(host.notifications().is_empty());
    }

    #[test]
    fn undelivered_alert_is_logged_not_raised() {
        let (host, bus, _plugin, _) = setup(vec![sample("alpha", Some(0.5), 1)], all_enabled());
        host.set_notifier_down(true);
        let mut delivered = 0;
        let errors = count_errors(|| {
            delivered = bus.publish(&Event::site_refreshed(ALL_SITES));
        });
        assert_eq!(delivered, 1);
        assert_eq!(errors, 1);
        assert!(host.notifications().is_empty());
    }

    #[test]
    fn healthy_sites_stay_silent() {
        let (host, bus, _plugin, _) = setup(vec![sample("alpha", Some(1.5), 1)], all_enabled());
        bus.publish(&Event::site_refreshed(ALL_SITES));
        assert_eq!(host.user_data_reads(), 1);
        assert!(host.notifications().is_empty());
    }

    #[test]
    fn disabled_or_thresholdless_sites_never_alert() {
        let settings = json!({
            "enabled": true,
            "alpha_enabled": false, "alpha_ratio": 5.0,
            "beta_enabled": true,
            "gamma_enabled": true, "gamma_ratio": -1,
        });
        let (host, bus, _plugin, _) = setup(
            vec![
                sample("alpha", Some(0.1), 1),
                sample("beta", Some(0.1), 1),
                sample("gamma", Some(0.1), 1),
            ],
            settings,
        );
        bus.publish(&Event::site_refreshed(ALL_SITES));
        assert!(host.notifications().is_empty());
    }

    #[test]
    fn single_site_refreshes_and_disabled_plugin_are_ignored() {
        let (host, bus, _plugin, _) = setup(vec![sample("alpha", Some(0.5), 1)], all_enabled());
        bus.publish(&Event::site_refreshed("1"));
        bus.publish(&Event::empty(EventKind::SiteRefreshed));
        assert_eq!(host.user_data_reads(), 0);

        let mut settings = all_enabled();
        settings["enabled"] = json!(false);
        let (host, bus, _plugin, _) = setup(vec![sample("alpha", Some(0.5), 1)], settings);
        bus.publish(&Event::site_refreshed(ALL_SITES));
        assert_eq!(host.user_data_reads(), 0);
        assert!(host.notifications().is_empty());
    }

    #[test]
    fn run_once_checks_immediately_and_resets() {
        let mut settings = all_enabled();
        settings["onlyonce"] = json!(true);
        let (host, _bus, plugin, settings) = setup(vec![sample("alpha", Some(0.5), 1)], settings);

        assert_eq!(host.user_data_reads(), 1);
        assert_eq!(host.notifications().len(), 1);
        assert_eq!(settings["onlyonce"], json!(false));
        assert!(!plugin.config().run_once);
    }

    #[test]
    fn form_lists_active_sites_by_priority() {
        let host = InMemoryHost::new();
        host.set_sites(vec![
            site(1, "zeta", 9),
            SiteInfo { is_active: false, ..site(2, "off", 0) },
            site(3, "alpha", 1),
        ]);
        let plugin = RatioWatcher::new(Arc::new(host).context(HostConfig::default()));
        let (rows, defaults) = plugin.form().unwrap();
        let models: Vec<&str> = rows.iter().flat_map(|row| row.models()).collect();
        assert_eq!(
            models,
            vec!["enabled", "onlyonce", "alpha_ratio", "alpha_enabled", "zeta_ratio", "zeta_enabled"]
        );
        assert_eq!(
            defaults,
            json!({ "enabled": false, "onlyonce": false, "alpha_enabled": false, "zeta_enabled": false })
        );
    }
}
