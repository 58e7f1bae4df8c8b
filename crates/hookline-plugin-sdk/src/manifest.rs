use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Static metadata a plugin reports to the host's plugin market.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub version: String,
    pub author: Option<String>,
    pub author_url: Option<String>,
    pub config_prefix: String,
    pub order: u32,
    pub auth_level: u8,
    pub events: Vec<String>,
}

impl PluginManifest {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }

    pub fn semver(&self) -> Result<semver::Version> {
        semver::Version::parse(&self.version)
            .with_context(|| format!("plugin `{}` has invalid version `{}`", self.id, self.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_reports_subscribed_events() {
        let manifest = PluginManifest {
            id: "Demo".into(),
            version: "1.0.1".into(),
            events: vec!["download.added".into()],
            ..Default::default()
        };
        assert!(manifest.subscribes_to("download.added"));
        assert!(!manifest.subscribes_to("site.refreshed"));
        assert_eq!(manifest.semver().unwrap(), semver::Version::new(1, 0, 1));
    }

    #[test]
    fn invalid_version_names_the_plugin() {
        let manifest = PluginManifest {
            id: "Demo".into(),
            version: "one".into(),
            ..Default::default()
        };
        let err = manifest.semver().unwrap_err();
        assert!(err.to_string().contains("Demo"));
    }
}
