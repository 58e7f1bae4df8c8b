//! Host events and the synchronous bus that delivers them to plugins.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, Weak,
    },
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Marker carried by a site refresh that covered every site.
pub const ALL_SITES: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "download.added")]
    DownloadAdded,
    #[serde(rename = "site.refreshed")]
    SiteRefreshed,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::DownloadAdded, EventKind::SiteRefreshed];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::DownloadAdded => "download.added",
            EventKind::SiteRefreshed => "site.refreshed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as emitted by the host. The payload is whatever the emitter
/// attached and may be missing entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Event {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            data: Some(data),
        }
    }

    pub fn empty(kind: EventKind) -> Self {
        Self { kind, data: None }
    }

    pub fn download_added(hash: impl Into<String>, downloader: impl Into<String>) -> Self {
        let payload = DownloadAdded {
            hash: hash.into(),
            downloader: downloader.into(),
        };
        Self::new(
            EventKind::DownloadAdded,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }

    pub fn site_refreshed(site_id: impl Into<String>) -> Self {
        Self::new(
            EventKind::SiteRefreshed,
            serde_json::json!({ "site_id": site_id.into() }),
        )
    }

    /// Decodes the payload, returning `None` when it is absent, null, an empty
    /// object, or does not fit `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Option<T> {
        match self.data.as_ref()? {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            value => serde_json::from_value(value.clone()).ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadAdded {
    pub hash: String,
    pub downloader: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRefreshed {
    #[serde(deserialize_with = "string_or_number")]
    pub site_id: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "site_id must be a string or number, got {other}"
        ))),
    }
}

impl SiteRefreshed {
    pub fn covers_all_sites(&self) -> bool {
        self.site_id == ALL_SITES
    }
}

/// Receives events the owner subscribed to. Errors are logged by the bus and
/// never reach the publisher.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

struct Slot {
    id: u64,
    kind: EventKind,
    handler: Arc<dyn EventHandler>,
}

type Slots = RwLock<Vec<Slot>>;

#[derive(Clone, Default)]
pub struct EventBus {
    slots: Arc<Slots>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`. The handler stays registered for as
    /// long as the returned guard is alive.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(handler = handler.name(), event = %kind, id, "subscribed");
        let mut slots = self.slots.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.push(Slot { id, kind, handler });
        Subscription {
            id,
            kind,
            slots: Arc::downgrade(&self.slots),
        }
    }

    /// Delivers `event` to every current subscriber of its kind, in
    /// subscription order, on the caller's thread. Returns the number of
    /// handlers that ran.
    pub fn publish(&self, event: &Event) -> usize {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let slots = self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            slots
                .iter()
                .filter(|slot| slot.kind == event.kind)
                .map(|slot| slot.handler.clone())
                .collect()
        };

        for handler in &handlers {
            match handler.handle(event) {
                Ok(()) => {
                    metrics::counter!("hookline_events_total", "kind" => event.kind.as_str(), "outcome" => "ok")
                        .increment(1);
                }
                Err(err) => {
                    tracing::error!(handler = handler.name(), event = %event.kind, error = %err, "event handler failed");
                    metrics::counter!("hookline_events_total", "kind" => event.kind.as_str(), "outcome" => "error")
                        .increment(1);
                }
            }
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let slots = self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.iter().filter(|slot| slot.kind == kind).count()
    }
}

/// Subscription guard returned by [`EventBus::subscribe`].
pub struct Subscription {
    id: u64,
    kind: EventKind,
    slots: Weak<Slots>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            let mut slots = slots.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            slots.retain(|slot| slot.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<EventKind>>,
        fail: bool,
    }

    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn handle(&self, event: &Event) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(event.kind);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[test]
    fn publish_reaches_only_matching_subscribers() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let _sub = bus.subscribe(EventKind::SiteRefreshed, recorder.clone());

        assert_eq!(bus.publish(&Event::download_added("abc", "qb")), 0);
        assert_eq!(bus.publish(&Event::site_refreshed(ALL_SITES)), 1);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![EventKind::SiteRefreshed]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let sub = bus.subscribe(EventKind::DownloadAdded, recorder.clone());
        assert_eq!(bus.subscriber_count(EventKind::DownloadAdded), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(EventKind::DownloadAdded), 0);
        assert_eq!(bus.publish(&Event::download_added("abc", "qb")), 0);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn handler_errors_do_not_stop_delivery() {
        let bus = EventBus::new();
        let failing = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(Recorder::default());
        let _a = bus.subscribe(EventKind::DownloadAdded, failing.clone());
        let _b = bus.subscribe(EventKind::DownloadAdded, healthy.clone());

        assert_eq!(bus.publish(&Event::download_added("abc", "qb")), 2);
        assert_eq!(healthy.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_payloads_decode_to_none() {
        assert_eq!(Event::empty(EventKind::DownloadAdded).payload::<DownloadAdded>(), None);
        let empty_object = Event::new(EventKind::DownloadAdded, serde_json::json!({}));
        assert_eq!(empty_object.payload::<DownloadAdded>(), None);
        let missing_field = Event::new(EventKind::DownloadAdded, serde_json::json!({ "hash": "abc" }));
        assert_eq!(missing_field.payload::<DownloadAdded>(), None);
    }

    #[test]
    fn site_refresh_marker() {
        let all: SiteRefreshed = Event::site_refreshed("*").payload().unwrap();
        assert!(all.covers_all_sites());
        let one: SiteRefreshed = Event::new(EventKind::SiteRefreshed, serde_json::json!({ "site_id": 3 }))
            .payload()
            .unwrap();
        assert_eq!(one.site_id, "3");
        assert!(!one.covers_all_sites());
    }
}
