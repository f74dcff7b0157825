//! Typed lifecycle events and an in-process publish/subscribe bus.
//!
//! Publishing never blocks: each subscriber owns a bounded queue and events
//! that do not fit are dropped.

use std::{collections::HashSet, sync::Arc, time::SystemTime};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const SUBSCRIBER_QUEUE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Error,
    PlayerJoin,
    PlayerLeave,
    ContainerStart,
    ContainerStop,
    ProcessTimeout,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Error,
        EventKind::PlayerJoin,
        EventKind::PlayerLeave,
        EventKind::ContainerStart,
        EventKind::ContainerStop,
        EventKind::ProcessTimeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Error => "Error",
            EventKind::PlayerJoin => "PlayerJoin",
            EventKind::PlayerLeave => "PlayerLeave",
            EventKind::ContainerStart => "ContainerStart",
            EventKind::ContainerStop => "ContainerStop",
            EventKind::ProcessTimeout => "ProcessTimeout",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub occurred_at: String,
    pub data: EventData,
    /// Webhook ids this event is addressed to; empty means everyone.
    #[serde(skip)]
    pub targets: Arc<[String]>,
}

impl Event {
    pub fn new(kind: EventKind, data: EventData) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            occurred_at: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
            data,
            targets: Arc::from(Vec::new()),
        }
    }

    pub fn with_targets(mut self, targets: &[String]) -> Self {
        self.targets = Arc::from(targets);
        self
    }
}

#[derive(Debug)]
struct Subscriber {
    id: String,
    /// `None` takes every topic.
    topics: Option<HashSet<EventKind>>,
    /// Only deliver untargeted events or ones naming this subscriber.
    targeted: bool,
    tx: mpsc::Sender<Event>,
}

impl Subscriber {
    fn wants(&self, ev: &Event) -> bool {
        if let Some(topics) = &self.topics {
            if !topics.contains(&ev.kind) {
                return false;
            }
        }
        !self.targeted || ev.targets.is_empty() || ev.targets.iter().any(|t| t == &self.id)
    }
}

#[derive(Debug)]
pub struct EventBus {
    subscribers: ArcSwap<Vec<Arc<Subscriber>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Registers a subscriber; an existing one with the same id is replaced.
    /// An empty `topics` list subscribes to everything.
    pub fn subscribe(&self, id: &str, topics: &[EventKind], targeted: bool) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let sub = Arc::new(Subscriber {
            id: id.to_string(),
            topics: if topics.is_empty() {
                None
            } else {
                Some(topics.iter().copied().collect())
            },
            targeted,
            tx,
        });
        self.subscribers.rcu(|cur| {
            let mut next: Vec<Arc<Subscriber>> = cur.iter().filter(|s| s.id != id).cloned().collect();
            next.push(sub.clone());
            next
        });
        rx
    }

    pub fn unsubscribe(&self, id: &str) {
        self.subscribers
            .rcu(|cur| cur.iter().filter(|s| s.id != id).cloned().collect::<Vec<_>>());
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        self.subscribers.load().iter().map(|s| s.id.clone()).collect()
    }

    pub fn publish(&self, ev: Event) {
        tracing::debug!(event = ev.kind.as_str(), id = %ev.id, "events: publish");
        for sub in self.subscribers.load().iter() {
            if !sub.wants(&ev) {
                continue;
            }
            match sub.tx.try_send(ev.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::counter!("lodestone_events_dropped_total").increment(1);
                    tracing::debug!(subscriber = %sub.id, event = ev.kind.as_str(), "events: subscriber queue full, dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn emit(&self, kind: EventKind, data: EventData) {
        self.publish(Event::new(kind, data));
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_shape() {
        let ev = Event::new(
            EventKind::PlayerJoin,
            EventData {
                username: Some("notch".into()),
                remote_address: Some("1.2.3.4:5".into()),
                ..Default::default()
            },
        )
        .with_targets(&["hook".into()]);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "PlayerJoin");
        assert_eq!(v["data"]["username"], "notch");
        assert_eq!(v["data"]["remoteAddress"], "1.2.3.4:5");
        assert!(v["data"].get("error").is_none());
        assert!(v.get("targets").is_none());
        assert!(v["occurredAt"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn kinds_parse_from_names() {
        for k in EventKind::ALL {
            let parsed: EventKind = serde_json::from_value(serde_json::json!(k.as_str())).unwrap();
            assert_eq!(parsed, k);
        }
    }

    #[tokio::test]
    async fn topics_and_targets_filter() {
        let bus = EventBus::new();
        let mut all = bus.subscribe("all", &[], false);
        let mut joins = bus.subscribe("joins", &[EventKind::PlayerJoin], true);

        bus.emit(EventKind::Error, EventData::default());
        bus.publish(Event::new(EventKind::PlayerJoin, EventData::default()).with_targets(&["other".into()]));
        bus.publish(Event::new(EventKind::PlayerJoin, EventData::default()).with_targets(&["joins".into()]));
        bus.emit(EventKind::PlayerJoin, EventData::default());

        let mut kinds = Vec::new();
        while let Ok(ev) = all.try_recv() {
            kinds.push(ev.kind);
        }
        assert_eq!(
            kinds,
            vec![EventKind::Error, EventKind::PlayerJoin, EventKind::PlayerJoin, EventKind::PlayerJoin]
        );

        let mut n = 0;
        while let Ok(ev) = joins.try_recv() {
            assert_eq!(ev.kind, EventKind::PlayerJoin);
            n += 1;
        }
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("slow", &[], false);
        for _ in 0..SUBSCRIBER_QUEUE + 25 {
            bus.emit(EventKind::Error, EventData::default());
        }
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        assert_eq!(n, SUBSCRIBER_QUEUE);
    }

    #[test]
    fn resubscribe_replaces_and_unsubscribe_removes() {
        let bus = EventBus::new();
        let _a = bus.subscribe("a", &[], false);
        let _a2 = bus.subscribe("a", &[], false);
        let _b = bus.subscribe("b", &[], false);
        assert_eq!(bus.subscriber_ids(), vec!["a", "b"]);
        bus.unsubscribe("a");
        assert_eq!(bus.subscriber_ids(), vec!["b"]);
    }
}
