use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::lodestone::{
    config::WebhookConfig,
    events::{Event, EventBus},
};

/// One bus subscriber and delivery task per configured webhook.
#[derive(Debug)]
pub struct WebhookSet {
    bus: Arc<EventBus>,
    http: reqwest::Client,
    hooks: HashMap<String, (WebhookConfig, JoinHandle<()>)>,
}

impl WebhookSet {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            http: reqwest::Client::new(),
            hooks: HashMap::new(),
        }
    }

    /// Makes the running set match `configs`. Unchanged hooks keep their queue.
    pub fn sync(&mut self, configs: &[WebhookConfig]) {
        self.hooks.retain(|id, (cfg, _)| {
            let keep = configs.iter().any(|c| c == cfg);
            if !keep {
                self.bus.unsubscribe(id);
                tracing::info!(webhook = %id, "webhook: removed");
            }
            keep
        });

        for cfg in configs {
            if self.hooks.contains_key(&cfg.id) {
                continue;
            }
            let rx = self.bus.subscribe(&cfg.id, &cfg.events, true);
            let task = tokio::spawn(deliver(self.http.clone(), cfg.clone(), rx));
            tracing::info!(webhook = %cfg.id, url = %cfg.url, "webhook: subscribed");
            self.hooks.insert(cfg.id.clone(), (cfg.clone(), task));
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hooks.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for WebhookSet {
    fn drop(&mut self) {
        for (id, (_, task)) in self.hooks.drain() {
            self.bus.unsubscribe(&id);
            task.abort();
        }
    }
}

async fn deliver(http: reqwest::Client, cfg: WebhookConfig, mut rx: mpsc::Receiver<Event>) {
    while let Some(ev) = rx.recv().await {
        if let Err(err) = post(&http, &cfg, &ev).await {
            tracing::warn!(webhook = %cfg.id, event = ev.kind.as_str(), err = %format!("{err:#}"), "webhook: delivery failed");
        }
    }
}

async fn post(http: &reqwest::Client, cfg: &WebhookConfig, ev: &Event) -> anyhow::Result<()> {
    http.post(&cfg.url)
        .timeout(cfg.timeout)
        .json(ev)
        .send()
        .await
        .with_context(|| format!("post {}", cfg.url))?
        .error_for_status()
        .with_context(|| format!("post {}", cfg.url))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};

    use super::*;
    use crate::lodestone::events::{EventData, EventKind};

    async fn sink() -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        async fn collect(
            State(tx): State<mpsc::UnboundedSender<serde_json::Value>>,
            Json(v): Json<serde_json::Value>,
        ) -> StatusCode {
            let _ = tx.send(v);
            StatusCode::NO_CONTENT
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new().route("/hook", post(collect)).with_state(tx);
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(ln, app).await;
        });
        (format!("http://{addr}/hook"), rx)
    }

    fn hook(id: &str, url: &str, events: Vec<EventKind>) -> WebhookConfig {
        WebhookConfig {
            id: id.into(),
            url: url.into(),
            events,
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn delivers_matching_events_as_json() {
        let (url, mut got) = sink().await;
        let bus = Arc::new(EventBus::new());
        let mut set = WebhookSet::new(bus.clone());
        set.sync(&[hook("joins", &url, vec![EventKind::PlayerJoin])]);

        bus.emit(EventKind::Error, EventData::default());
        bus.publish(
            Event::new(
                EventKind::PlayerJoin,
                EventData {
                    username: Some("notch".into()),
                    ..Default::default()
                },
            )
            .with_targets(&["someone-else".into()]),
        );
        bus.emit(
            EventKind::PlayerJoin,
            EventData {
                username: Some("steve".into()),
                ..Default::default()
            },
        );

        let v = tokio::time::timeout(Duration::from_secs(2), got.recv()).await.unwrap().unwrap();
        assert_eq!(v["type"], "PlayerJoin");
        assert_eq!(v["data"]["username"], "steve");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(got.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_endpoint_does_not_block_publish() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = format!("http://{}/hook", ln.local_addr().unwrap());
        drop(ln);
        let (url, mut got) = sink().await;

        let bus = Arc::new(EventBus::new());
        let mut set = WebhookSet::new(bus.clone());
        set.sync(&[hook("dead", &dead, vec![]), hook("live", &url, vec![])]);
        for _ in 0..500 {
            bus.emit(EventKind::Error, EventData::default());
        }
        let v = tokio::time::timeout(Duration::from_secs(2), got.recv()).await.unwrap().unwrap();
        assert_eq!(v["type"], "Error");
    }

    #[tokio::test]
    async fn sync_replaces_and_removes() {
        let bus = Arc::new(EventBus::new());
        let mut set = WebhookSet::new(bus.clone());
        set.sync(&[hook("a", "http://127.0.0.1:1/a", vec![]), hook("b", "http://127.0.0.1:1/b", vec![])]);
        assert_eq!(set.ids(), vec!["a", "b"]);

        set.sync(&[hook("b", "http://127.0.0.1:1/b2", vec![])]);
        assert_eq!(set.ids(), vec!["b"]);
        assert_eq!(bus.subscriber_ids(), vec!["b"]);
        drop(set);
        assert!(bus.subscriber_ids().is_empty());
    }
}
