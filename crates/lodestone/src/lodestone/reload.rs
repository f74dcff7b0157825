//! The single writer for the registry and the running gateway set.
//!
//! Admin requests and the file watcher both send [`ReloadRequest`]s here;
//! they are applied one at a time, so readers only ever see whole snapshots.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use tokio::sync::{mpsc, oneshot, watch};

use crate::lodestone::{
    config::{ConfigSet, ConfigSource, GatewayConfig, ServerConfig},
    events::{EventBus, EventData, EventKind},
    gateway::RunningGateway,
    process::ProcessHandle,
    registry::Registry,
    server::Server,
    webhook::WebhookSet,
    worker::Accepted,
};

#[derive(Debug, Clone)]
pub enum ReloadRequest {
    /// Re-read gateways, servers and webhooks from the config source.
    Full,
    UpsertServer(ServerConfig),
    RemoveServer(String),
}

pub type Envelope = (ReloadRequest, oneshot::Sender<anyhow::Result<()>>);

/// Cloneable handle used to submit requests to the [`Reloader`].
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<Envelope>,
}

impl ReloadHandle {
    /// Submits a request and waits for it to be applied.
    pub async fn request(&self, req: ReloadRequest) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send((req, done))
            .await
            .map_err(|_| anyhow::anyhow!("reload: serialiser stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("reload: serialiser stopped"))?
    }
}

pub fn channel() -> (ReloadHandle, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(32);
    (ReloadHandle { tx }, rx)
}

pub struct Reloader {
    source: Arc<dyn ConfigSource>,
    registry: Arc<Registry>,
    events: Arc<EventBus>,
    queue: flume::Sender<Accepted>,
    gateways: HashMap<String, RunningGateway>,
    processes: HashMap<String, Arc<ProcessHandle>>,
    webhooks: WebhookSet,
}

impl Reloader {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        registry: Arc<Registry>,
        events: Arc<EventBus>,
        queue: flume::Sender<Accepted>,
    ) -> Self {
        Self {
            webhooks: WebhookSet::new(events.clone()),
            source,
            registry,
            events,
            queue,
            gateways: HashMap::new(),
            processes: HashMap::new(),
        }
    }

    pub fn gateway_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.gateways.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn gateway(&self, id: &str) -> Option<&RunningGateway> {
        self.gateways.get(id)
    }

    /// Process handles survive a reload when neither the process descriptor
    /// nor the webhook targets changed, so idle timers and wake locks carry over.
    /// Nothing is recorded here; callers commit once the registry accepts.
    fn build_server(&self, cfg: ServerConfig) -> Arc<Server> {
        let process = cfg.process.as_ref().map(|pc| {
            self.processes
                .get(&cfg.id)
                .filter(|h| h.config() == pc && h.targets() == cfg.webhooks.as_slice())
                .cloned()
                .unwrap_or_else(|| {
                    Arc::new(ProcessHandle::new(&cfg.id, pc.clone(), self.events.clone(), cfg.webhooks.clone()))
                })
        });
        Arc::new(Server::new(cfg, process))
    }

    fn commit_process(&mut self, server: &Server) {
        match &server.process {
            Some(handle) => {
                self.processes.insert(server.config.id.clone(), handle.clone());
            }
            None => {
                self.processes.remove(&server.config.id);
            }
        }
    }

    pub async fn apply(&mut self, req: ReloadRequest) -> anyhow::Result<()> {
        let res = match req {
            ReloadRequest::Full => self.full().await,
            ReloadRequest::UpsertServer(cfg) => {
                let id = cfg.id.clone();
                let server = self.build_server(cfg);
                match self.registry.upsert_server(server.clone()) {
                    Ok(snap) => {
                        self.commit_process(&server);
                        tracing::info!(server = %id, version = snap.version, "reload: server upserted");
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                }
            }
            ReloadRequest::RemoveServer(id) => {
                self.processes.remove(&id);
                match self.registry.remove_server(&id) {
                    Some(_) => {
                        tracing::info!(server = %id, "reload: server removed");
                        Ok(())
                    }
                    None => Err(anyhow::anyhow!("reload: no server {id:?}")),
                }
            }
        };
        if let Err(err) = &res {
            tracing::warn!(err = %format!("{err:#}"), "reload: rejected, keeping previous configuration");
            self.events.emit(
                EventKind::Error,
                EventData {
                    error: Some(format!("{err:#}")),
                    ..Default::default()
                },
            );
        }
        res
    }

    async fn full(&mut self) -> anyhow::Result<()> {
        let ConfigSet {
            gateways,
            servers,
            webhooks,
        } = self.source.load_all()?;

        let built: Vec<Arc<Server>> = servers.into_iter().map(|c| self.build_server(c)).collect();
        let processes: HashMap<String, Arc<ProcessHandle>> = built
            .iter()
            .filter_map(|s| s.process.clone().map(|p| (s.config.id.clone(), p)))
            .collect();
        let snap = self.registry.replace(built, gateways.clone())?;
        self.processes = processes;

        self.webhooks.sync(&webhooks);
        let res = self.sync_gateways(gateways).await;
        tracing::info!(
            version = snap.version,
            servers = snap.server_count(),
            gateways = self.gateways.len(),
            webhooks = self.webhooks.ids().len(),
            "reload: applied"
        );
        res
    }

    async fn sync_gateways(&mut self, wanted: Vec<GatewayConfig>) -> anyhow::Result<()> {
        let stale: Vec<String> = self
            .gateways
            .iter()
            .filter(|(id, running)| !wanted.iter().any(|g| &g.id == *id && g == running.config()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(gw) = self.gateways.remove(&id) {
                gw.stop().await;
            }
        }

        let mut failed = Vec::new();
        for g in wanted {
            if self.gateways.contains_key(&g.id) {
                continue;
            }
            let id = g.id.clone();
            match RunningGateway::start(g, self.queue.clone()).await {
                Ok(gw) => {
                    self.gateways.insert(id, gw);
                }
                Err(err) => {
                    tracing::warn!(gateway = %id, err = %format!("{err:#}"), "reload: gateway failed to start");
                    failed.push(format!("{err:#}"));
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(failed.join("; ")))
        }
    }

    pub async fn stop_gateways(&mut self) {
        for (_, gw) in self.gateways.drain() {
            gw.stop().await;
        }
    }

    /// Applies requests until shutdown, then stops every gateway.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Envelope>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                msg = rx.recv() => {
                    let Some((req, done)) = msg else { break };
                    let res = self.apply(req).await;
                    let _ = done.send(res);
                }
            }
        }
        self.stop_gateways().await;
    }
}

/// (mtime ms, len) of a file, or of every entry of a directory.
pub(crate) fn file_sig(path: &Path) -> anyhow::Result<Vec<(PathBuf, u64, u64)>> {
    fn one(p: &Path) -> anyhow::Result<(PathBuf, u64, u64)> {
        let meta = std::fs::metadata(p)?;
        let m = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Ok((p.to_path_buf(), m, meta.len()))
    }

    if !path.is_dir() {
        return Ok(vec![one(path)?]);
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(path)? {
        out.push(one(&entry?.path())?);
    }
    out.sort();
    Ok(out)
}

/// Polls the config file and servers directory and asks for a full reload
/// whenever either signature changes.
pub async fn watch_files(
    paths: Vec<PathBuf>,
    poll: Duration,
    handle: ReloadHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let sig = |paths: &[PathBuf]| -> Vec<_> { paths.iter().map(|p| file_sig(p).ok()).collect() };
    let mut last = sig(&paths);
    let poll = poll.max(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => break,
            _ = tokio::time::sleep(poll) => {}
        }
        let now = sig(&paths);
        if now == last {
            continue;
        }
        last = now;
        tracing::info!("reload: change detected on disk");
        if let Err(err) = handle.request(ReloadRequest::Full).await {
            tracing::debug!(err = %format!("{err:#}"), "reload: watcher request failed");
        }
    }
}
