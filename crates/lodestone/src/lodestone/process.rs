//! On-demand backend lifecycle: start a stopped backend when a player
//! arrives, stop it again once it has been empty for a while.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use tokio::{process::Child, time};

use crate::lodestone::{
    config::{ProcessConfig, ProcessKind},
    events::{EventBus, EventData, EventKind},
};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Docker Engine HTTP API client scoped to one container.
#[derive(Debug, Clone)]
pub struct DockerApi {
    base: String,
    container: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl DockerApi {
    pub fn new(base: &str, container: &str, api_key: Option<String>) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            container: container.to_string(),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, action: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/containers/{}{action}", self.base, self.container);
        let req = self.http.request(method, url).timeout(Duration::from_secs(30));
        match &self.api_key {
            Some(key) => req.header("X-API-Key", key),
            None => req,
        }
    }

    async fn post_action(&self, action: &str) -> anyhow::Result<()> {
        let resp = self
            .request(reqwest::Method::POST, action)
            .send()
            .await
            .with_context(|| format!("docker: {action} {}", self.container))?;
        let status = resp.status();
        // 304: already in the requested state.
        if status.is_success() || status == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        anyhow::bail!("docker: {action} {} returned {status}", self.container)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.post_action("/start").await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.post_action("/stop").await
    }

    pub async fn is_running(&self) -> anyhow::Result<bool> {
        let resp = self
            .request(reqwest::Method::GET, "/json")
            .send()
            .await
            .with_context(|| format!("docker: inspect {}", self.container))?
            .error_for_status()
            .with_context(|| format!("docker: inspect {}", self.container))?;
        let v: serde_json::Value = resp.json().await.context("docker: decode inspect")?;
        Ok(v["State"]["Running"].as_bool().unwrap_or(false))
    }
}

#[derive(Debug)]
pub enum ProcessController {
    Command {
        start: String,
        stop: String,
        child: Mutex<Option<Child>>,
    },
    Docker(DockerApi),
    Portainer(DockerApi),
}

fn shell(cmd: &str) -> tokio::process::Command {
    #[cfg(windows)]
    {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    }
    #[cfg(not(windows))]
    {
        let mut c = tokio::process::Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    }
}

impl ProcessController {
    pub fn from_config(kind: &ProcessKind) -> Self {
        match kind {
            ProcessKind::Command { start, stop } => ProcessController::Command {
                start: start.clone(),
                stop: stop.clone(),
                child: Mutex::new(None),
            },
            ProcessKind::Docker { endpoint, container } => {
                ProcessController::Docker(DockerApi::new(endpoint, container, None))
            }
            ProcessKind::Portainer {
                address,
                endpoint_id,
                api_key,
                container,
            } => ProcessController::Portainer(DockerApi::new(
                &format!("{}/api/endpoints/{endpoint_id}/docker", address.trim_end_matches('/')),
                container,
                Some(api_key.clone()),
            )),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProcessController::Command { start, .. } => start,
            ProcessController::Docker(api) | ProcessController::Portainer(api) => &api.container,
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        match self {
            ProcessController::Command { start, child, .. } => {
                let spawned = shell(start)
                    .kill_on_drop(false)
                    .spawn()
                    .with_context(|| format!("process: spawn {start:?}"))?;
                *child.lock().unwrap_or_else(|e| e.into_inner()) = Some(spawned);
                Ok(())
            }
            ProcessController::Docker(api) | ProcessController::Portainer(api) => api.start().await,
        }
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        match self {
            ProcessController::Command { stop, child, .. } => {
                let status = shell(stop)
                    .status()
                    .await
                    .with_context(|| format!("process: run {stop:?}"))?;
                if !status.success() {
                    anyhow::bail!("process: {stop:?} exited with {status}");
                }
                child.lock().unwrap_or_else(|e| e.into_inner()).take();
                Ok(())
            }
            ProcessController::Docker(api) | ProcessController::Portainer(api) => api.stop().await,
        }
    }

    pub async fn is_running(&self) -> anyhow::Result<bool> {
        match self {
            ProcessController::Command { child, .. } => {
                let mut guard = child.lock().unwrap_or_else(|e| e.into_inner());
                Ok(match guard.as_mut() {
                    Some(c) => matches!(c.try_wait(), Ok(None)),
                    None => false,
                })
            }
            ProcessController::Docker(api) | ProcessController::Portainer(api) => api.is_running().await,
        }
    }
}

/// A server's controller plus its inactivity watchdog.
#[derive(Debug)]
pub struct ProcessHandle {
    server_id: String,
    config: ProcessConfig,
    controller: ProcessController,
    events: Arc<EventBus>,
    targets: Vec<String>,
    active: AtomicUsize,
    /// Bumped on every join/leave; a pending stop only fires if unchanged.
    epoch: AtomicU64,
    waking: tokio::sync::Mutex<()>,
}

impl ProcessHandle {
    pub fn new(server_id: &str, config: ProcessConfig, events: Arc<EventBus>, targets: Vec<String>) -> Self {
        Self {
            server_id: server_id.to_string(),
            controller: ProcessController::from_config(&config.kind),
            config,
            events,
            targets,
            active: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            waking: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn emit(&self, kind: EventKind, error: Option<String>) {
        self.events.publish(
            crate::lodestone::events::Event::new(
                kind,
                EventData {
                    server_id: Some(self.server_id.clone()),
                    container: Some(self.controller.name().to_string()),
                    error,
                    ..Default::default()
                },
            )
            .with_targets(&self.targets),
        );
    }

    /// Starts the backend if needed and waits up to `timeout` for it to
    /// report running. Concurrent callers share one start attempt.
    pub async fn wake(&self, timeout: Duration) -> bool {
        let _guard = self.waking.lock().await;
        if self.controller.is_running().await.unwrap_or(false) {
            return true;
        }

        tracing::info!(server = %self.server_id, container = %self.controller.name(), "process: starting backend");
        self.emit(EventKind::ContainerStart, None);
        if let Err(err) = self.controller.start().await {
            tracing::warn!(server = %self.server_id, err = %format!("{err:#}"), "process: start failed");
            self.emit(EventKind::Error, Some(format!("{err:#}")));
            return false;
        }

        let deadline = time::Instant::now() + timeout;
        loop {
            if self.controller.is_running().await.unwrap_or(false) {
                return true;
            }
            if time::Instant::now() >= deadline {
                return false;
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn joined(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn left(self: &Arc<Self>) {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if prev != 1 {
            return;
        }
        let Some(stop_after) = self.config.stop_after else {
            return;
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            time::sleep(stop_after).await;
            if this.epoch.load(Ordering::SeqCst) != epoch || this.active() != 0 {
                return;
            }
            tracing::info!(server = %this.server_id, idle = ?stop_after, "process: stopping idle backend");
            this.emit(EventKind::ProcessTimeout, None);
            match this.controller.stop().await {
                Ok(()) => this.emit(EventKind::ContainerStop, None),
                Err(err) => {
                    tracing::warn!(server = %this.server_id, err = %format!("{err:#}"), "process: stop failed");
                    this.emit(EventKind::Error, Some(format!("{err:#}")));
                }
            }
        });
    }
}
