use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::lodestone::{
    admin,
    config::{self, ConfigSource, FileConfigSource},
    events::EventBus,
    logging, net,
    raknet::RaknetDialer,
    registry::Registry,
    reload::{self, ReloadRequest, Reloader},
    router::Router,
    runtime_paths, telemetry,
    tunnel::TunnelTracker,
    worker::{WorkerContext, WorkerPool},
};

pub async fn run(config_path: Option<PathBuf>, servers_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let paths = runtime_paths::resolve_runtime_paths(&resolved.path, servers_dir, &cfg.servers_dir)?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %paths.config_path.display(),
        servers_dir = %paths.servers_dir.display(),
        admin_addr = %cfg.admin_addr,
        gateways = cfg.gateways.len(),
        workers = cfg.processing.workers,
        "lodestone: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let sessions = Arc::new(telemetry::SessionRegistry::new());
    let registry = Arc::new(Registry::new());
    let events = Arc::new(EventBus::new());
    let tunnels = Arc::new(TunnelTracker::new());

    let pool = WorkerPool::spawn(Arc::new(WorkerContext {
        router: Router::new(registry.clone()),
        events: events.clone(),
        sessions: sessions.clone(),
        tunnels: tunnels.clone(),
        dialer: Arc::new(RaknetDialer),
        processing: cfg.processing.clone(),
        tunnel_buffer_size: cfg.tunnel_buffer_size,
    }));

    let source: Arc<dyn ConfigSource> = Arc::new(FileConfigSource::new(
        paths.config_path.clone(),
        paths.servers_dir.clone(),
    ));
    let mut reloader = Reloader::new(source, registry.clone(), events.clone(), pool.queue());
    // A broken initial config is fatal; later reloads keep the last good one.
    reloader
        .apply(ReloadRequest::Full)
        .await
        .context("initial configuration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_handle, reload_rx) = reload::channel();

    let mut tasks = JoinSet::new();

    let reloader_task = tokio::spawn(reloader.run(reload_rx, shutdown_rx.clone()));

    if cfg.reload.enabled {
        let watched = vec![paths.config_path.clone(), paths.servers_dir.clone()];
        let handle = reload_handle.clone();
        let shutdown = shutdown_rx.clone();
        let poll = cfg.reload.poll_interval;
        tasks.spawn(async move {
            reload::watch_files(watched, poll, handle, shutdown).await;
            Ok(())
        });
    }

    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            sessions: sessions.clone(),
            servers_dir: paths.servers_dir.clone(),
            reload: reload_handle.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        Some(res) = tasks.join_next() => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failure = Some(err),
                Err(join_err) => failure = Some(join_err.into()),
            }
        }
    }
    shutdown_tx.send_replace(true);

    // Listeners first, so nothing new reaches the queue.
    if let Err(err) = reloader_task.await {
        tracing::warn!(err = %err, "shutdown: reloader task failed");
    }
    drop(reload_handle);
    pool.shutdown().await;

    if !tunnels.wait_idle(cfg.shutdown_grace).await {
        tracing::warn!(active = tunnels.active(), grace = ?cfg.shutdown_grace, "shutdown: grace expired, closing tunnels");
        tunnels.kill_all();
        let _ = tunnels.wait_idle(Duration::from_secs(2)).await;
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("lodestone: stopped");
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
