//! Gateway lifecycle: bind every listener, run one accept loop per
//! listener, and feed accepted connections into the worker queue.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use rand::{RngExt, rng};
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::lodestone::{
    config::{GatewayConfig, ListenerConfig, ListenerProtocol},
    net,
    raknet::RaknetAcceptor,
    worker::{Accepted, ListenerPolicy, RawConn},
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

enum Bound {
    Tcp(TcpListener),
    Raknet(RaknetAcceptor),
}

/// A gateway whose listeners are accepting.
pub struct RunningGateway {
    config: Arc<GatewayConfig>,
    addrs: Vec<SocketAddr>,
    shutdown: watch::Sender<bool>,
    listeners: JoinSet<()>,
}

impl std::fmt::Debug for RunningGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningGateway")
            .field("id", &self.config.id)
            .field("addrs", &self.addrs)
            .finish()
    }
}

async fn bind(l: &ListenerConfig) -> anyhow::Result<Bound> {
    let addr = net::normalize_bind_addr(&l.bind);
    match l.protocol {
        ListenerProtocol::Java => {
            let ln = TcpListener::bind(addr.as_ref())
                .await
                .with_context(|| format!("bind tcp {}", l.bind))?;
            Ok(Bound::Tcp(ln))
        }
        ListenerProtocol::Bedrock => {
            let sa: SocketAddr = tokio::net::lookup_host(addr.as_ref())
                .await
                .with_context(|| format!("resolve bedrock bind {}", l.bind))?
                .next()
                .with_context(|| format!("resolve bedrock bind {}: no addresses", l.bind))?;
            let guid = rng().random::<u64>();
            let pong = l.ping.pong_blob(guid, sa.port());
            let acceptor = RaknetAcceptor::bind(sa, pong)
                .await
                .with_context(|| format!("bind raknet {}", l.bind))?;
            Ok(Bound::Raknet(acceptor))
        }
    }
}

impl RunningGateway {
    /// Binds all listeners, then starts accepting. Nothing is left bound if
    /// any listener fails.
    pub async fn start(config: GatewayConfig, queue: flume::Sender<Accepted>) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let mut bound = Vec::with_capacity(config.listeners.len());
        for l in &config.listeners {
            let b = bind(l)
                .await
                .with_context(|| format!("gateway {:?}", config.id))?;
            bound.push((l.clone(), b));
        }

        let (shutdown, _) = watch::channel(false);
        let mut listeners = JoinSet::new();
        let mut addrs = Vec::with_capacity(bound.len());
        for (l, b) in bound {
            let local = match &b {
                Bound::Tcp(ln) => ln.local_addr().context("tcp local_addr")?,
                Bound::Raknet(a) => a.local_addr(),
            };
            addrs.push(local);
            let policy = Arc::new(ListenerPolicy {
                gateway_id: config.id.clone(),
                protocol: l.protocol,
                listener: local,
                client_timeout: config.client_timeout,
                receive_proxy_protocol: l.receive_proxy_protocol,
                receive_real_ip: l.receive_real_ip,
            });
            tracing::info!(gateway = %config.id, listen_addr = %local, protocol = %l.protocol, "gateway: listening");
            let queue = queue.clone();
            let stop = shutdown.subscribe();
            match b {
                Bound::Tcp(ln) => listeners.spawn(accept_tcp(ln, policy, queue, stop)),
                Bound::Raknet(a) => listeners.spawn(accept_raknet(a, policy, queue, stop)),
            };
        }

        Ok(Self {
            config,
            addrs,
            shutdown,
            listeners,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Closes every listener and waits for the accept loops to exit.
    /// Connections already accepted are not touched.
    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        while self.listeners.join_next().await.is_some() {}
        tracing::info!(gateway = %self.config.id, "gateway: stopped");
    }
}

async fn enqueue(
    queue: &flume::Sender<Accepted>,
    item: Accepted,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    // A full queue parks the accept loop here, which is the backpressure.
    tokio::select! {
        res = queue.send_async(item) => res.is_ok(),
        _ = stop.wait_for(|s| *s) => false,
    }
}

async fn accept_tcp(
    ln: TcpListener,
    policy: Arc<ListenerPolicy>,
    queue: flume::Sender<Accepted>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let res = tokio::select! {
            res = ln.accept() => res,
            _ = stop.wait_for(|s| *s) => break,
        };
        match res {
            Ok((stream, peer)) => {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(client = %peer, gateway = %policy.gateway_id, "gateway: tcp accepted");
                }
                let _ = stream.set_nodelay(true);
                let item = Accepted {
                    conn: RawConn::Tcp(stream),
                    peer,
                    policy: policy.clone(),
                };
                if !enqueue(&queue, item, &mut stop).await {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(gateway = %policy.gateway_id, listen_addr = %policy.listener, err = %err, "gateway: accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn accept_raknet(
    mut acceptor: RaknetAcceptor,
    policy: Arc<ListenerPolicy>,
    queue: flume::Sender<Accepted>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let res = tokio::select! {
            res = acceptor.accept() => res,
            _ = stop.wait_for(|s| *s) => break,
        };
        match res {
            Ok(conn) => {
                let peer = conn.peer_addr();
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(client = %peer, gateway = %policy.gateway_id, "gateway: raknet accepted");
                }
                let item = Accepted {
                    conn: RawConn::Datagram(conn),
                    peer,
                    policy: policy.clone(),
                };
                if !enqueue(&queue, item, &mut stop).await {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(gateway = %policy.gateway_id, listen_addr = %policy.listener, err = %err, "gateway: raknet accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    if let Err(err) = acceptor.close().await {
        tracing::debug!(gateway = %policy.gateway_id, err = %err, "gateway: raknet close failed");
    }
}
