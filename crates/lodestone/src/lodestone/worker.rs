//! Bounded connection queue and the fixed pool of workers draining it.
//!
//! A worker owns a connection from dequeue until it is handed to a tunnel
//! task (or closed). Everything before the handoff runs under one pre-tunnel
//! deadline.

use std::{future::Future, io, net::SocketAddr, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpStream, task::JoinSet, time};

use crate::lodestone::{
    config::{ListenerProtocol, ProcessingConfig},
    events::{Event, EventBus, EventData, EventKind},
    handshake::{self, HandshakeError, NextState},
    protocol::{
        bedrock,
        java::{CodecError, PacketReader, write_packet},
        proxy_protocol,
    },
    raknet::{SharedDatagramConn, SharedDatagramDialer},
    router::Router,
    server::{DialError, Server},
    status,
    telemetry::{self, SessionRegistry},
    template::MessageVars,
    tunnel::{self, Pipe, TunnelMeta, TunnelOptions, TunnelTracker},
};

/// Per-listener settings handed to workers along with each connection.
#[derive(Debug, Clone)]
pub struct ListenerPolicy {
    pub gateway_id: String,
    pub protocol: ListenerProtocol,
    pub listener: SocketAddr,
    pub client_timeout: Duration,
    pub receive_proxy_protocol: bool,
    pub receive_real_ip: bool,
}

pub enum RawConn {
    Tcp(TcpStream),
    Datagram(SharedDatagramConn),
}

pub struct Accepted {
    pub conn: RawConn,
    pub peer: SocketAddr,
    pub policy: Arc<ListenerPolicy>,
}

pub struct WorkerContext {
    pub router: Router,
    pub events: Arc<EventBus>,
    pub sessions: Arc<SessionRegistry>,
    pub tunnels: Arc<TunnelTracker>,
    pub dialer: SharedDatagramDialer,
    pub processing: ProcessingConfig,
    pub tunnel_buffer_size: usize,
}

#[derive(Debug, Error)]
enum ProcessError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

pub struct WorkerPool {
    tx: flume::Sender<Accepted>,
    workers: JoinSet<()>,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<WorkerContext>) -> Self {
        let n = ctx.processing.workers.max(1);
        let (tx, rx) = flume::bounded(ctx.processing.queue_size.max(1));
        let mut workers = JoinSet::new();
        for i in 0..n {
            workers.spawn(worker_loop(i, rx.clone(), ctx.clone()));
        }
        tracing::info!(workers = n, queue = ctx.processing.queue_size, "worker: pool started");
        Self { tx, workers }
    }

    /// Sender side of the connection queue; a full queue blocks the caller.
    pub fn queue(&self) -> flume::Sender<Accepted> {
        self.tx.clone()
    }

    /// Finishes queued work once every other sender is gone.
    pub async fn shutdown(mut self) {
        drop(self.tx);
        while self.workers.join_next().await.is_some() {}
    }
}

async fn worker_loop(id: usize, rx: flume::Receiver<Accepted>, ctx: Arc<WorkerContext>) {
    while let Ok(conn) = rx.recv_async().await {
        let peer = conn.peer;
        let gateway_id = conn.policy.gateway_id.clone();
        let res = AssertUnwindSafe(handle(&ctx, conn)).catch_unwind().await;
        if res.is_err() {
            tracing::error!(worker = id, client = %peer, gateway = %gateway_id, "worker: connection handler panicked");
            ctx.events.emit(
                EventKind::Error,
                EventData {
                    remote_address: Some(peer.to_string()),
                    gateway_id: Some(gateway_id),
                    error: Some("connection handler panicked".into()),
                    ..Default::default()
                },
            );
        }
    }
    tracing::debug!(worker = id, "worker: queue closed");
}

async fn handle(ctx: &WorkerContext, conn: Accepted) {
    let Accepted { conn, peer, policy } = conn;
    match conn {
        RawConn::Tcp(stream) => handle_java(ctx, stream, peer, &policy).await,
        RawConn::Datagram(dc) => handle_bedrock(ctx, dc, peer, &policy).await,
    }
}

/// Dials, and on failure wakes the server's process (if any) and dials once more.
async fn dial_waking<T, F, Fut>(server: &Server, wake: bool, dial: F) -> Result<T, DialError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, DialError>>,
{
    let err = match dial().await {
        Ok(c) => return Ok(c),
        Err(err) => err,
    };
    match &server.process {
        Some(process) if wake => {
            tracing::debug!(server = %server.id(), err = %err, "worker: dial failed, waking backend");
            if process.wake(server.config.dial_timeout).await {
                dial().await
            } else {
                Err(err)
            }
        }
        _ => Err(err),
    }
}

fn error_event(ctx: &WorkerContext, data: EventData, targets: &[String]) {
    ctx.events.publish(Event::new(EventKind::Error, data).with_targets(targets));
}

struct JavaReady {
    backend: TcpStream,
    server: Arc<Server>,
    client: SocketAddr,
    host: String,
    username: Option<String>,
}

async fn handle_java(ctx: &WorkerContext, stream: TcpStream, peer: SocketAddr, policy: &ListenerPolicy) {
    metrics::counter!("lodestone_connections_total", "edition" => "java").increment(1);
    let sid = telemetry::new_session_id();
    let mut reader = PacketReader::new(stream, ctx.processing.max_packet_bytes);

    let deadline = ctx.processing.handshake_timeout;
    let ready = match time::timeout(deadline, java_pre_tunnel(ctx, &mut reader, peer, policy)).await {
        Ok(Ok(Some(ready))) => ready,
        Ok(Ok(None)) => return,
        Ok(Err(err)) => {
            tracing::debug!(sid = %sid, client = %peer, gateway = %policy.gateway_id, err = %err, "worker: java handshake rejected");
            return;
        }
        Err(_) => {
            tracing::debug!(sid = %sid, client = %peer, gateway = %policy.gateway_id, err = %HandshakeError::Timeout, "worker: pre-tunnel deadline expired");
            return;
        }
    };

    let client_stream = reader.into_inner();
    let meta = TunnelMeta {
        sid,
        gateway_id: policy.gateway_id.clone(),
        client: ready.client,
        host: ready.host,
        username: ready.username,
        edition: "java",
        server: ready.server,
    };
    hand_off(
        ctx,
        meta,
        Pipe::Java {
            client: client_stream,
            backend: ready.backend,
        },
        policy.client_timeout,
    );
}

async fn java_pre_tunnel(
    ctx: &WorkerContext,
    reader: &mut PacketReader<TcpStream>,
    peer: SocketAddr,
    policy: &ListenerPolicy,
) -> Result<Option<JavaReady>, ProcessError> {
    let mut client = peer;
    if policy.receive_proxy_protocol {
        let header = proxy_protocol::read_from(reader)
            .await
            .map_err(HandshakeError::from)?;
        client = header.source.unwrap_or(peer);
    }

    reader.start_recording();
    let hs = handshake::read_java_handshake(reader, policy.receive_real_ip).await?;
    let client = hs.vhost.apparent_addr(client);
    let host = hs.vhost.host.clone();
    let username = hs.username().map(str::to_string);
    let protocol = hs.handshake.protocol_version;
    let is_status = hs.handshake.next_state == NextState::Status;

    let mut vars = MessageVars {
        username: username.clone().unwrap_or_default(),
        remote_address: client.to_string(),
        local_address: reader.get_ref().local_addr().map(|a| a.to_string()).unwrap_or_default(),
        server_address: host.clone(),
        server_id: String::new(),
    };

    let server = match ctx.router.resolve(&host, &policy.gateway_id) {
        Ok(s) => s,
        Err(err) => {
            metrics::counter!("lodestone_route_misses_total").increment(1);
            tracing::debug!(client = %client, host = %host, gateway = %policy.gateway_id, "worker: no server for host");
            let gateway = ctx.router.gateway(&policy.gateway_id);
            if is_status {
                let tpl = gateway
                    .as_ref()
                    .map(|g| g.server_not_found_status.clone())
                    .unwrap_or_else(status::StatusTemplate::not_found_default);
                status::serve_status(reader, &tpl, protocol).await?;
            } else {
                let text = gateway
                    .as_ref()
                    .map(|g| vars.render(&g.server_not_found_message))
                    .unwrap_or_default();
                write_packet(reader.get_mut(), &status::login_disconnect_packet(&text)).await?;
            }
            error_event(
                ctx,
                EventData {
                    username,
                    remote_address: Some(client.to_string()),
                    gateway_id: Some(policy.gateway_id.clone()),
                    error: Some(err.to_string()),
                    ..Default::default()
                },
                &[],
            );
            return Ok(None);
        }
    };
    vars.server_id = server.id().to_string();

    let dialed = dial_waking(&server, !is_status, || server.dial_java(client)).await;
    let mut backend = match dialed {
        Ok(b) => b,
        Err(err) => {
            metrics::counter!("lodestone_dial_failures_total").increment(1);
            tracing::warn!(client = %client, host = %host, server = %server.id(), err = %err, "worker: backend dial failed");
            let data = EventData {
                username,
                remote_address: Some(client.to_string()),
                target_address: Some(server.config.address.clone()),
                server_id: Some(server.id().to_string()),
                gateway_id: Some(policy.gateway_id.clone()),
                error: Some(err.to_string()),
                ..Default::default()
            };
            // Reported first; the client may hang up mid-reply.
            error_event(ctx, data, server.webhooks());
            if is_status {
                status::serve_status(reader, &server.config.offline_status, protocol).await?;
            } else {
                let text = server.disconnect_message(&vars);
                write_packet(reader.get_mut(), &status::login_disconnect_packet(&text)).await?;
            }
            return Ok(None);
        }
    };

    let replay = reader.take_recorded();
    backend.write_all(&replay).await?;

    Ok(Some(JavaReady {
        backend,
        server,
        client,
        host,
        username,
    }))
}

struct BedrockReady {
    backend: SharedDatagramConn,
    server: Arc<Server>,
    client: SocketAddr,
    host: String,
    username: String,
}

async fn handle_bedrock(ctx: &WorkerContext, conn: SharedDatagramConn, peer: SocketAddr, policy: &ListenerPolicy) {
    metrics::counter!("lodestone_connections_total", "edition" => "bedrock").increment(1);
    let sid = telemetry::new_session_id();

    let deadline = ctx.processing.handshake_timeout;
    let ready = match time::timeout(deadline, bedrock_pre_tunnel(ctx, &conn, peer, policy)).await {
        Ok(Ok(Some(ready))) => ready,
        Ok(Ok(None)) => {
            let _ = conn.close().await;
            return;
        }
        Ok(Err(err)) => {
            tracing::debug!(sid = %sid, client = %peer, gateway = %policy.gateway_id, err = %err, "worker: bedrock login rejected");
            let _ = conn.close().await;
            return;
        }
        Err(_) => {
            tracing::debug!(sid = %sid, client = %peer, gateway = %policy.gateway_id, err = %HandshakeError::Timeout, "worker: pre-tunnel deadline expired");
            let _ = conn.close().await;
            return;
        }
    };

    let meta = TunnelMeta {
        sid,
        gateway_id: policy.gateway_id.clone(),
        client: ready.client,
        host: ready.host,
        username: Some(ready.username),
        edition: "bedrock",
        server: ready.server,
    };
    hand_off(
        ctx,
        meta,
        Pipe::Datagram {
            client: conn,
            backend: ready.backend,
        },
        policy.client_timeout,
    );
}

async fn bedrock_pre_tunnel(
    ctx: &WorkerContext,
    conn: &SharedDatagramConn,
    peer: SocketAddr,
    policy: &ListenerPolicy,
) -> Result<Option<BedrockReady>, ProcessError> {
    let mut client = peer;
    let mut first = conn.recv().await?;
    if policy.receive_proxy_protocol {
        let (header, _) = proxy_protocol::parse(&first)
            .map_err(HandshakeError::from)?
            .ok_or(HandshakeError::Malformed("truncated proxy header datagram"))?;
        client = header.source.unwrap_or(peer);
        first = conn.recv().await?;
    }

    let login = handshake::parse_bedrock_login(&first, ctx.processing.max_packet_bytes)?;
    let username = login.identity.display_name.clone();
    let host = policy.listener.ip().to_string();
    let mut vars = MessageVars {
        username: username.clone(),
        remote_address: client.to_string(),
        local_address: conn.local_addr().to_string(),
        server_address: host.clone(),
        server_id: String::new(),
    };

    let server = match ctx.router.resolve_bedrock(&host, &policy.gateway_id) {
        Ok(s) => s,
        Err(err) => {
            metrics::counter!("lodestone_route_misses_total").increment(1);
            let text = ctx
                .router
                .gateway(&policy.gateway_id)
                .map(|g| vars.render(&g.server_not_found_message))
                .unwrap_or_default();
            conn.send(&bedrock::encode_disconnect(&text, false, login.encoding))
                .await?;
            error_event(
                ctx,
                EventData {
                    username: Some(username),
                    remote_address: Some(client.to_string()),
                    gateway_id: Some(policy.gateway_id.clone()),
                    error: Some(err.to_string()),
                    ..Default::default()
                },
                &[],
            );
            return Ok(None);
        }
    };
    vars.server_id = server.id().to_string();

    let dialer = ctx.dialer.as_ref();
    let backend = match dial_waking(&server, true, || server.dial_bedrock(dialer, client)).await {
        Ok(b) => b,
        Err(err) => {
            metrics::counter!("lodestone_dial_failures_total").increment(1);
            tracing::warn!(client = %client, server = %server.id(), err = %err, "worker: bedrock backend dial failed");
            let text = server.disconnect_message(&vars);
            conn.send(&bedrock::encode_disconnect(&text, false, login.encoding))
                .await?;
            error_event(
                ctx,
                EventData {
                    username: Some(username),
                    remote_address: Some(client.to_string()),
                    target_address: Some(server.config.address.clone()),
                    server_id: Some(server.id().to_string()),
                    gateway_id: Some(policy.gateway_id.clone()),
                    error: Some(err.to_string()),
                    ..Default::default()
                },
                server.webhooks(),
            );
            return Ok(None);
        }
    };

    if let Err(err) = backend.send(&first).await {
        let _ = backend.close().await;
        return Err(err.into());
    }

    Ok(Some(BedrockReady {
        backend,
        server,
        client,
        host,
        username,
    }))
}

/// Announces the join and moves the pair onto its own tunnel task.
fn hand_off(ctx: &WorkerContext, meta: TunnelMeta, pipe: Pipe, idle_timeout: Duration) {
    tracing::info!(
        sid = %meta.sid,
        client = %meta.client,
        host = %meta.host,
        server = %meta.server.id(),
        edition = meta.edition,
        "worker: routed"
    );
    // Status pings that reach a live backend are tunnelled too and announced
    // like players, with no username.
    ctx.events.publish(meta.event(EventKind::PlayerJoin));
    let opts = TunnelOptions {
        idle_timeout,
        buffer_size: ctx.tunnel_buffer_size,
    };
    let active = ctx.tunnels.enter();
    tokio::spawn(tunnel::run(
        active,
        ctx.events.clone(),
        ctx.sessions.clone(),
        meta,
        pipe,
        opts,
    ));
}
