//! Post-dial splice between a client and its backend.
//!
//! Each direction runs its own copy loop with an inactivity deadline that is
//! reset on every read. The first direction to finish (EOF, error or idle
//! expiry) ends the whole tunnel.

use std::{
    io,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::FutureExt;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{Notify, watch},
    time,
};

use crate::lodestone::{
    events::{Event, EventBus, EventData, EventKind},
    raknet::SharedDatagramConn,
    server::Server,
    telemetry::{self, SessionInfo, SessionRegistry},
};

/// Counts live tunnels and can force-close all of them.
#[derive(Debug)]
pub struct TunnelTracker {
    active: AtomicUsize,
    idle: Notify,
    kill: watch::Sender<bool>,
}

impl Default for TunnelTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelTracker {
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            kill: watch::channel(false).0,
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Counts a tunnel as live until the returned guard drops. Taken before
    /// the tunnel task is spawned so `wait_idle` cannot miss it.
    pub fn enter(self: &Arc<Self>) -> ActiveTunnel {
        self.active.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("lodestone_active_tunnels").increment(1.0);
        ActiveTunnel {
            tracker: Arc::clone(self),
        }
    }

    pub fn kill_switch(&self) -> watch::Receiver<bool> {
        self.kill.subscribe()
    }

    /// Closes every live tunnel.
    pub fn kill_all(&self) {
        self.kill.send_replace(true);
    }

    /// Waits until no tunnel is live. Returns `false` if `grace` ran out.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };
        time::timeout(grace, wait).await.is_ok()
    }
}

pub struct ActiveTunnel {
    tracker: Arc<TunnelTracker>,
}

impl Drop for ActiveTunnel {
    fn drop(&mut self) {
        metrics::gauge!("lodestone_active_tunnels").decrement(1.0);
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// Everything a tunnel needs to report on itself.
#[derive(Debug, Clone)]
pub struct TunnelMeta {
    pub sid: String,
    pub gateway_id: String,
    pub client: SocketAddr,
    pub host: String,
    pub username: Option<String>,
    pub edition: &'static str,
    pub server: Arc<Server>,
}

impl TunnelMeta {
    pub fn event_data(&self) -> EventData {
        EventData {
            username: self.username.clone(),
            remote_address: Some(self.client.to_string()),
            target_address: Some(self.server.config.address.clone()),
            server_id: Some(self.server.id().to_string()),
            gateway_id: Some(self.gateway_id.clone()),
            proxy_uid: Some(self.sid.clone()),
            ..Default::default()
        }
    }

    pub fn event(&self, kind: EventKind) -> Event {
        Event::new(kind, self.event_data()).with_targets(self.server.webhooks())
    }
}

/// Emits PlayerLeave and releases the session exactly once, however the
/// tunnel ends.
struct LeaveGuard<'a> {
    meta: &'a TunnelMeta,
    events: &'a EventBus,
    sessions: &'a SessionRegistry,
}

impl Drop for LeaveGuard<'_> {
    fn drop(&mut self) {
        self.sessions.remove(&self.meta.sid);
        if let Some(process) = &self.meta.server.process {
            process.left();
        }
        self.events.publish(self.meta.event(EventKind::PlayerLeave));
    }
}

pub enum Pipe {
    Java { client: TcpStream, backend: TcpStream },
    Datagram { client: SharedDatagramConn, backend: SharedDatagramConn },
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub idle_timeout: Duration,
    pub buffer_size: usize,
}

#[derive(Debug, Default)]
struct Counters {
    ingress: AtomicU64,
    egress: AtomicU64,
}

/// Runs a tunnel to completion. The caller has already announced the join.
pub async fn run(
    active: ActiveTunnel,
    events: Arc<EventBus>,
    sessions: Arc<SessionRegistry>,
    meta: TunnelMeta,
    pipe: Pipe,
    opts: TunnelOptions,
) {
    let kill = active.tracker.kill_switch();
    let upstream = match &pipe {
        Pipe::Java { backend, .. } => backend.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
        Pipe::Datagram { backend, .. } => backend.peer_addr().to_string(),
    };
    sessions.add(SessionInfo {
        id: meta.sid.clone(),
        gateway: meta.gateway_id.clone(),
        client: meta.client.to_string(),
        host: meta.host.clone(),
        server: meta.server.id().to_string(),
        upstream,
        username: meta.username.clone(),
        edition: meta.edition,
        started_at_unix_ms: telemetry::now_unix_ms(),
    });
    if let Some(process) = &meta.server.process {
        process.joined();
    }
    let _leave = LeaveGuard {
        meta: &meta,
        events: &events,
        sessions: &sessions,
    };

    let counters = Counters::default();
    let res = AssertUnwindSafe(splice(pipe, &opts, &counters, kill))
        .catch_unwind()
        .await;
    drop(active);

    metrics::counter!("lodestone_bytes_ingress_total").increment(counters.ingress.load(Ordering::Relaxed));
    metrics::counter!("lodestone_bytes_egress_total").increment(counters.egress.load(Ordering::Relaxed));

    match res {
        Ok(Ok(())) => {
            tracing::debug!(sid = %meta.sid, server = %meta.server.id(), "tunnel: closed");
        }
        Ok(Err(err)) => {
            tracing::debug!(sid = %meta.sid, server = %meta.server.id(), err = %err, "tunnel: closed with error");
        }
        Err(_) => {
            tracing::error!(sid = %meta.sid, server = %meta.server.id(), "tunnel: panicked");
            let mut data = meta.event_data();
            data.error = Some("tunnel panicked".into());
            events.publish(Event::new(EventKind::Error, data).with_targets(meta.server.webhooks()));
        }
    }
}

fn killed() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "tunnel killed")
}

async fn splice(
    pipe: Pipe,
    opts: &TunnelOptions,
    counters: &Counters,
    mut kill: watch::Receiver<bool>,
) -> io::Result<()> {
    match pipe {
        Pipe::Java { client, backend } => {
            let (cr, cw) = client.into_split();
            let (br, bw) = backend.into_split();
            let up = copy_stream(cr, bw, opts, &counters.ingress);
            let down = copy_stream(br, cw, opts, &counters.egress);
            // Whichever side finishes first drops the other, closing both sockets.
            tokio::select! {
                res = up => res,
                res = down => res,
                _ = kill.wait_for(|k| *k) => Err(killed()),
            }
        }
        Pipe::Datagram { client, backend } => {
            let up = copy_datagrams(&client, &backend, opts.idle_timeout, &counters.ingress);
            let down = copy_datagrams(&backend, &client, opts.idle_timeout, &counters.egress);
            let res = tokio::select! {
                res = up => res,
                res = down => res,
                _ = kill.wait_for(|k| *k) => Err(killed()),
            };
            let _ = client.close().await;
            let _ = backend.close().await;
            res
        }
    }
}

fn idle_expired(idle: Duration) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("idle for {idle:?}"))
}

async fn copy_stream<R, W>(mut r: R, mut w: W, opts: &TunnelOptions, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; opts.buffer_size.max(1024)];
    loop {
        let n = match time::timeout(opts.idle_timeout, r.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(idle_expired(opts.idle_timeout)),
        };
        w.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    let _ = w.shutdown().await;
    Ok(())
}

async fn copy_datagrams(
    from: &SharedDatagramConn,
    to: &SharedDatagramConn,
    idle: Duration,
    counter: &AtomicU64,
) -> io::Result<()> {
    loop {
        let msg = match time::timeout(idle, from.recv()).await {
            Ok(res) => res?,
            Err(_) => return Err(idle_expired(idle)),
        };
        to.send(&msg).await?;
        counter.fetch_add(msg.len() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::lodestone::{
        raknet::{DatagramConn, testing::pair},
        registry::tests::server,
    };

    fn meta(sid: &str) -> TunnelMeta {
        TunnelMeta {
            sid: sid.into(),
            gateway_id: "gw".into(),
            client: "1.2.3.4:5".parse().unwrap(),
            host: "play.example.com".into(),
            username: Some("notch".into()),
            edition: "java",
            server: server("lobby", &["play.example.com"]),
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (a, b) = tokio::join!(TcpStream::connect(addr), ln.accept());
        (a.unwrap(), b.unwrap().0)
    }

    struct Harness {
        tracker: Arc<TunnelTracker>,
        events: Arc<EventBus>,
        sessions: Arc<SessionRegistry>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                tracker: Arc::new(TunnelTracker::new()),
                events: Arc::new(EventBus::new()),
                sessions: Arc::new(SessionRegistry::new()),
            }
        }

        fn spawn(&self, meta: TunnelMeta, pipe: Pipe, idle: Duration) -> tokio::task::JoinHandle<()> {
            tokio::spawn(run(
                self.tracker.enter(),
                self.events.clone(),
                self.sessions.clone(),
                meta,
                pipe,
                TunnelOptions {
                    idle_timeout: idle,
                    buffer_size: 4096,
                },
            ))
        }
    }

    #[tokio::test]
    async fn java_bytes_flow_and_leave_fires_once() {
        let h = Harness::new();
        let mut rx = h.events.subscribe("t", &[], false);
        let (mut player, client) = tcp_pair().await;
        let (backend, mut game) = tcp_pair().await;

        let task = h.spawn(meta("s1"), Pipe::Java { client, backend }, Duration::from_secs(5));

        player.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        game.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        game.write_all(b"pong").await.unwrap();
        player.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(h.sessions.len(), 1);

        drop(player);
        task.await.unwrap();
        let n = game.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::PlayerLeave);
        assert_eq!(ev.data.username.as_deref(), Some("notch"));
        assert!(rx.try_recv().is_err());
        assert!(h.sessions.is_empty());
        assert_eq!(h.tracker.active(), 0);
    }

    #[tokio::test]
    async fn idle_direction_closes_tunnel() {
        let h = Harness::new();
        let (_player, client) = tcp_pair().await;
        let (backend, mut game) = tcp_pair().await;
        let task = h.spawn(meta("s2"), Pipe::Java { client, backend }, Duration::from_millis(100));
        time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(game.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn datagrams_relay_both_ways() {
        let h = Harness::new();
        let (player, client) = pair("1.2.3.4:5".parse().unwrap(), "127.0.0.1:19132".parse().unwrap());
        let (backend, game) = pair("127.0.0.1:40000".parse().unwrap(), "127.0.0.1:19133".parse().unwrap());
        let mut m = meta("s3");
        m.edition = "bedrock";
        let task = h.spawn(
            m,
            Pipe::Datagram { client, backend },
            Duration::from_secs(5),
        );

        player.send(b"\xfe\x01").await.unwrap();
        assert_eq!(game.recv().await.unwrap(), b"\xfe\x01");
        game.send(b"\xfe\x02").await.unwrap();
        assert_eq!(player.recv().await.unwrap(), b"\xfe\x02");

        game.close().await.unwrap();
        time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(player.recv().await.is_err());
    }

    #[tokio::test]
    async fn kill_all_closes_live_tunnels() {
        let h = Harness::new();
        let (_player, client) = tcp_pair().await;
        let (backend, _game) = tcp_pair().await;
        let task = h.spawn(meta("s4"), Pipe::Java { client, backend }, Duration::from_secs(60));

        assert_eq!(h.tracker.active(), 1);
        assert!(!h.tracker.wait_idle(Duration::from_millis(50)).await);
        h.tracker.kill_all();
        assert!(h.tracker.wait_idle(Duration::from_secs(2)).await);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn kill_closes_both_datagram_ends() {
        let h = Harness::new();
        let (player, client) = pair("1.2.3.4:5".parse().unwrap(), "127.0.0.1:19132".parse().unwrap());
        let (backend, game) = pair("127.0.0.1:40000".parse().unwrap(), "127.0.0.1:19133".parse().unwrap());
        let task = h.spawn(meta("s5"), Pipe::Datagram { client, backend }, Duration::from_secs(60));

        h.tracker.kill_all();
        time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(time::timeout(Duration::from_secs(2), player.recv()).await.unwrap().is_err());
        assert!(time::timeout(Duration::from_secs(2), game.recv()).await.unwrap().is_err());
        assert_eq!(h.tracker.active(), 0);
    }
}
