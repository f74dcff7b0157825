//! Message-oriented transport seam for Bedrock sessions.
//!
//! The RakNet implementation comes from `rust-raknet`; the rest of the proxy
//! only sees [`DatagramConn`] and [`DatagramDialer`], which keeps Bedrock
//! routing testable without UDP.

use std::{fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use rust_raknet::{RaknetListener, RaknetSocket, Reliability, error::RaknetError};
use tokio::time;

/// One reliable, ordered, message-oriented session.
#[async_trait]
pub trait DatagramConn: Send + Sync + fmt::Debug {
    async fn recv(&self) -> io::Result<Vec<u8>>;
    async fn send(&self, buf: &[u8]) -> io::Result<()>;
    async fn close(&self) -> io::Result<()>;
    fn peer_addr(&self) -> SocketAddr;
    fn local_addr(&self) -> SocketAddr;
}

pub type SharedDatagramConn = Arc<dyn DatagramConn>;

#[async_trait]
pub trait DatagramDialer: Send + Sync + fmt::Debug {
    async fn dial(&self, addr: SocketAddr, timeout: Duration) -> io::Result<SharedDatagramConn>;
}

pub type SharedDatagramDialer = Arc<dyn DatagramDialer>;

fn raknet_io(e: RaknetError) -> io::Error {
    io::Error::other(format!("raknet: {e:?}"))
}

pub struct RaknetConn {
    inner: RaknetSocket,
    peer: SocketAddr,
    local: SocketAddr,
}

impl fmt::Debug for RaknetConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaknetConn")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .finish()
    }
}

impl RaknetConn {
    fn new(inner: RaknetSocket, fallback: SocketAddr) -> Self {
        let peer = inner.peer_addr().unwrap_or(fallback);
        let local = inner.local_addr().unwrap_or(fallback);
        Self { inner, peer, local }
    }
}

#[async_trait]
impl DatagramConn for RaknetConn {
    async fn recv(&self) -> io::Result<Vec<u8>> {
        self.inner.recv().await.map_err(raknet_io)
    }

    async fn send(&self, buf: &[u8]) -> io::Result<()> {
        self.inner
            .send(buf, Reliability::ReliableOrdered)
            .await
            .map_err(raknet_io)
    }

    async fn close(&self) -> io::Result<()> {
        self.inner.close().await.map_err(raknet_io)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// A bound RakNet listener answering offline pings with a fixed pong blob.
pub struct RaknetAcceptor {
    inner: RaknetListener,
    addr: SocketAddr,
}

impl RaknetAcceptor {
    pub async fn bind(addr: SocketAddr, pong: String) -> io::Result<Self> {
        let mut inner = RaknetListener::bind(&addr).await.map_err(raknet_io)?;
        inner.set_full_motd(pong).await.map_err(raknet_io)?;
        inner.listen().await;
        Ok(Self { inner, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn accept(&mut self) -> io::Result<SharedDatagramConn> {
        let sock = self.inner.accept().await.map_err(raknet_io)?;
        Ok(Arc::new(RaknetConn::new(sock, self.addr)))
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await.map_err(raknet_io)
    }
}

#[derive(Debug, Default)]
pub struct RaknetDialer;

#[async_trait]
impl DatagramDialer for RaknetDialer {
    async fn dial(&self, addr: SocketAddr, timeout: Duration) -> io::Result<SharedDatagramConn> {
        let sock = time::timeout(timeout, RaknetSocket::connect(&addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("raknet dial {addr} timed out")))?
            .map_err(raknet_io)?;
        Ok(Arc::new(RaknetConn::new(sock, addr)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use tokio::sync::{mpsc, watch};

    use super::*;

    /// In-memory datagram session; see [`pair`].
    #[derive(Debug)]
    pub struct MemoryConn {
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
        closed: watch::Sender<bool>,
        peer: SocketAddr,
        local: SocketAddr,
    }

    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Arc<MemoryConn>, Arc<MemoryConn>) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let left = MemoryConn {
            rx: tokio::sync::Mutex::new(rx_ba),
            tx: Mutex::new(Some(tx_ab)),
            closed: watch::channel(false).0,
            peer: b,
            local: a,
        };
        let right = MemoryConn {
            rx: tokio::sync::Mutex::new(rx_ab),
            tx: Mutex::new(Some(tx_ba)),
            closed: watch::channel(false).0,
            peer: a,
            local: b,
        };
        (Arc::new(left), Arc::new(right))
    }

    #[async_trait]
    impl DatagramConn for MemoryConn {
        async fn recv(&self) -> io::Result<Vec<u8>> {
            let mut closed = self.closed.subscribe();
            let is_closed = *closed.borrow_and_update();
            if is_closed {
                return Err(io::Error::from(io::ErrorKind::ConnectionAborted));
            }
            let mut rx = self.rx.lock().await;
            tokio::select! {
                v = rx.recv() => v.ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionReset)),
                _ = closed.changed() => Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            }
        }

        async fn send(&self, buf: &[u8]) -> io::Result<()> {
            let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            match tx.as_ref() {
                Some(tx) => tx
                    .send(buf.to_vec())
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
                None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            }
        }

        async fn close(&self) -> io::Result<()> {
            self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            self.closed.send_replace(true);
            Ok(())
        }

        fn peer_addr(&self) -> SocketAddr {
            self.peer
        }

        fn local_addr(&self) -> SocketAddr {
            self.local
        }
    }

    /// Dialer that hands the backend half of each session to the test.
    #[derive(Debug)]
    pub struct FakeDialer {
        backends: mpsc::UnboundedSender<(SocketAddr, Arc<MemoryConn>)>,
        pub refuse: bool,
    }

    impl FakeDialer {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<(SocketAddr, Arc<MemoryConn>)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    backends: tx,
                    refuse: false,
                },
                rx,
            )
        }
    }

    #[async_trait]
    impl DatagramDialer for FakeDialer {
        async fn dial(&self, addr: SocketAddr, _timeout: Duration) -> io::Result<SharedDatagramConn> {
            if self.refuse {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            let local: SocketAddr = "127.0.0.1:40000".parse().map_err(io::Error::other)?;
            let (client, backend) = pair(local, addr);
            self.backends
                .send((addr, backend))
                .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
            Ok(client)
        }
    }

    #[tokio::test]
    async fn memory_pair_delivers_and_closes() {
        let (a, b) = pair("127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap());
        a.send(b"hi").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"hi");
        a.close().await.unwrap();
        assert!(b.recv().await.is_err());
        assert!(a.recv().await.is_err());
        assert_eq!(b.peer_addr().port(), 1);
    }
}
