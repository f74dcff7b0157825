use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpSocket, TcpStream},
    time,
};

use crate::lodestone::{
    config::ServerConfig,
    net,
    process::ProcessHandle,
    protocol::proxy_protocol::{self, Transport},
    raknet::{DatagramDialer, SharedDatagramConn},
    router::HostPattern,
    template::MessageVars,
};

pub const JAVA_DEFAULT_PORT: u16 = 25565;
pub const BEDROCK_DEFAULT_PORT: u16 = 19132;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },
    #[error("resolve {0}: no addresses")]
    NoAddress(String),
    #[error("dial {addr}: timed out after {after:?}")]
    Timeout { addr: String, after: Duration },
    #[error("dial {addr}: {source}")]
    Io { addr: String, source: io::Error },
    #[error("dial {addr}: write proxy header: {source}")]
    ProxyHeader { addr: String, source: io::Error },
}

/// A backend as held by the registry and by live tunnels.
#[derive(Debug)]
pub struct Server {
    pub config: ServerConfig,
    pub(crate) patterns: Vec<HostPattern>,
    pub process: Option<Arc<ProcessHandle>>,
}

impl Server {
    pub fn new(config: ServerConfig, process: Option<Arc<ProcessHandle>>) -> Self {
        let patterns = config.domains.iter().map(|d| HostPattern::compile(d)).collect();
        Self {
            config,
            patterns,
            process,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Webhook ids events about this server are addressed to.
    pub fn webhooks(&self) -> &[String] {
        &self.config.webhooks
    }

    pub fn disconnect_message(&self, vars: &MessageVars) -> String {
        vars.render(&self.config.disconnect_message)
    }

    async fn resolve(&self, default_port: u16) -> Result<SocketAddr, DialError> {
        let addr = net::with_default_port(self.config.address.trim(), default_port);
        let mut addrs = tokio::net::lookup_host(addr.as_ref())
            .await
            .map_err(|source| DialError::Resolve {
                addr: addr.to_string(),
                source,
            })?;
        addrs.next().ok_or_else(|| DialError::NoAddress(addr.to_string()))
    }

    /// Connects to the Java backend within `dial_timeout`. When the server
    /// wants it, a v2 PROXY header naming `client` is written first.
    pub async fn dial_java(&self, client: SocketAddr) -> Result<TcpStream, DialError> {
        let after = self.config.dial_timeout;
        match time::timeout(after, self.dial_java_inner(client)).await {
            Ok(res) => res,
            Err(_) => Err(DialError::Timeout {
                addr: self.config.address.clone(),
                after,
            }),
        }
    }

    async fn dial_java_inner(&self, client: SocketAddr) -> Result<TcpStream, DialError> {
        let target = self.resolve(JAVA_DEFAULT_PORT).await?;
        let io_err = |source| DialError::Io {
            addr: target.to_string(),
            source,
        };

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(io_err)?;
        if let Some(bind) = self.config.bind {
            socket.bind(bind).map_err(io_err)?;
        }
        let mut stream = socket.connect(target).await.map_err(io_err)?;
        let _ = stream.set_nodelay(true);

        if self.config.send_proxy_protocol {
            let dst = stream.peer_addr().unwrap_or(target);
            let header = proxy_protocol::encode_v2(client, dst, Transport::Stream);
            stream
                .write_all(&header)
                .await
                .map_err(|source| DialError::ProxyHeader {
                    addr: target.to_string(),
                    source,
                })?;
        }
        Ok(stream)
    }

    /// Opens a RakNet session to the Bedrock backend. The PROXY header, when
    /// enabled, travels as the first datagram.
    pub async fn dial_bedrock(
        &self,
        dialer: &dyn DatagramDialer,
        client: SocketAddr,
    ) -> Result<SharedDatagramConn, DialError> {
        let after = self.config.dial_timeout;
        let target = match time::timeout(after, self.resolve(BEDROCK_DEFAULT_PORT)).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(DialError::Timeout {
                    addr: self.config.address.clone(),
                    after,
                });
            }
        };
        if let Some(bind) = self.config.bind {
            tracing::debug!(server = %self.id(), bind = %bind, "server: bind address ignored for bedrock dial");
        }

        let conn = dialer.dial(target, after).await.map_err(|source| {
            if source.kind() == io::ErrorKind::TimedOut {
                DialError::Timeout {
                    addr: target.to_string(),
                    after,
                }
            } else {
                DialError::Io {
                    addr: target.to_string(),
                    source,
                }
            }
        })?;

        if self.config.send_proxy_protocol {
            let header = proxy_protocol::encode_v2(client, target, Transport::Datagram);
            if let Err(source) = conn.send(&header).await {
                let _ = conn.close().await;
                return Err(DialError::ProxyHeader {
                    addr: target.to_string(),
                    source,
                });
            }
        }
        Ok(conn)
    }
}
