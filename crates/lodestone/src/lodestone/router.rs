use std::sync::Arc;

use thiserror::Error;

use crate::lodestone::{
    config::GatewayConfig,
    registry::{Registry, Snapshot},
    server::Server,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no server for host {host:?} on gateway {gateway:?}")]
    NotFound { host: String, gateway: String },
}

/// A compiled virtual-host pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    Exact(String),
    /// `*.example.com`, stored as `.example.com`.
    Suffix(String),
    Any,
}

impl HostPattern {
    pub fn compile(pattern: &str) -> Self {
        let p = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        if p == "*" {
            HostPattern::Any
        } else if let Some(rest) = p.strip_prefix("*.") {
            HostPattern::Suffix(format!(".{rest}"))
        } else {
            HostPattern::Exact(p)
        }
    }

    fn rank(&self, host: &str) -> Option<u8> {
        match self {
            HostPattern::Exact(h) => (h == host).then_some(0),
            HostPattern::Suffix(s) => (host.len() > s.len() && host.ends_with(s.as_str())).then_some(1),
            HostPattern::Any => Some(2),
        }
    }
}

/// Best match category of `server` for `host`: 0 exact, 1 suffix, 2 catch-all.
fn match_rank(server: &Server, host: &str) -> Option<u8> {
    server.patterns.iter().filter_map(|p| p.rank(host)).min()
}

/// Resolves `host` against the servers routable from `gateway_id`.
///
/// Exact matches beat `*.suffix` matches, which beat `*`. Within a category
/// the earliest server in the gateway's list wins.
pub fn resolve(snap: &Snapshot, host: &str, gateway_id: &str) -> Result<Arc<Server>, RouteError> {
    let not_found = || RouteError::NotFound {
        host: host.to_string(),
        gateway: gateway_id.to_string(),
    };
    let candidates = snap.gateway_servers(gateway_id).ok_or_else(not_found)?;

    // The exact index holds at most one server per host.
    if let Some(id) = snap.exact_owner(host) {
        if let Some(s) = candidates.iter().find(|s| s.id() == id) {
            return Ok(s.clone());
        }
    }

    let mut best: Option<(u8, &Arc<Server>)> = None;
    for s in &candidates {
        if let Some(rank) = match_rank(s, host) {
            if rank == 0 {
                return Ok(s.clone());
            }
            if best.is_none_or(|(r, _)| rank < r) {
                best = Some((rank, s));
            }
        }
    }
    best.map(|(_, s)| s.clone()).ok_or_else(not_found)
}

/// Bedrock logins carry no usable host; the listener address is tried first
/// and the gateway's first server is the fallback.
pub fn resolve_bedrock(snap: &Snapshot, listener_host: &str, gateway_id: &str) -> Result<Arc<Server>, RouteError> {
    match resolve(snap, listener_host, gateway_id) {
        Ok(s) => Ok(s),
        Err(err) => snap
            .gateway_servers(gateway_id)
            .and_then(|c| c.into_iter().next())
            .ok_or(err),
    }
}

/// Registry-backed router used on the data path.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn resolve(&self, host: &str, gateway_id: &str) -> Result<Arc<Server>, RouteError> {
        resolve(&self.registry.snapshot(), host, gateway_id)
    }

    pub fn resolve_bedrock(&self, listener_host: &str, gateway_id: &str) -> Result<Arc<Server>, RouteError> {
        resolve_bedrock(&self.registry.snapshot(), listener_host, gateway_id)
    }

    pub fn gateway(&self, gateway_id: &str) -> Option<Arc<GatewayConfig>> {
        self.registry.snapshot().gateway(gateway_id).cloned()
    }
}
