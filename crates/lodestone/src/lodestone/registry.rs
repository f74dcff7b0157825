//! Copy-on-write store of servers and gateways.
//!
//! Readers take an `Arc<Snapshot>` and never block. Writers are serialised by
//! a mutex, build a complete new snapshot and publish it with one pointer
//! swap. Tunnels keep their own `Arc<Server>`, so replacing or removing a
//! server never affects connections that already dialed it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::lodestone::{config::GatewayConfig, router::HostPattern, server::Server};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("host {host:?} is claimed by both {first:?} and {second:?}")]
    DuplicateHost {
        host: String,
        first: String,
        second: String,
    },
    #[error("duplicate server id {0:?}")]
    DuplicateServer(String),
}

#[derive(Debug, Default)]
pub struct Snapshot {
    pub version: u64,
    servers: HashMap<String, Arc<Server>>,
    /// Sorted ids, used when a gateway lists no servers.
    ordered: Vec<String>,
    exact: HashMap<String, String>,
    gateways: HashMap<String, Arc<GatewayConfig>>,
}

impl Snapshot {
    fn build(
        version: u64,
        servers: Vec<Arc<Server>>,
        gateways: HashMap<String, Arc<GatewayConfig>>,
    ) -> Result<Self, RegistryError> {
        let mut by_id = HashMap::with_capacity(servers.len());
        let mut exact: HashMap<String, String> = HashMap::new();
        for s in servers {
            for p in &s.patterns {
                if let HostPattern::Exact(h) = p {
                    if let Some(first) = exact.get(h) {
                        if first != s.id() {
                            return Err(RegistryError::DuplicateHost {
                                host: h.clone(),
                                first: first.clone(),
                                second: s.id().to_string(),
                            });
                        }
                    }
                    exact.insert(h.clone(), s.id().to_string());
                }
            }
            if by_id.insert(s.id().to_string(), s.clone()).is_some() {
                return Err(RegistryError::DuplicateServer(s.id().to_string()));
            }
        }
        let mut ordered: Vec<String> = by_id.keys().cloned().collect();
        ordered.sort();
        Ok(Self {
            version,
            servers: by_id,
            ordered,
            exact,
            gateways,
        })
    }

    pub fn server(&self, id: &str) -> Option<&Arc<Server>> {
        self.servers.get(id)
    }

    pub fn servers(&self) -> impl Iterator<Item = &Arc<Server>> {
        self.ordered.iter().filter_map(|id| self.servers.get(id))
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn gateway(&self, id: &str) -> Option<&Arc<GatewayConfig>> {
        self.gateways.get(id)
    }

    pub fn gateways(&self) -> impl Iterator<Item = &Arc<GatewayConfig>> {
        self.gateways.values()
    }

    pub fn exact_owner(&self, host: &str) -> Option<&str> {
        self.exact.get(host).map(String::as_str)
    }

    /// Servers routable from a gateway, in priority order. Ids that do not
    /// (or no longer) exist are skipped.
    pub fn gateway_servers(&self, gateway_id: &str) -> Option<Vec<Arc<Server>>> {
        let gw = self.gateways.get(gateway_id)?;
        let ids = if gw.servers.is_empty() {
            &self.ordered
        } else {
            &gw.servers
        };
        Some(ids.iter().filter_map(|id| self.servers.get(id).cloned()).collect())
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    current: ArcSwap<Snapshot>,
    write: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    fn update<F>(&self, f: F) -> Result<Arc<Snapshot>, RegistryError>
    where
        F: FnOnce(&Snapshot) -> Result<Snapshot, RegistryError>,
    {
        // A poisoned lock only means a writer panicked before swapping.
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let cur = self.current.load();
        let next = Arc::new(f(&cur)?);
        self.current.store(next.clone());
        Ok(next)
    }

    /// Replaces the whole set of servers and gateways.
    pub fn replace(
        &self,
        servers: Vec<Arc<Server>>,
        gateways: Vec<GatewayConfig>,
    ) -> Result<Arc<Snapshot>, RegistryError> {
        let gateways = gateways
            .into_iter()
            .map(|g| (g.id.clone(), Arc::new(g)))
            .collect();
        self.update(|cur| Snapshot::build(cur.version + 1, servers, gateways))
    }

    pub fn upsert_server(&self, server: Arc<Server>) -> Result<Arc<Snapshot>, RegistryError> {
        self.update(|cur| {
            let mut servers: Vec<Arc<Server>> = cur
                .servers
                .values()
                .filter(|s| s.id() != server.id())
                .cloned()
                .collect();
            servers.push(server.clone());
            Snapshot::build(cur.version + 1, servers, cur.gateways.clone())
        })
    }

    /// Returns the removed server, if it existed.
    pub fn remove_server(&self, id: &str) -> Option<Arc<Server>> {
        let mut removed = None;
        let res = self.update(|cur| {
            removed = cur.servers.get(id).cloned();
            let servers = cur.servers.values().filter(|s| s.id() != id).cloned().collect();
            Snapshot::build(cur.version + 1, servers, cur.gateways.clone())
        });
        // Removing a server cannot introduce a conflict.
        debug_assert!(res.is_ok());
        removed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lodestone::{config::ServerConfig, status::StatusTemplate};

    pub(crate) fn server_config(id: &str, domains: &[&str], address: &str) -> ServerConfig {
        ServerConfig {
            id: id.into(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            address: address.into(),
            bind: None,
            dial_timeout: Duration::from_secs(1),
            send_proxy_protocol: false,
            disconnect_message: "Sorry {{username}}, but the server is offline.".into(),
            offline_status: StatusTemplate::offline_default(),
            webhooks: Vec::new(),
            process: None,
        }
    }

    pub(crate) fn server(id: &str, domains: &[&str]) -> Arc<Server> {
        Arc::new(Server::new(server_config(id, domains, "127.0.0.1:1"), None))
    }

    pub(crate) fn gateway(id: &str, servers: &[&str]) -> GatewayConfig {
        GatewayConfig {
            id: id.into(),
            listeners: Vec::new(),
            client_timeout: Duration::from_secs(30),
            servers: servers.iter().map(|s| s.to_string()).collect(),
            server_not_found_message: "not found".into(),
            server_not_found_status: StatusTemplate::not_found_default(),
        }
    }

    #[test]
    fn duplicate_exact_host_rejected_and_previous_kept() {
        let reg = Registry::new();
        reg.replace(vec![server("a", &["play.example.com"])], vec![gateway("gw", &[])])
            .unwrap();
        let before = reg.snapshot();

        let err = reg
            .replace(
                vec![server("a", &["play.example.com"]), server("b", &["play.example.com"])],
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHost { .. }));
        assert!(Arc::ptr_eq(&before, &reg.snapshot()));

        assert!(reg.upsert_server(server("c", &["play.example.com"])).is_err());
    }

    #[test]
    fn wildcards_may_overlap() {
        let reg = Registry::new();
        reg.replace(vec![server("a", &["*.example.com"]), server("b", &["*.example.com", "*"])], vec![])
            .unwrap();
        assert_eq!(reg.snapshot().server_count(), 2);
    }

    #[test]
    fn upsert_and_remove_keep_old_arcs_alive() {
        let reg = Registry::new();
        reg.replace(vec![server("a", &["a.example.com"])], vec![gateway("gw", &["a"])])
            .unwrap();
        let held = reg.snapshot().server("a").cloned().unwrap();

        let snap = reg.upsert_server(server("a", &["a2.example.com"])).unwrap();
        assert_eq!(snap.exact_owner("a2.example.com"), Some("a"));
        assert_eq!(snap.exact_owner("a.example.com"), None);
        assert_eq!(held.config.domains, vec!["a.example.com"]);

        let removed = reg.remove_server("a").unwrap();
        assert_eq!(removed.config.domains, vec!["a2.example.com"]);
        assert!(reg.snapshot().server("a").is_none());
        assert_eq!(reg.snapshot().gateway_servers("gw").unwrap().len(), 0);
        assert!(reg.remove_server("a").is_none());
    }

    #[test]
    fn versions_increase() {
        let reg = Registry::new();
        let v0 = reg.snapshot().version;
        reg.replace(vec![], vec![]).unwrap();
        reg.upsert_server(server("x", &["x"])).unwrap();
        assert_eq!(reg.snapshot().version, v0 + 2);
    }
}
