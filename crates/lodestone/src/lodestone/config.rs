use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::lodestone::{
    events::EventKind,
    net,
    status::{self, BedrockPing, PlayerSample, StatusTemplate},
};

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_PACKET_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_TUNNEL_BUFFER: usize = 64 * 1024;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_RELOAD_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap folds LODESTONE_CONFIG into the flag; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os("LODESTONE_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join("lodestone.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["lodestone.toml", "lodestone.yaml", "lodestone.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no lodestone.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/lodestone/lodestone.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "lodestone", "lodestone")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("lodestone.toml"))
    }
}

/// Creates `path` from the default template when it does not exist yet.
/// Returns whether a file was written.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match extension_of(path).as_str() {
        "toml" => DEFAULT_CONFIG_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_CONFIG_TEMPLATE_YAML,
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn parse_by_extension<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);
    match extension_of(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display())),
        "json" => serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display())),
        ext => anyhow::bail!("config: unsupported extension {ext:?} for {}", path.display()),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    if extension_of(path) == "json" {
        anyhow::bail!("config: main config must be .toml or .yaml/.yml");
    }
    let fc: FileConfig = parse_by_extension(path)?;
    Config::from_file_config(fc, path)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub admin_addr: String,
    pub reload: ReloadConfig,
    pub processing: ProcessingConfig,
    pub shutdown_grace: Duration,
    pub tunnel_buffer_size: usize,
    pub gateways: Vec<GatewayConfig>,
    pub webhooks: Vec<WebhookConfig>,
    pub servers_dir: PathBuf,
    /// `[[servers]]` declared in the main file.
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

/// Connection processing: worker pool and pre-tunnel limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub handshake_timeout: Duration,
    pub max_packet_bytes: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            workers,
            queue_size: workers * 256,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub id: String,
    pub listeners: Vec<ListenerConfig>,
    pub client_timeout: Duration,
    /// Routable server ids in priority order. Empty means every server.
    pub servers: Vec<String>,
    pub server_not_found_message: String,
    pub server_not_found_status: StatusTemplate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerProtocol {
    Java,
    Bedrock,
}

impl std::fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerProtocol::Java => write!(f, "java"),
            ListenerProtocol::Bedrock => write!(f, "bedrock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub bind: String,
    pub protocol: ListenerProtocol,
    pub receive_proxy_protocol: bool,
    pub receive_real_ip: bool,
    pub ping: BedrockPing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub id: String,
    pub url: String,
    /// Empty subscribes to every event type.
    pub events: Vec<EventKind>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub domains: Vec<String>,
    pub address: String,
    pub bind: Option<SocketAddr>,
    pub dial_timeout: Duration,
    pub send_proxy_protocol: bool,
    pub disconnect_message: String,
    pub offline_status: StatusTemplate,
    pub webhooks: Vec<String>,
    pub process: Option<ProcessConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub kind: ProcessKind,
    pub stop_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessKind {
    Command {
        start: String,
        stop: String,
    },
    Docker {
        endpoint: String,
        container: String,
    },
    Portainer {
        address: String,
        endpoint_id: String,
        api_key: String,
        container: String,
    },
}

/// Server descriptor as stored on disk and accepted by the admin API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, alias = "domain_names")]
    pub domains: Vec<String>,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_timeout: Option<String>,
    #[serde(default)]
    pub send_proxy_protocol: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_status: Option<FileStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<FileProcess>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileStatus {
    pub version_name: Option<String>,
    pub protocol_number: Option<i32>,
    pub max_players: Option<i32>,
    pub players_online: Option<i32>,
    #[serde(default)]
    pub player_samples: Vec<PlayerSample>,
    pub icon_path: Option<String>,
    pub motd: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileProcess {
    #[serde(rename = "type")]
    pub kind: String,
    pub start: Option<String>,
    pub stop: Option<String>,
    pub endpoint: Option<String>,
    pub container: Option<String>,
    pub address: Option<String>,
    pub endpoint_id: Option<String>,
    pub api_key: Option<String>,
    pub stop_after: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    admin: Option<FileAdmin>,
    reload: Option<FileReload>,
    processing: Option<FileProcessing>,
    shutdown_grace: Option<String>,
    tunnel_buffer_size: Option<usize>,
    #[serde(default)]
    gateways: Vec<FileGateway>,
    #[serde(default)]
    webhooks: Vec<FileWebhook>,
    servers_dir: Option<String>,
    #[serde(default)]
    servers: Vec<ServerFile>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileAdmin {
    addr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileReload {
    enabled: Option<bool>,
    poll_interval: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProcessing {
    workers: Option<usize>,
    queue_size: Option<usize>,
    handshake_timeout: Option<String>,
    max_packet_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileGateway {
    id: String,
    #[serde(default)]
    listeners: Vec<FileListener>,
    client_timeout: Option<String>,
    #[serde(default)]
    servers: Vec<String>,
    server_not_found_message: Option<String>,
    server_not_found_status: Option<FileStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileListener {
    bind: String,
    protocol: Option<String>,
    #[serde(default)]
    receive_proxy_protocol: bool,
    #[serde(default)]
    receive_real_ip: bool,
    ping: Option<FilePing>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePing {
    edition: Option<String>,
    motd: Option<String>,
    protocol_version: Option<i32>,
    version_name: Option<String>,
    player_count: Option<i32>,
    max_player_count: Option<i32>,
    level_name: Option<String>,
    gamemode: Option<String>,
    gamemode_numeric: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileWebhook {
    id: String,
    url: String,
    #[serde(default)]
    events: Vec<EventKind>,
    timeout: Option<String>,
}

fn parse_duration(field: &str, v: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    match v.map(str::trim) {
        None | Some("") => Ok(default),
        Some(s) => humantime::parse_duration(s).with_context(|| format!("config: {field}: invalid duration {s:?}")),
    }
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Lower-cases a domain pattern and drops a trailing dot.
pub fn normalize_domain(s: &str) -> String {
    s.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl Config {
    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

        let mut logging = LoggingConfig {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        };
        if let Some(l) = &fc.logging {
            if let Some(v) = non_empty(l.level.as_ref()) {
                logging.level = v;
            }
            if let Some(v) = non_empty(l.format.as_ref()) {
                logging.format = v;
            }
            if let Some(v) = non_empty(l.output.as_ref()) {
                logging.output = v;
            }
            logging.add_source = l.add_source;
        }

        let reload = ReloadConfig {
            enabled: fc.reload.as_ref().and_then(|r| r.enabled).unwrap_or(true),
            poll_interval: parse_duration(
                "reload.poll_interval",
                fc.reload.as_ref().and_then(|r| r.poll_interval.as_deref()),
                DEFAULT_RELOAD_POLL,
            )?,
        };

        let mut processing = ProcessingConfig::default();
        if let Some(p) = &fc.processing {
            if let Some(w) = p.workers.filter(|w| *w > 0) {
                processing.workers = w;
                processing.queue_size = w * 256;
            }
            if let Some(q) = p.queue_size.filter(|q| *q > 0) {
                processing.queue_size = q;
            }
            processing.handshake_timeout = parse_duration(
                "processing.handshake_timeout",
                p.handshake_timeout.as_deref(),
                DEFAULT_HANDSHAKE_TIMEOUT,
            )?;
            if let Some(m) = p.max_packet_bytes.filter(|m| *m > 0) {
                processing.max_packet_bytes = m;
            }
        }

        let mut gateways: Vec<GatewayConfig> = Vec::with_capacity(fc.gateways.len());
        for (i, g) in fc.gateways.iter().enumerate() {
            let gw = gateway_from_file(g, config_dir).with_context(|| format!("config: gateways[{i}]"))?;
            if gateways.iter().any(|o| o.id == gw.id) {
                anyhow::bail!("config: duplicate gateway id {:?}", gw.id);
            }
            gateways.push(gw);
        }

        let mut webhooks: Vec<WebhookConfig> = Vec::with_capacity(fc.webhooks.len());
        for w in &fc.webhooks {
            let id = w.id.trim().to_string();
            if id.is_empty() || w.url.trim().is_empty() {
                anyhow::bail!("config: webhooks entries need id and url");
            }
            if webhooks.iter().any(|o| o.id == id) {
                anyhow::bail!("config: duplicate webhook id {id:?}");
            }
            webhooks.push(WebhookConfig {
                id,
                url: w.url.trim().to_string(),
                events: w.events.clone(),
                timeout: parse_duration("webhooks.timeout", w.timeout.as_deref(), DEFAULT_WEBHOOK_TIMEOUT)?,
            });
        }

        let servers_dir = match non_empty(fc.servers_dir.as_ref()) {
            Some(p) => crate::lodestone::runtime_paths::resolve_relative(config_dir, PathBuf::from(p)),
            None => config_dir.join("servers"),
        };

        let mut servers = Vec::with_capacity(fc.servers.len());
        for (i, s) in fc.servers.into_iter().enumerate() {
            servers.push(
                s.into_config(None, config_dir)
                    .with_context(|| format!("config: servers[{i}]"))?,
            );
        }

        Ok(Config {
            logging,
            admin_addr: fc
                .admin
                .as_ref()
                .and_then(|a| non_empty(a.addr.as_ref()))
                .unwrap_or_default(),
            reload,
            processing,
            shutdown_grace: parse_duration("shutdown_grace", fc.shutdown_grace.as_deref(), DEFAULT_SHUTDOWN_GRACE)?,
            tunnel_buffer_size: fc
                .tunnel_buffer_size
                .filter(|b| *b > 0)
                .unwrap_or(DEFAULT_TUNNEL_BUFFER),
            gateways,
            webhooks,
            servers_dir,
            servers,
        })
    }
}

fn gateway_from_file(g: &FileGateway, config_dir: &Path) -> anyhow::Result<GatewayConfig> {
    let id = g.id.trim().to_string();
    if id.is_empty() {
        anyhow::bail!("missing id");
    }
    if g.listeners.is_empty() {
        anyhow::bail!("gateway {id:?} has no listeners");
    }

    let mut listeners = Vec::with_capacity(g.listeners.len());
    for l in &g.listeners {
        let protocol = match l
            .protocol
            .as_deref()
            .map(|p| p.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("") | Some("java") | Some("tcp") => ListenerProtocol::Java,
            Some("bedrock") | Some("udp") | Some("raknet") => ListenerProtocol::Bedrock,
            Some(other) => anyhow::bail!("listener {:?}: unknown protocol {other:?}", l.bind),
        };
        if protocol == ListenerProtocol::Bedrock && l.receive_real_ip {
            anyhow::bail!("listener {:?}: receive_real_ip is java only", l.bind);
        }
        let bind = net::normalize_bind_addr(&l.bind).into_owned();
        if bind.parse::<SocketAddr>().is_err() {
            anyhow::bail!("listener {:?}: bind must be ip:port or :port", l.bind);
        }

        let mut ping = BedrockPing::default();
        if let Some(p) = &l.ping {
            if let Some(v) = non_empty(p.edition.as_ref()) {
                ping.edition = v;
            }
            if let Some(v) = p.motd.clone() {
                ping.motd = v;
            }
            if let Some(v) = p.protocol_version {
                ping.protocol_version = v;
            }
            if let Some(v) = non_empty(p.version_name.as_ref()) {
                ping.version_name = v;
            }
            if let Some(v) = p.player_count {
                ping.player_count = v;
            }
            if let Some(v) = p.max_player_count {
                ping.max_player_count = v;
            }
            if let Some(v) = p.level_name.clone() {
                ping.level_name = v;
            }
            if let Some(v) = non_empty(p.gamemode.as_ref()) {
                ping.gamemode = v;
            }
            if let Some(v) = p.gamemode_numeric {
                ping.gamemode_numeric = v;
            }
        }

        listeners.push(ListenerConfig {
            bind,
            protocol,
            receive_proxy_protocol: l.receive_proxy_protocol,
            receive_real_ip: l.receive_real_ip,
            ping,
        });
    }

    Ok(GatewayConfig {
        id,
        listeners,
        client_timeout: parse_duration("client_timeout", g.client_timeout.as_deref(), DEFAULT_CLIENT_TIMEOUT)?,
        servers: g
            .servers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        server_not_found_message: g
            .server_not_found_message
            .clone()
            .unwrap_or_else(|| "There is no proxy associated with this domain. Please check your configuration.".into()),
        server_not_found_status: status_from_file(
            g.server_not_found_status.as_ref(),
            StatusTemplate::not_found_default(),
            config_dir,
        )?,
    })
}

fn status_from_file(
    file: Option<&FileStatus>,
    mut base: StatusTemplate,
    base_dir: &Path,
) -> anyhow::Result<StatusTemplate> {
    let Some(s) = file else {
        return Ok(base);
    };
    if let Some(v) = non_empty(s.version_name.as_ref()) {
        base.version_name = v;
    }
    if let Some(v) = s.protocol_number {
        base.protocol_number = v;
    }
    if let Some(v) = s.max_players {
        base.max_players = v;
    }
    if let Some(v) = s.players_online {
        base.players_online = v;
    }
    if !s.player_samples.is_empty() {
        base.player_samples = s.player_samples.clone();
    }
    if let Some(v) = s.motd.clone() {
        base.motd = v;
    }
    if let Some(icon) = non_empty(s.icon_path.as_ref()) {
        let p = crate::lodestone::runtime_paths::resolve_relative(base_dir, PathBuf::from(icon));
        base.favicon = Some(status::load_favicon(&p)?);
    }
    Ok(base)
}

impl ServerFile {
    /// Validates and normalises the descriptor. `default_id` is used when
    /// the file carries no explicit id (the file stem for per-server files).
    pub fn into_config(self, default_id: Option<&str>, base_dir: &Path) -> anyhow::Result<ServerConfig> {
        let id = non_empty(self.id.as_ref())
            .or_else(|| default_id.map(str::to_string))
            .context("server descriptor missing id")?;

        let domains: Vec<String> = self
            .domains
            .iter()
            .map(|d| normalize_domain(d))
            .filter(|d| !d.is_empty())
            .collect();
        if domains.is_empty() {
            anyhow::bail!("server {id:?}: no domains");
        }

        let address = self.address.trim().to_string();
        if address.is_empty() {
            anyhow::bail!("server {id:?}: missing address");
        }

        let bind = match non_empty(self.bind.as_ref()) {
            Some(b) => {
                let b = net::normalize_bind_addr(&b).into_owned();
                let parsed = match b.parse::<SocketAddr>() {
                    Ok(sa) => sa,
                    Err(_) => SocketAddr::new(
                        b.parse()
                            .with_context(|| format!("server {id:?}: invalid bind {b:?}"))?,
                        0,
                    ),
                };
                Some(parsed)
            }
            None => None,
        };

        let process = match self.process {
            Some(p) => Some(process_from_file(p).with_context(|| format!("server {id:?}: process"))?),
            None => None,
        };

        Ok(ServerConfig {
            dial_timeout: parse_duration("dial_timeout", self.dial_timeout.as_deref(), DEFAULT_DIAL_TIMEOUT)?,
            send_proxy_protocol: self.send_proxy_protocol,
            disconnect_message: self
                .disconnect_message
                .unwrap_or_else(|| "Sorry {{username}}, but the server is offline.".into()),
            offline_status: status_from_file(
                self.offline_status.as_ref(),
                StatusTemplate::offline_default(),
                base_dir,
            )?,
            webhooks: self.webhooks,
            process,
            id,
            domains,
            address,
            bind,
        })
    }
}

fn process_from_file(p: FileProcess) -> anyhow::Result<ProcessConfig> {
    let req = |v: &Option<String>, name: &str| -> anyhow::Result<String> {
        non_empty(v.as_ref()).with_context(|| format!("missing {name}"))
    };
    let kind = match p.kind.trim().to_ascii_lowercase().as_str() {
        "command" => ProcessKind::Command {
            start: req(&p.start, "start")?,
            stop: req(&p.stop, "stop")?,
        },
        "docker" => ProcessKind::Docker {
            endpoint: non_empty(p.endpoint.as_ref()).unwrap_or_else(|| "http://127.0.0.1:2375".into()),
            container: req(&p.container, "container")?,
        },
        "portainer" => ProcessKind::Portainer {
            address: req(&p.address, "address")?,
            endpoint_id: req(&p.endpoint_id, "endpoint_id")?,
            api_key: req(&p.api_key, "api_key")?,
            container: req(&p.container, "container")?,
        },
        other => anyhow::bail!("unknown process type {other:?}"),
    };
    let stop_after = match non_empty(p.stop_after.as_ref()) {
        Some(s) => Some(humantime::parse_duration(&s).with_context(|| format!("invalid stop_after {s:?}"))?),
        None => None,
    };
    Ok(ProcessConfig { kind, stop_after })
}

/// Loads every `*.json|toml|yaml|yml` descriptor in `dir`, sorted by file
/// name. A missing directory yields no servers.
pub fn load_server_dir(dir: &Path) -> anyhow::Result<Vec<ServerConfig>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("config: read dir {}", dir.display())),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && SERVER_FILE_EXTENSIONS.contains(&extension_of(p).as_str()))
        .collect();
    paths.sort();

    paths.iter().map(|p| load_server_file(p)).collect()
}

/// Loads one per-server descriptor; the file stem is the default id.
pub fn load_server_file(path: &Path) -> anyhow::Result<ServerConfig> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let base = path.parent().unwrap_or(Path::new("."));
    let sf: ServerFile = parse_by_extension(path)?;
    sf.into_config(Some(&stem), base)
        .with_context(|| format!("config: {}", path.display()))
}

/// File extensions accepted in the servers directory.
pub const SERVER_FILE_EXTENSIONS: [&str; 4] = ["json", "toml", "yaml", "yml"];

/// Read-only view of the configuration store.
pub trait ConfigSource: Send + Sync {
    fn load_gateways(&self) -> anyhow::Result<Vec<GatewayConfig>>;
    fn load_servers(&self) -> anyhow::Result<Vec<ServerConfig>>;
    fn load_webhooks(&self) -> anyhow::Result<Vec<WebhookConfig>>;
    fn load_cpns(&self) -> anyhow::Result<ProcessingConfig>;

    /// Everything a full reload applies, taken from one read of the store.
    fn load_all(&self) -> anyhow::Result<ConfigSet> {
        Ok(ConfigSet {
            gateways: self.load_gateways()?,
            servers: self.load_servers()?,
            webhooks: self.load_webhooks()?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigSet {
    pub gateways: Vec<GatewayConfig>,
    pub servers: Vec<ServerConfig>,
    pub webhooks: Vec<WebhookConfig>,
}

/// Main config file plus a directory of per-server files.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    pub config_path: PathBuf,
    pub servers_dir: PathBuf,
}

impl FileConfigSource {
    pub fn new(config_path: PathBuf, servers_dir: PathBuf) -> Self {
        Self {
            config_path,
            servers_dir,
        }
    }

    /// Appends the servers directory to servers declared in the main file.
    fn with_server_dir(&self, mut servers: Vec<ServerConfig>) -> anyhow::Result<Vec<ServerConfig>> {
        for s in load_server_dir(&self.servers_dir)? {
            if servers.iter().any(|o| o.id == s.id) {
                anyhow::bail!("config: duplicate server id {:?}", s.id);
            }
            servers.push(s);
        }
        Ok(servers)
    }
}

impl ConfigSource for FileConfigSource {
    fn load_gateways(&self) -> anyhow::Result<Vec<GatewayConfig>> {
        Ok(load_config(&self.config_path)?.gateways)
    }

    fn load_servers(&self) -> anyhow::Result<Vec<ServerConfig>> {
        self.with_server_dir(load_config(&self.config_path)?.servers)
    }

    fn load_webhooks(&self) -> anyhow::Result<Vec<WebhookConfig>> {
        Ok(load_config(&self.config_path)?.webhooks)
    }

    fn load_cpns(&self) -> anyhow::Result<ProcessingConfig> {
        Ok(load_config(&self.config_path)?.processing)
    }

    fn load_all(&self) -> anyhow::Result<ConfigSet> {
        let cfg = load_config(&self.config_path)?;
        Ok(ConfigSet {
            servers: self.with_server_dir(cfg.servers)?,
            gateways: cfg.gateways,
            webhooks: cfg.webhooks,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Lodestone configuration (auto-generated)
#
# Backend servers live one per file in `servers_dir` (json, toml or yaml).
# Every gateway with an empty `servers` list may route to all of them.

servers_dir = "servers"
shutdown_grace = "10s"

[admin]
addr = "127.0.0.1:8080"

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[reload]
enabled = true
poll_interval = "2s"

[processing]
handshake_timeout = "10s"

[[gateways]]
id = "default"
client_timeout = "30s"
servers = []
server_not_found_message = "There is no proxy associated with this domain. Please check your configuration."

[[gateways.listeners]]
bind = ":25565"
protocol = "java"

[[gateways.listeners]]
bind = ":19132"
protocol = "bedrock"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Lodestone configuration (auto-generated)
#
# Backend servers live one per file in `servers_dir` (json, toml or yaml).
# Every gateway with an empty `servers` list may route to all of them.

servers_dir: "servers"
shutdown_grace: "10s"

admin:
  addr: "127.0.0.1:8080"

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

reload:
  enabled: true
  poll_interval: "2s"

processing:
  handshake_timeout: "10s"

gateways:
  - id: "default"
    client_timeout: "30s"
    servers: []
    server_not_found_message: "There is no proxy associated with this domain. Please check your configuration."
    listeners:
      - bind: ":25565"
        protocol: "java"
      - bind: ":19132"
        protocol: "bedrock"
"#;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("lodestone_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn default_templates_load() {
        for name in ["lodestone.toml", "lodestone.yaml"] {
            let dir = temp_dir("templates");
            let path = dir.join(name);
            assert!(ensure_config_file(&path).expect("ensure"));
            assert!(!ensure_config_file(&path).expect("ensure twice"));

            let cfg = load_config(&path).expect("load");
            assert_eq!(cfg.gateways.len(), 1);
            let gw = &cfg.gateways[0];
            assert_eq!(gw.listeners.len(), 2);
            assert_eq!(gw.listeners[0].bind, "0.0.0.0:25565");
            assert_eq!(gw.listeners[1].protocol, ListenerProtocol::Bedrock);
            assert_eq!(gw.client_timeout, Duration::from_secs(30));
            assert_eq!(cfg.servers_dir, dir.join("servers"));
            assert_eq!(cfg.admin_addr, "127.0.0.1:8080");
            assert_eq!(cfg.processing.handshake_timeout, Duration::from_secs(10));

            let _ = std::fs::remove_dir_all(&dir);
        }
    }

    #[test]
    fn unknown_top_level_key_rejected() {
        let dir = temp_dir("unknown_key");
        let path = dir.join("lodestone.toml");
        std::fs::write(&path, "routes = []\n").expect("write");
        let msg = format!("{:#}", load_config(&path).unwrap_err());
        assert!(msg.contains("routes"), "got: {msg}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn processing_and_durations() {
        let dir = temp_dir("processing");
        let path = dir.join("lodestone.toml");
        std::fs::write(
            &path,
            r#"
shutdown_grace = "1500ms"

[processing]
workers = 3
handshake_timeout = "2s"

[[gateways]]
id = "gw"
client_timeout = "1m"
servers = ["a", "b"]
listeners = [{ bind = "127.0.0.1:25565", receive_proxy_protocol = true }]

[[webhooks]]
id = "hook"
url = "http://127.0.0.1:9/"
events = ["PlayerJoin", "Error"]
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.processing.workers, 3);
        assert_eq!(cfg.processing.queue_size, 768);
        assert_eq!(cfg.processing.handshake_timeout, Duration::from_secs(2));
        assert_eq!(cfg.shutdown_grace, Duration::from_millis(1500));
        assert_eq!(cfg.gateways[0].client_timeout, Duration::from_secs(60));
        assert_eq!(cfg.gateways[0].servers, vec!["a", "b"]);
        assert!(cfg.gateways[0].listeners[0].receive_proxy_protocol);
        assert_eq!(cfg.webhooks[0].events, vec![EventKind::PlayerJoin, EventKind::Error]);
        assert_eq!(cfg.webhooks[0].timeout, DEFAULT_WEBHOOK_TIMEOUT);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bad_duration_is_an_error() {
        let dir = temp_dir("bad_duration");
        let path = dir.join("lodestone.toml");
        std::fs::write(&path, "shutdown_grace = \"soon\"\n").expect("write");
        let msg = format!("{:#}", load_config(&path).unwrap_err());
        assert!(msg.contains("shutdown_grace"), "got: {msg}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn server_dir_mixed_formats_and_stem_ids() {
        let dir = temp_dir("servers");
        std::fs::write(
            dir.join("lobby.json"),
            r#"{"domains":["Play.Example.com."],"address":"127.0.0.1:25566","send_proxy_protocol":true}"#,
        )
        .expect("write");
        std::fs::write(
            dir.join("survival.toml"),
            "domains = [\"*.example.com\"]\naddress = \"10.0.0.2\"\ndial_timeout = \"1s\"\n[process]\ntype = \"docker\"\ncontainer = \"mc\"\nstop_after = \"5m\"\n",
        )
        .expect("write");
        std::fs::write(dir.join("creative.yaml"), "id: build\ndomains: [\"*\"]\naddress: \"10.0.0.3:25565\"\n")
            .expect("write");
        std::fs::write(dir.join("notes.txt"), "ignored").expect("write");

        let servers = load_server_dir(&dir).expect("load");
        let ids: Vec<&str> = servers.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["build", "lobby", "survival"]);
        assert_eq!(servers[1].domains, vec!["play.example.com"]);
        assert!(servers[1].send_proxy_protocol);
        assert_eq!(servers[2].dial_timeout, Duration::from_secs(1));
        assert_eq!(
            servers[2].process,
            Some(ProcessConfig {
                kind: ProcessKind::Docker {
                    endpoint: "http://127.0.0.1:2375".into(),
                    container: "mc".into(),
                },
                stop_after: Some(Duration::from_secs(300)),
            })
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn server_descriptor_validation() {
        let base = Path::new(".");
        let no_domains = ServerFile {
            address: "127.0.0.1:1".into(),
            ..Default::default()
        };
        assert!(no_domains.into_config(Some("x"), base).is_err());

        let bad_process = ServerFile {
            domains: vec!["a.example.com".into()],
            address: "127.0.0.1:1".into(),
            process: Some(FileProcess {
                kind: "command".into(),
                start: Some("start.sh".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let msg = format!("{:#}", bad_process.into_config(Some("x"), base).unwrap_err());
        assert!(msg.contains("missing stop"), "got: {msg}");

        let ok: ServerFile = serde_json::from_str(r#"{"domain_names":["a.example.com"],"address":"1.2.3.4","bind":"10.0.0.1"}"#)
            .expect("json");
        let cfg = ok.into_config(Some("x"), base).expect("config");
        assert_eq!(cfg.bind, Some("10.0.0.1:0".parse().unwrap()));
        assert_eq!(cfg.dial_timeout, DEFAULT_DIAL_TIMEOUT);
    }

    #[test]
    fn file_source_merges_inline_and_dir_servers() {
        let dir = temp_dir("source");
        let path = dir.join("lodestone.toml");
        std::fs::write(
            &path,
            "[[servers]]\nid = \"inline\"\ndomains = [\"inline.example.com\"]\naddress = \"127.0.0.1:1\"\n",
        )
        .expect("write");
        let sdir = dir.join("servers");
        std::fs::create_dir_all(&sdir).expect("mkdir");
        std::fs::write(sdir.join("inline.json"), r#"{"domains":["x"],"address":"127.0.0.1:2"}"#).expect("write");

        let src = FileConfigSource::new(path.clone(), sdir.clone());
        let msg = format!("{:#}", src.load_servers().unwrap_err());
        assert!(msg.contains("duplicate server id"), "got: {msg}");

        std::fs::rename(sdir.join("inline.json"), sdir.join("other.json")).expect("rename");
        let servers = src.load_servers().expect("load");
        assert_eq!(servers.len(), 2);
        assert!(src.load_gateways().expect("gateways").is_empty());
        assert!(src.load_webhooks().expect("webhooks").is_empty());
        assert!(src.load_cpns().expect("cpns").workers >= 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_source_load_all_takes_everything_from_one_read() {
        let dir = temp_dir("source-all");
        let path = dir.join("lodestone.toml");
        std::fs::write(
            &path,
            r#"
[[servers]]
id = "inline"
domains = ["inline.example.com"]
address = "127.0.0.1:1"

[[gateways]]
id = "gw"
listeners = [{ bind = "127.0.0.1:25565" }]

[[webhooks]]
id = "hook"
url = "http://127.0.0.1:9/"
"#,
        )
        .expect("write");
        let sdir = dir.join("servers");
        std::fs::create_dir_all(&sdir).expect("mkdir");
        std::fs::write(sdir.join("extra.json"), r#"{"domains":["x"],"address":"127.0.0.1:2"}"#).expect("write");

        let src = FileConfigSource::new(path.clone(), sdir.clone());
        let set = src.load_all().expect("load all");
        assert_eq!(set.gateways.len(), 1);
        assert_eq!(set.gateways[0].id, "gw");
        assert_eq!(set.webhooks[0].id, "hook");
        let mut ids: Vec<&str> = set.servers.iter().map(|s| s.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["extra", "inline"]);

        std::fs::write(sdir.join("inline.json"), r#"{"domains":["y"],"address":"127.0.0.1:3"}"#).expect("write");
        let msg = format!("{:#}", src.load_all().unwrap_err());
        assert!(msg.contains("duplicate server id"), "got: {msg}");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
