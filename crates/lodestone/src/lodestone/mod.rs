pub mod admin;
pub mod app;
pub mod config;
pub mod events;
pub mod gateway;
pub mod handshake;
pub mod logging;
pub mod net;
pub mod process;
pub mod protocol;
pub mod raknet;
pub mod registry;
pub mod reload;
pub mod router;
pub mod runtime_paths;
pub mod server;
pub mod status;
pub mod telemetry;
pub mod template;
pub mod tunnel;
pub mod webhook;
pub mod worker;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    servers_dir: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    app::run(config_path, servers_dir).await
}
