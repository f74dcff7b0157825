mod lodestone;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "lodestone",
    version,
    about = "Lodestone - Minecraft Java and Bedrock reverse proxy"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses LODESTONE_CONFIG; then auto-detects lodestone.toml > lodestone.yaml > lodestone.yml from CWD; then falls back to the OS default path (Linux: /etc/lodestone/lodestone.toml; others: user config dir).
    #[arg(long, env = "LODESTONE_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Directory of per-server descriptors. Overrides `servers_dir` from the config file.
    #[arg(long, env = "LODESTONE_SERVERS_DIR")]
    servers_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    lodestone::run(cli.config, cli.servers_dir).await
}
