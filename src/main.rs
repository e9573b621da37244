use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "shroud", version, about = "Shroud - client/server VPN tunnel")]
struct Cli {
    /// Path to the config file (.toml/.yaml). If omitted, uses
    /// SHROUD_CONFIG, then shroud.toml in the CWD, then the OS default
    /// config dir.
    #[arg(long, env = "SHROUD_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server (default).
    Run,
    /// Mint an access token into the configured storage directory.
    CreateToken {
        /// Human-readable token name.
        #[arg(long)]
        name: Option<String>,
        /// Traffic cap in bytes.
        #[arg(long)]
        max_traffic: Option<u64>,
        /// Simultaneous client cap; omit for unlimited.
        #[arg(long)]
        max_client_count: Option<u32>,
        /// Endpoint clients should dial; defaults to the listen address.
        #[arg(long)]
        public_endpoint: Option<std::net::SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None | Some(Command::Run) => shroud::run(cli.config).await,
        Some(Command::CreateToken {
            name,
            max_traffic,
            max_client_count,
            public_endpoint,
        }) => {
            shroud::app::create_token(cli.config, name, max_traffic, max_client_count, public_endpoint)
                .await
        }
    }
}
