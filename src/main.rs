// src/main.rs
// Process entry point: parse the CLI, resolve configuration, bootstrap the
// runtime (state store, Markov model, classifier), and serve. Startup
// failures exit non-zero: 1 config, 2 state store, 3 model artifact.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use quagmire::{server, Config, Error, Runtime};

#[derive(Parser)]
#[command(
    name = "quagmire",
    about = "Layered anti-scraping defense: edge filter, tarpit, escalation, enforcement",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// JSON config file; QUAG_* environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the public listen address.
    #[arg(long)]
    public_addr: Option<SocketAddr>,

    /// Override the internal listen address.
    #[arg(long)]
    internal_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quagmire=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("{}", err);
        std::process::exit(err.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(addr) = cli.public_addr {
        config.public_listen_addr = addr;
    }
    if let Some(addr) = cli.internal_addr {
        config.internal_listen_addr = addr;
    }

    info!(
        tarpit_mount = %config.tarpit_rewrite_path,
        max_hops = config.tarpit_max_hops,
        hop_window = config.tarpit_hop_window_seconds,
        blocklist_ttl = config.blocklist_ttl_seconds,
        alert_method = config.alert_method.as_str(),
        "configuration resolved"
    );

    let rt = Runtime::bootstrap(config).await?;
    server::serve(rt).await
}
