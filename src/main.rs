mod backoff;
mod config;
mod config_mitm;
mod error;
mod events;
mod model;
mod supervisor;
mod tls;
mod voice;
mod xmpp;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Loopback proxy that exposes decrypted Riot client chat traffic as a
/// JSON event stream on stdout and optionally narrates it via TTS.
#[derive(Parser, Debug)]
#[command(name = "chatproxy", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/chatproxy.toml")]
    config: String,

    /// Override the lockfile path from the config file.
    #[arg(long)]
    lockfile: Option<String>,

    /// Override the ingest mode from the config file.
    #[arg(long, value_enum)]
    mode: Option<CliMode>,

    /// Log level filter, used when `RUST_LOG` is unset.
    #[arg(long, default_value = "chatproxy=info")]
    log_level: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliMode {
    Mitm,
    Bridge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Internal diagnostics go to stderr via tracing, kept strictly
    // separate from the NDJSON event stream written to stdout.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let mut config = Config::load(&cli.config)?;

    if let Some(lockfile) = cli.lockfile {
        config.proxy.lockfile_path = lockfile.into();
    }
    if let Some(mode) = cli.mode {
        config.proxy.mode = match mode {
            CliMode::Mitm => config::ProxyMode::Mitm,
            CliMode::Bridge => config::ProxyMode::Bridge,
        };
    }

    supervisor::run(config).await
}
