use clap::{Parser, Subcommand};
use device::{DeviceBackend, MemoryBackend};
use keyrpc::config::{KeyrpcConfig, CONFIG_ENV};
use keyrpc::{diagnostics, run_rpc, run_shell};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyrpc")]
#[command(version)]
#[command(about = "Manage hardware security keys over a JSON-lines RPC protocol")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve RPC commands on stdin/stdout
    Rpc {
        /// Start an interactive shell instead of reading stdin
        #[arg(long)]
        shell: bool,
    },
    /// Print a diagnostics report as JSON
    Diagnose,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = KeyrpcConfig::load(cli.config.as_deref())?;

    // stdout carries the protocol, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let backend: Arc<dyn DeviceBackend> =
        Arc::new(MemoryBackend::from_devices(&config.simulator.devices)?);
    info!(devices = config.simulator.devices.len(), "simulated keys attached");

    match cli.command {
        Commands::Rpc { shell: true } => run_shell(backend, config).await?,
        Commands::Rpc { shell: false } => {
            run_rpc(tokio::io::stdin(), tokio::io::stdout(), backend, &config).await?
        }
        Commands::Diagnose => {
            let report = diagnostics::collect(backend.as_ref()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
