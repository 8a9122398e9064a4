//! Silo CLI
//!
//! Commands:
//!   serve   - Start the HTTP server with an in-process job worker
//!   worker  - Run a standalone job worker against the shared database

use anyhow::Result;
use clap::{Parser, Subcommand};
use silo::config::Settings;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "silo")]
#[command(about = "Multi-tenant RAG indexing and search service")]
#[command(version)]
struct Cli {
    /// Optional TOML config file (environment variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8003")]
        port: u16,
    },

    /// Run a standalone job worker
    Worker {
        /// Seconds between queue polls
        #[arg(long, default_value = "1.0")]
        poll_interval: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => {
            silo::server::run_server(settings, port).await?;
        }
        Commands::Worker { poll_interval } => {
            let state = tokio::task::spawn_blocking(move || silo::server::build_state(settings)).await??;
            silo::server::spawn_worker(&state, Duration::from_secs_f64(poll_interval.max(0.1)));
            tracing::info!("worker running, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("worker shutdown");
        }
    }

    Ok(())
}
