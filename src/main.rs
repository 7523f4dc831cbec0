use std::path::PathBuf;

use aerotrack::config::PipelineConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

mod commands;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "aerotrack")]
#[command(about = "Poll live aircraft telemetry, consolidate it into flights and retire stale ones")]
#[command(version)]
struct Cli {
    /// TOML configuration file; reference defaults are used when omitted
    #[arg(long, global = true, env = "AEROTRACK_CONFIG")]
    config: Option<PathBuf>,

    /// Write to an in-memory store instead of Postgres
    #[arg(long, global = true)]
    dry_run: bool,

    /// Debug logging for aerotrack modules
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Serve Prometheus metrics on this port (run only)
    #[arg(long, global = true, env = "METRICS_PORT")]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduled pipeline until interrupted
    Run,
    /// Poll every area once and consolidate the result
    PollOnce,
    /// Close flights that have gone quiet
    Sweep {
        /// Staleness threshold in seconds (defaults to the configured one)
        #[arg(long)]
        threshold: Option<i64>,
    },
    /// Apply pending database migrations
    Migrate,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Sentry has to be up before the runtime starts its worker threads
    let _sentry = aerotrack::logging::init_sentry(std::env::var("SENTRY_DSN").ok().as_deref());
    aerotrack::logging::init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(dispatch(cli)) {
        error!("{:#}", e);
        drop(runtime);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = PipelineConfig::from_sources(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Run => commands::handle_run(config, cli.dry_run, cli.metrics_port).await,
        Commands::PollOnce => commands::handle_poll_once(&config, cli.dry_run).await,
        Commands::Sweep { threshold } => {
            commands::handle_sweep(&config, cli.dry_run, threshold).await
        }
        Commands::Migrate => commands::handle_migrate(&config).await,
    }
}
