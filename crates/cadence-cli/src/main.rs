//! Cadence CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod handlers;
mod loader;
mod log;
mod stages;
mod submit;


use commands::Commands;
use config::CliConfig;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Cadence pipeline scheduler", long_about = None)]
struct Cli {
    /// Engine configuration file (defaults to ./cadence.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;
    init_tracing(cli.json_logs || config.json_logs);

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path),
        Commands::Run {
            path,
            pipeline,
            params,
        } => handlers::run_pipeline(&config, &path, &pipeline, params).await,
        Commands::Schedule { path, stop } => {
            handlers::schedule(&config, cli.config.clone(), &path, stop).await
        }
        Commands::Worker { path, names, stop } => {
            handlers::worker(&config, &path, &names, stop).await
        }
    }
}
