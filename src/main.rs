use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use boxkeeper::config::{self, Config};
use boxkeeper::daemon::{self, Daemon};

/// Keep a sing-box engine configured from a panel subscription.
#[derive(Parser, Debug)]
#[command(name = "boxkeeper", version, about)]
struct Cli {
    /// Path to config.toml (default: <user config dir>/boxkeeper/config.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh, start the engine and supervise it until interrupted (default)
    Run,
    /// Run one refresh cycle and write the engine config without starting it
    Generate,
    /// Show where the engine config and executable resolve to
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };
    let config = Config::load_or_init(&config_path)?;
    init_tracing(&config.log_level);
    tracing::debug!(path = %config_path.display(), "config loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let daemon = Daemon::from_config(&config)?;
            daemon.run(CancellationToken::new()).await
        }
        Commands::Generate => {
            let path = daemon::generate_once(&config)
                .await
                .context("refresh failed")?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Check => {
            let report = daemon::check(&config)?;
            println!("config:        {}", config_path.display());
            println!(
                "engine config: {}{}",
                report.engine_config.display(),
                if report.engine_config_exists { "" } else { " (not generated yet)" }
            );
            println!(
                "subscription:  {}",
                report.subscription_url.as_deref().unwrap_or("(not configured)")
            );
            match report.binary {
                Ok(path) => {
                    println!("engine:        {}", path.display());
                    Ok(())
                }
                Err(reason) => anyhow::bail!("engine not found: {reason}"),
            }
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
