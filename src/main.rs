use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tsbridge::{agent, config};

/// Aggregating bridge from MQTT sensor topics to a rate-limited ingestion sink.
#[derive(Parser)]
#[command(name = "tsbridge", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Load and validate the configuration, print the MQTT subscriptions, and exit.
    Check,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("tsbridge {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = config::Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if let Some(Command::Check) = &cli.command {
        let classifier = tsbridge::bridge::classify::Classifier::new(&cfg.channels)
            .context("building topic classifier")?;
        for subscription in classifier.subscriptions() {
            println!("{subscription}");
        }
        return Ok(());
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting tsbridge",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("tsbridge stopped");

    Ok(())
}
