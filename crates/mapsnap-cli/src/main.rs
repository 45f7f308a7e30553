use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mapsnap_archive::{extract_flat, pack_dir};
use mapsnap_storage::sha256_file;
use mapsnap_sync::{build_scheduler, render_decision, HarvestConfig, Reconciler};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mapsnap")]
#[command(version, about = "Harvest map blueprints into a verified, reproducible archive")]
struct Cli {
    /// Workspace root holding archives, digests and reports
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Read the catalog from a directory of zip files instead of the web
    #[arg(long, global = true)]
    fixture_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one or two collection passes and accept or reject the result
    Reconcile,
    /// Reconcile on a cron schedule until interrupted
    Watch {
        /// Six-field cron expression (sec min hour day month weekday)
        #[arg(long)]
        cron: Option<String>,
    },
    /// Deterministically pack a directory into a zip
    Pack { source: PathBuf, output: PathBuf },
    /// Flatten a zip into a directory
    Extract { archive: PathBuf, target: PathBuf },
    /// Print the SHA-256 fingerprint of a file
    Digest { file: PathBuf },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = HarvestConfig::from_env();
    if let Some(workspace) = cli.workspace {
        config.workspace_root = workspace;
    }
    if let Some(dir) = cli.fixture_dir {
        config.fixture_dir = Some(dir);
    }

    match cli.command.unwrap_or(Commands::Reconcile) {
        Commands::Reconcile => {
            let reconciler = Reconciler::from_config(&config)?;
            let decision = reconciler.reconcile().await?;
            println!("{}", render_decision(&decision));
            return Ok(ExitCode::from(decision.exit_code() as u8));
        }
        Commands::Watch { cron } => {
            if let Some(cron) = cron {
                config.schedule_cron = cron;
            }
            info!(cron = %config.schedule_cron, "starting scheduler");
            let mut sched = build_scheduler(config).await?;
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Pack { source, output } => {
            let summary = pack_dir(&source, &output)
                .with_context(|| format!("packing {}", source.display()))?;
            let digest = sha256_file(&output)?;
            println!(
                "packed {} entries ({} bytes) into {}\n{digest}",
                summary.entries,
                summary.bytes_in,
                output.display()
            );
        }
        Commands::Extract { archive, target } => {
            let bytes = std::fs::read(&archive)
                .with_context(|| format!("reading {}", archive.display()))?;
            let summary = extract_flat(&bytes, &target)
                .with_context(|| format!("extracting {}", archive.display()))?;
            println!(
                "extracted {} files ({} skipped, {} overwritten) into {}",
                summary.written,
                summary.skipped,
                summary.overwritten,
                target.display()
            );
        }
        Commands::Digest { file } => {
            println!("{}", sha256_file(&file)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
