use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use usbbk::core::{CopyOptions, Orchestrator, copy_tree};
use usbbk::{adapters, config, context, logging};

#[derive(Parser)]
#[command(name = "usbbk")]
#[command(about = "Snapshot removable storage into timestamped backups", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for storage devices and back each one up when it appears
    Daemon(DaemonArgs),
    /// Mirror a directory tree once and exit
    Copy(CopyArgs),
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    backup_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    mount_wait_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    sync_files: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[derive(Args)]
struct CopyArgs {
    source: PathBuf,
    destination: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => config::AppConfig::new(Some(args))?,
        Commands::Copy(_) => config::AppConfig::new(None::<&DaemonArgs>)?,
    };

    logging::init(logging::LogConfig::from(&config));

    match cli.command {
        Commands::Daemon(_) => {
            let ctx = context::AppContext::new(config);
            run_daemon(ctx).await.context("Daemon stopped")?
        }
        Commands::Copy(args) => run_copy(args, &config).await.context("Copy failed")?,
    }

    Ok(())
}

async fn run_daemon(ctx: context::AppContext) -> Result<()> {
    let simulation = ctx.config.simulation;
    let monitor = adapters::get_monitor(simulation);
    let mounts = adapters::get_mount_resolver(simulation);

    Orchestrator::new(ctx, mounts).start(monitor.as_ref()).await
}

async fn run_copy(args: CopyArgs, config: &config::AppConfig) -> Result<()> {
    let options = CopyOptions {
        sync_files: config.sync_files,
    };

    let stats = tokio::task::spawn_blocking(move || {
        copy_tree(&args.source, &args.destination, &options)
    })
    .await??;

    info!(files = stats.files, bytes = stats.bytes, "Copy finished");
    Ok(())
}
