//! vdcd - VDC scheduler daemon
//!
//! Admits jobs against per-cluster quota and dispatches them to Kubernetes,
//! Slurm or local executors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vdcd::{Daemon, VdcConfig, SAMPLE_CONFIG};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "vdcd")]
#[command(about = "VDC scheduler daemon")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "VDCD_CONFIG", default_value = "/etc/vdc/vdcd.toml", global = true)]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler
    Run {
        /// Replace every executor backend with an in-memory mock
        #[arg(long)]
        dry_run: bool,

        /// JSON array of job requests to submit at start-up
        #[arg(long)]
        jobs: Option<PathBuf>,

        /// Seconds between usage reports
        #[arg(long, default_value_t = 60)]
        report_interval: u64,
    },

    /// Validate the config file and exit
    CheckConfig,

    /// Write a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "vdcd.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Commands::Run {
            dry_run,
            jobs,
            report_interval,
        } => run(&cli.config, dry_run, jobs, report_interval).await,
        Commands::CheckConfig => check_config(&cli.config),
        Commands::InitConfig { output, force } => init_config(&output, force),
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("vdcd=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
    Ok(())
}

async fn run(
    config_path: &Path,
    dry_run: bool,
    jobs: Option<PathBuf>,
    report_interval: u64,
) -> anyhow::Result<()> {
    info!(config = %config_path.display(), dry_run, "starting vdcd");
    let config = VdcConfig::from_file(config_path)?;
    let daemon = Daemon::build(config, dry_run)?;

    if let Some(jobs) = jobs {
        daemon.submit_file(&jobs).await?;
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("received ctrl-c");
        let _ = tx.send(true);
    });

    daemon
        .run(rx, Duration::from_secs(report_interval.max(1)))
        .await;
    info!("vdcd stopped");
    Ok(())
}

fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = VdcConfig::from_file(config_path)?;
    println!("Config OK: {}", config_path.display());
    println!("  Policy:    {}", config.scheduler.policy);
    println!("  Selection: {}", config.scheduler.selection);
    println!(
        "  Executors: {}",
        config
            .executors
            .configured_types()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    for cluster in &config.clusters {
        println!(
            "  Cluster {:<20} executor={:<11} quota={}",
            cluster.id.as_str(),
            cluster.executor.as_str(),
            cluster.quota.kind()
        );
    }
    Ok(())
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(output, SAMPLE_CONFIG)?;
    println!("Wrote sample config to {}", output.display());
    Ok(())
}
