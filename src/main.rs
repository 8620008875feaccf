use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use migratoor::config::{Config, DEFAULT_WORKERS};

/// Migrates Weights & Biases projects into MLflow, resumably.
#[derive(Parser)]
#[command(name = "migratoor", about)]
struct Cli {
    /// Source project to migrate.
    #[arg(long)]
    project: Option<String>,

    /// Source entity (team or user) owning the project.
    #[arg(long, default_value = "mosaic-ml")]
    entity: String,

    /// Destination experiment name (defaults to the project name).
    #[arg(long)]
    experiment_name: Option<String>,

    /// Only migrate runs whose name matches this pattern (regex,
    /// repeatable).
    #[arg(long = "run-allowlist")]
    run_allowlist: Vec<String>,

    /// Metric keys to skip, exact or regex (repeatable).
    #[arg(long = "exclude-metric")]
    exclude_metrics: Vec<String>,

    /// Write converted records to local snapshot files instead of MLflow.
    #[arg(long)]
    dry_run: bool,

    /// Directory holding snapshot experiments.
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Replay previously written snapshot files into MLflow.
    #[arg(long)]
    resume_from_dry_run: bool,

    /// Reap unfinished destination runs from a crashed attempt and skip
    /// the finished ones.
    #[arg(long)]
    resume_from_crash: bool,

    /// Reuse a same-named destination experiment and skip runs already
    /// present in it.
    #[arg(long)]
    skip_existing: bool,

    /// Skip source runs that already dual-write to MLflow.
    #[arg(long)]
    skip_dual_write_runs: bool,

    /// Represent wandb run groups as nested MLflow runs.
    #[arg(long)]
    nested_runs: bool,

    /// Worker pool size for snapshot replay.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Externally managed MLflow experiment id to write into
    /// unconditionally.
    #[arg(long)]
    dual_write_experiment_id: Option<String>,

    /// Source service base URL.
    #[arg(long, default_value = "https://api.wandb.ai")]
    wandb_url: String,

    /// MLflow tracking server base URL.
    #[arg(long, env = "MLFLOW_TRACKING_URI", default_value = "http://localhost:5000")]
    mlflow_url: String,

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
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
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

impl Cli {
    fn into_config(self) -> Result<Config> {
        Ok(Config {
            project: self.project.context("--project is required")?,
            entity: self.entity,
            experiment_name: self.experiment_name,
            run_allowlist: self.run_allowlist,
            exclude_metrics: self.exclude_metrics,
            dry_run: self.dry_run,
            save_dir: self.save_dir,
            resume_from_dry_run: self.resume_from_dry_run,
            resume_from_crash: self.resume_from_crash,
            skip_existing: self.skip_existing,
            skip_dual_write_runs: self.skip_dual_write_runs,
            nested_runs: self.nested_runs,
            workers: self.workers,
            dual_write_experiment_id: self.dual_write_experiment_id,
            wandb_url: self.wandb_url,
            mlflow_url: self.mlflow_url,
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("migratoor {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = cli.into_config()?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        project = %cfg.project,
        "starting migratoor",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Cancellation is coarse: signals stop the migration between runs;
    // a later start with --resume-from-crash picks up the rest.
    let cancel = tokio_util::sync::CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, stopping after the current run");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, stopping after the current run");
            }
        }

        signal_cancel.cancel();
    });

    migratoor::driver::run(cfg, cancel).await?;

    tracing::info!("migratoor stopped");

    Ok(())
}
