use std::path::PathBuf;

use crate::error::MigrationError;

/// Hard per-call limit of the destination's batched metric endpoint.
///
/// No batch handed to a writer may ever exceed this many points.
pub const MAX_METRICS_PER_BATCH: usize = 1000;

/// How many runs a replay worker pool may process concurrently by default.
pub const DEFAULT_WORKERS: usize = 1;

/// Top-level migration configuration, assembled from CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source project to migrate.
    pub project: String,

    /// Source entity (team/user) owning the project.
    pub entity: String,

    /// Destination experiment name. Defaults to the project name.
    pub experiment_name: Option<String>,

    /// Only migrate runs whose name matches one of these patterns
    /// (regex, anchored at the start). Empty means all runs.
    pub run_allowlist: Vec<String>,

    /// Metric keys to skip, exact or regex, on top of the built-in
    /// bookkeeping exclusions.
    pub exclude_metrics: Vec<String>,

    /// Write converted records to local snapshot files instead of the
    /// destination service.
    pub dry_run: bool,

    /// Directory holding snapshot experiments (required for `dry_run`
    /// and `resume_from_dry_run`). Must already exist.
    pub save_dir: Option<PathBuf>,

    /// Replay previously written snapshot files into the destination.
    pub resume_from_dry_run: bool,

    /// Reap unfinished destination runs from a crashed attempt and skip
    /// the finished ones.
    pub resume_from_crash: bool,

    /// Reuse a destination experiment of the same name even when it was
    /// not created by a migration, and skip runs that already exist in it.
    pub skip_existing: bool,

    /// Skip source runs that already dual-write to the destination.
    pub skip_dual_write_runs: bool,

    /// Represent source run groups as nested destination runs: one
    /// parent run per group, children attached beneath it.
    pub nested_runs: bool,

    /// Worker pool size for snapshot replay. Live migration is always
    /// sequential; the destination write path serializes better that way.
    pub workers: usize,

    /// Externally managed destination experiment id to write into
    /// unconditionally (dual-write bypass). Skips duplicate-name search.
    pub dual_write_experiment_id: Option<String>,

    /// Source service base URL.
    pub wandb_url: String,

    /// Destination tracking server base URL.
    pub mlflow_url: String,
}

impl Config {
    /// Fails fast on conflicting flags and missing directories, before any
    /// run is touched.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.project.is_empty() {
            return Err(MigrationError::Config("--project is required".into()));
        }

        if self.dry_run && self.resume_from_dry_run {
            return Err(MigrationError::Config(
                "--dry-run and --resume-from-dry-run are mutually exclusive".into(),
            ));
        }

        if self.dry_run && self.dual_write_experiment_id.is_some() {
            return Err(MigrationError::Config(
                "--dual-write-experiment-id has no effect with --dry-run".into(),
            ));
        }

        if self.dry_run || self.resume_from_dry_run {
            let dir = self.save_dir.as_ref().ok_or_else(|| {
                MigrationError::Config(
                    "--save-dir is required with --dry-run or --resume-from-dry-run".into(),
                )
            })?;
            if !dir.is_dir() {
                return Err(MigrationError::Config(format!(
                    "save dir {} does not exist, create it first",
                    dir.display()
                )));
            }
        }

        if self.workers == 0 {
            return Err(MigrationError::Config("--workers must be positive".into()));
        }

        Ok(())
    }

    /// The destination experiment name candidate: explicit override or the
    /// source project name.
    pub fn experiment_name(&self) -> &str {
        self.experiment_name.as_deref().unwrap_or(&self.project)
    }
}
