use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::batch::BatchAccumulator;
use crate::config::Config;
use crate::convert::metrics::MetricExcludes;
use crate::convert::params::convert_config;
use crate::dest::mlflow_target::MlflowTarget;
use crate::dest::snapshot::{read_params, read_tags, SnapshotTarget};
use crate::dest::{RunTarget, COMPLETE_TAG, RUN_GROUP_TAG, RUN_ID_TAG, RUN_NAME_TAG};
use crate::error::MigrationError;
use crate::metric::{MetricKind, Row, RunDescriptor};
use crate::mlflow::{MlflowApi, MlflowService};
use crate::recover::{recover_mlflow_experiment, recover_snapshot_experiment};
use crate::resolve::{resolve_mlflow_experiment, resolve_snapshot_experiment, GroupParents};
use crate::source::replay::ReplaySource;
use crate::source::{LiveMetricSource, LiveSystemSource, RecordSource};
use crate::wandb::{RunReader, WandbApi};

/// How often the progress reporter logs the write-queue depth.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Per-migration outcome counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationSummary {
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Per-stream conversion counters, threaded back to the caller instead
/// of any process-wide tally.
#[derive(Debug, Default, Clone, Copy)]
struct PumpStats {
    records: usize,
    batches: usize,
}

/// Run-name allow-list: regex patterns anchored at the start of the name.
pub struct RunFilter {
    patterns: Vec<Regex>,
}

impl RunFilter {
    pub fn new(allowlist: &[String]) -> Result<Self, MigrationError> {
        let mut patterns = Vec::with_capacity(allowlist.len());
        for pattern in allowlist {
            let re = Regex::new(&format!("^(?:{pattern})")).map_err(|err| {
                MigrationError::Config(format!("invalid run allow-list pattern {pattern:?}: {err}"))
            })?;
            patterns.push(re);
        }
        Ok(Self { patterns })
    }

    /// An empty allow-list admits every run.
    pub fn matches(&self, run_name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|re| re.is_match(run_name))
    }
}

/// Whether a source run already dual-writes to the destination.
///
/// Detection looks for a destination experiment id in the run config or
/// a destination logger entry. Partially malformed config (a `loggers`
/// value that is not a mapping) conservatively counts as not
/// dual-writing.
fn is_dual_writing(config: &Row) -> bool {
    if config.contains_key("mlflow_experiment_id") {
        return true;
    }
    config
        .get("loggers")
        .and_then(|value| value.as_object())
        .map(|loggers| loggers.contains_key("mlflow"))
        .unwrap_or(false)
}

/// Drains one record source through the accumulator into the target.
///
/// Every returned batch is written before the next candidate is pulled,
/// and the final remainder flush is unconditional.
async fn pump<Src, T>(source: &mut Src, target: &mut T, kind: MetricKind) -> Result<PumpStats>
where
    Src: RecordSource,
    T: RunTarget,
{
    let mut accumulator = BatchAccumulator::default();
    let mut stats = PumpStats::default();

    while let Some(candidate) = source.next_candidate().await? {
        stats.records += candidate.len();
        for batch in accumulator.append(candidate) {
            stats.batches += 1;
            target.log_metrics(kind, batch).await?;
        }
    }

    let remainder = accumulator.finish();
    if !remainder.is_empty() {
        stats.batches += 1;
    }
    target.log_metrics(kind, remainder).await?;

    Ok(stats)
}

/// Converts one source run into an open target: tags, config params,
/// system telemetry, experiment metrics, then the finalize barrier that
/// sets the completion marker.
async fn migrate_run_records<R, T>(
    reader: &R,
    run: &RunDescriptor,
    config: &Row,
    excludes: &MetricExcludes,
    mut target: T,
) -> Result<()>
where
    R: RunReader,
    T: RunTarget,
{
    let mut tags = vec![
        (RUN_ID_TAG.to_string(), run.id.clone()),
        (RUN_NAME_TAG.to_string(), run.name.clone()),
    ];
    if let Some(group) = &run.group {
        tags.push((RUN_GROUP_TAG.to_string(), group.clone()));
    }
    target.set_tags(&tags).await?;

    target.log_params(&convert_config(config)).await?;

    let mut system = LiveSystemSource::new(reader, &run.id);
    let system_stats = pump(&mut system, &mut target, MetricKind::System).await?;
    debug!(
        run = %run.id,
        records = system_stats.records,
        batches = system_stats.batches,
        "converted system telemetry",
    );

    let mut metrics = LiveMetricSource::open(reader, &run.id, excludes).await?;
    let metric_stats = pump(&mut metrics, &mut target, MetricKind::Experiment).await?;
    debug!(
        run = %run.id,
        records = metric_stats.records,
        batches = metric_stats.batches,
        "converted experiment metrics",
    );

    target.finalize().await
}

/// Periodically logs how many submitted batches are still waiting to be
/// written, so a stalled destination is visible in the logs.
async fn progress_reporter(pending: Arc<AtomicUsize>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                info!(
                    pending = pending.load(Ordering::Relaxed),
                    "metric batches waiting to be written",
                );
            }
        }
    }
}

fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<MigrationError>().is_some()
}

/// Live migration: read from the source service, write to the
/// destination service, one run at a time.
pub async fn live_migration<R, S>(
    cfg: &Config,
    reader: &R,
    service: S,
    cancel: CancellationToken,
) -> Result<MigrationSummary>
where
    R: RunReader,
    S: MlflowService + Clone + Send + Sync + 'static,
{
    let (experiment_id, mut existing) = if cfg.resume_from_crash {
        recover_mlflow_experiment(&service, cfg.experiment_name()).await?
    } else {
        let experiment_id = resolve_mlflow_experiment(
            &service,
            &cfg.project,
            cfg.experiment_name(),
            cfg.skip_existing,
            cfg.dual_write_experiment_id.as_deref(),
        )
        .await?;
        (experiment_id, HashSet::new())
    };

    if cfg.skip_existing {
        for run in service.search_runs(&experiment_id, None).await? {
            if let Some(source_id) = run.tags.get(RUN_ID_TAG) {
                existing.insert(source_id.clone());
            }
        }
    }

    let filter = RunFilter::new(&cfg.run_allowlist)?;
    let excludes = MetricExcludes::new(&cfg.exclude_metrics);
    let pending = Arc::new(AtomicUsize::new(0));
    let mut parents = GroupParents::new();

    let reporter_cancel = cancel.child_token();
    let reporter = tokio::spawn(progress_reporter(
        Arc::clone(&pending),
        reporter_cancel.clone(),
    ));

    let runs = reader.list_runs().await.context("listing source runs")?;
    info!(runs = runs.len(), experiment_id = %experiment_id, "starting live migration");

    let mut summary = MigrationSummary::default();

    for run in &runs {
        if cancel.is_cancelled() {
            info!("interrupted, stopping between runs");
            break;
        }

        if existing.contains(&run.id) {
            info!(run = %run.id, name = %run.name, "skipping run, already migrated");
            summary.skipped += 1;
            continue;
        }
        if !filter.matches(&run.name) {
            info!(run = %run.id, name = %run.name, "skipping run, not in allow-list");
            summary.skipped += 1;
            continue;
        }

        let outcome = migrate_one_live_run(
            cfg,
            reader,
            &service,
            &experiment_id,
            run,
            &excludes,
            &mut parents,
            &pending,
        )
        .await;

        match outcome {
            Ok(true) => summary.migrated += 1,
            Ok(false) => summary.skipped += 1,
            Err(err) if is_fatal(&err) => {
                reporter_cancel.cancel();
                let _ = reporter.await;
                return Err(err);
            }
            Err(err) => {
                error!(run = %run.id, error = %err, "run migration failed, continuing");
                summary.failed += 1;
            }
        }
    }

    reporter_cancel.cancel();
    let _ = reporter.await;

    Ok(summary)
}

/// Returns Ok(true) when the run migrated, Ok(false) when it was skipped
/// by the dual-write rule.
async fn migrate_one_live_run<R, S>(
    cfg: &Config,
    reader: &R,
    service: &S,
    experiment_id: &str,
    run: &RunDescriptor,
    excludes: &MetricExcludes,
    parents: &mut GroupParents,
    pending: &Arc<AtomicUsize>,
) -> Result<bool>
where
    R: RunReader,
    S: MlflowService + Clone + Send + Sync + 'static,
{
    let config = reader
        .read_config(&run.id)
        .await
        .with_context(|| format!("reading config of {}", run.id))?;

    if cfg.skip_dual_write_runs && is_dual_writing(&config) {
        info!(run = %run.id, name = %run.name, "skipping run, already dual-writing");
        return Ok(false);
    }

    let parent_run_id = match &run.group {
        Some(group) if cfg.nested_runs => {
            Some(parents.resolve(service, experiment_id, group).await?)
        }
        _ => None,
    };

    info!(run = %run.id, name = %run.name, "migrating run");
    let started = Instant::now();

    let target = MlflowTarget::open(
        service.clone(),
        experiment_id,
        run,
        parent_run_id.as_deref(),
        Arc::clone(pending),
    )
    .await?;

    migrate_run_records(reader, run, &config, excludes, target).await?;

    info!(
        run = %run.id,
        name = %run.name,
        elapsed = format_args!("{:.2}s", started.elapsed().as_secs_f64()),
        "run migrated",
    );
    Ok(true)
}

/// Dry-run migration: read from the source service, persist converted
/// records to local snapshot directories for later replay.
pub async fn snapshot_migration<R>(
    cfg: &Config,
    reader: &R,
    cancel: CancellationToken,
) -> Result<MigrationSummary>
where
    R: RunReader,
{
    let save_dir = cfg
        .save_dir
        .as_ref()
        .expect("validated: save_dir present in snapshot mode");
    let reuse = cfg.skip_existing || cfg.resume_from_crash;
    let experiment_dir =
        resolve_snapshot_experiment(save_dir, &cfg.project, cfg.experiment_name(), reuse)?;

    let mut existing = if cfg.resume_from_crash {
        recover_snapshot_experiment(&experiment_dir)?
    } else {
        HashSet::new()
    };
    if cfg.skip_existing {
        for entry in std::fs::read_dir(&experiment_dir)
            .with_context(|| format!("listing {}", experiment_dir.display()))?
        {
            let entry = entry?;
            if entry.path().is_dir() {
                existing.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }

    let filter = RunFilter::new(&cfg.run_allowlist)?;
    let excludes = MetricExcludes::new(&cfg.exclude_metrics);

    let runs = reader.list_runs().await.context("listing source runs")?;
    info!(
        runs = runs.len(),
        dir = %experiment_dir.display(),
        "starting snapshot migration",
    );

    let mut summary = MigrationSummary::default();

    for run in &runs {
        if cancel.is_cancelled() {
            info!("interrupted, stopping between runs");
            break;
        }

        if existing.contains(&run.id) {
            info!(run = %run.id, "skipping run, snapshot already present");
            summary.skipped += 1;
            continue;
        }
        if !filter.matches(&run.name) {
            summary.skipped += 1;
            continue;
        }

        let config = match reader.read_config(&run.id).await {
            Ok(config) => config,
            Err(err) => {
                error!(run = %run.id, error = %err, "reading run config failed, continuing");
                summary.failed += 1;
                continue;
            }
        };
        if cfg.skip_dual_write_runs && is_dual_writing(&config) {
            info!(run = %run.id, "skipping run, already dual-writing");
            summary.skipped += 1;
            continue;
        }

        info!(run = %run.id, name = %run.name, "snapshotting run");
        let target = SnapshotTarget::open(&experiment_dir, &run.id)?;
        match migrate_run_records(reader, run, &config, &excludes, target).await {
            Ok(()) => summary.migrated += 1,
            Err(err) if is_fatal(&err) => return Err(err),
            Err(err) => {
                error!(run = %run.id, error = %err, "run snapshot failed, continuing");
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

/// Replay migration: read previously persisted snapshot directories and
/// write them to the destination service, optionally with a worker pool.
///
/// Distinct runs are fully independent (no run is ever split across two
/// workers), so the pool shares nothing but the resolved experiment.
pub async fn replay_migration<S>(
    cfg: &Config,
    service: S,
    cancel: CancellationToken,
) -> Result<MigrationSummary>
where
    S: MlflowService + Clone + Send + Sync + 'static,
{
    let save_dir = cfg
        .save_dir
        .as_ref()
        .expect("validated: save_dir present in replay mode");
    let experiment_dir = save_dir.join(cfg.experiment_name());
    if !experiment_dir.is_dir() {
        return Err(
            MigrationError::ExperimentNotFound(experiment_dir.display().to_string()).into(),
        );
    }

    let (experiment_id, finished) = if cfg.resume_from_crash {
        recover_mlflow_experiment(&service, cfg.experiment_name()).await?
    } else {
        let experiment_id = resolve_mlflow_experiment(
            &service,
            &cfg.project,
            cfg.experiment_name(),
            cfg.skip_existing,
            cfg.dual_write_experiment_id.as_deref(),
        )
        .await?;
        (experiment_id, HashSet::new())
    };

    let filter = RunFilter::new(&cfg.run_allowlist)?;
    let pending = Arc::new(AtomicUsize::new(0));

    let reporter_cancel = cancel.child_token();
    let reporter = tokio::spawn(progress_reporter(
        Arc::clone(&pending),
        reporter_cancel.clone(),
    ));

    let mut run_dirs: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(&experiment_dir)
        .with_context(|| format!("listing {}", experiment_dir.display()))?
    {
        let entry = entry?;
        if entry.path().is_dir() {
            run_dirs.push(entry.path());
        }
    }
    run_dirs.sort();

    // Parent runs are resolved up front, single-threaded, so workers
    // share nothing but a read-only map.
    let mut parent_by_group: HashMap<String, String> = HashMap::new();
    if cfg.nested_runs {
        let mut parents = GroupParents::new();
        for run_dir in &run_dirs {
            if let Some(group) = read_tags(run_dir)?.get(RUN_GROUP_TAG) {
                let parent = parents.resolve(&service, &experiment_id, group).await?;
                parent_by_group.insert(group.clone(), parent);
            }
        }
    }

    info!(
        runs = run_dirs.len(),
        workers = cfg.workers,
        experiment_id = %experiment_id,
        "starting snapshot replay",
    );

    let semaphore = Arc::new(Semaphore::new(cfg.workers));
    let mut workers = JoinSet::new();
    let mut summary = MigrationSummary::default();

    for run_dir in run_dirs {
        if cancel.is_cancelled() {
            info!("interrupted, stopping between runs");
            break;
        }

        let source_run_id = run_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if finished.contains(&source_run_id) {
            info!(run = %source_run_id, "skipping run, already migrated");
            summary.skipped += 1;
            continue;
        }

        let tags = read_tags(&run_dir)?;
        let run_name = tags
            .get(RUN_NAME_TAG)
            .cloned()
            .unwrap_or_else(|| source_run_id.clone());
        if !filter.matches(&run_name) {
            summary.skipped += 1;
            continue;
        }
        let parent_run_id = tags
            .get(RUN_GROUP_TAG)
            .and_then(|group| parent_by_group.get(group))
            .cloned();

        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .context("acquiring replay worker slot")?;
        let service = service.clone();
        let experiment_id = experiment_id.clone();
        let pending = Arc::clone(&pending);

        workers.spawn(async move {
            let _permit = permit;
            let result =
                replay_run(service, &experiment_id, &run_dir, parent_run_id, pending).await;
            (source_run_id, result)
        });
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((run_id, Ok(()))) => {
                info!(run = %run_id, "run replayed");
                summary.migrated += 1;
            }
            Ok((run_id, Err(err))) => {
                error!(run = %run_id, error = %err, "run replay failed, continuing");
                summary.failed += 1;
            }
            Err(err) => {
                error!(error = %err, "replay worker panicked");
                summary.failed += 1;
            }
        }
    }

    reporter_cancel.cancel();
    let _ = reporter.await;

    Ok(summary)
}

/// Replays one run directory into a fresh destination run.
async fn replay_run<S>(
    service: S,
    experiment_id: &str,
    run_dir: &std::path::Path,
    parent_run_id: Option<String>,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    S: MlflowService + Clone + Send + Sync + 'static,
{
    let tags = read_tags(run_dir)?;
    let source_run_id = run_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let run_name = tags
        .get(RUN_NAME_TAG)
        .cloned()
        .unwrap_or_else(|| source_run_id.clone());

    let descriptor = RunDescriptor {
        id: source_run_id,
        name: run_name,
        group: tags.get(RUN_GROUP_TAG).cloned(),
        created_at: None,
    };

    let mut target = MlflowTarget::open(
        service,
        experiment_id,
        &descriptor,
        parent_run_id.as_deref(),
        pending,
    )
    .await?;

    // Re-apply the snapshot's tags, except the snapshot's own completion
    // marker: the destination run earns that only from its own finalize.
    let replay_tags: Vec<(String, String)> = tags
        .iter()
        .filter(|(key, _)| key.as_str() != COMPLETE_TAG)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    target.set_tags(&replay_tags).await?;

    target.log_params(&read_params(run_dir)?).await?;

    let mut system = ReplaySource::open(run_dir, MetricKind::System)?;
    pump(&mut system, &mut target, MetricKind::System).await?;

    let mut metrics = ReplaySource::open(run_dir, MetricKind::Experiment)?;
    pump(&mut metrics, &mut target, MetricKind::Experiment).await?;

    target.finalize().await
}

/// Entry point: validates, selects the mode, runs it to completion.
pub async fn run(cfg: Config, cancel: CancellationToken) -> Result<()> {
    cfg.validate()?;
    let started = Instant::now();

    let summary = if cfg.resume_from_dry_run {
        let service = MlflowApi::new(&cfg.mlflow_url)?;
        replay_migration(&cfg, service, cancel).await?
    } else {
        let reader = WandbApi::new(&cfg.wandb_url, &cfg.entity, &cfg.project)?;
        if cfg.dry_run {
            snapshot_migration(&cfg, &reader, cancel).await?
        } else {
            let service = MlflowApi::new(&cfg.mlflow_url)?;
            live_migration(&cfg, &reader, service, cancel).await?
        }
    };

    info!(
        project = %cfg.project,
        migrated = summary.migrated,
        skipped = summary.skipped,
        failed = summary.failed,
        elapsed = format_args!("{:.2}s", started.elapsed().as_secs_f64()),
        "migration finished",
    );

    Ok(())
}
