use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::dest::snapshot::read_tags;
use crate::dest::{COMPLETE_TAG, GROUP_PARENT_TAG, MIGRATION_TAG, RUN_ID_TAG, TAG_TRUE};
use crate::error::MigrationError;
use crate::mlflow::MlflowService;

/// Reaps crashed destination runs and reports the finished ones.
///
/// Recovery is whole-run granular: a run without the completion marker
/// crashed mid-migration and its partial data is not reusable, so it is
/// destroyed and re-migrated from scratch. Finished runs are returned as
/// source run ids so the driver can skip them entirely.
///
/// Failing to locate the migration-owned experiment is fatal: starting a
/// fresh experiment here would duplicate every finished run under a new
/// identity.
pub async fn recover_mlflow_experiment<S: MlflowService>(
    service: &S,
    experiment_name: &str,
) -> Result<(String, HashSet<String>)> {
    let candidate = format!("/{experiment_name}");
    let experiment = service
        .get_experiment_by_name(&candidate)
        .await
        .context("looking up experiment for crash recovery")?
        .filter(|experiment| experiment.tags.contains_key(MIGRATION_TAG))
        .ok_or_else(|| MigrationError::ExperimentNotFound(candidate.clone()))?;

    let runs = service
        .search_runs(&experiment.experiment_id, None)
        .await
        .context("listing runs for crash recovery")?;

    let mut finished = HashSet::new();
    let mut reaped = 0usize;

    for run in runs {
        // Group parents hold no migrated data; they are neither finished
        // source runs nor crash debris.
        if run.tags.contains_key(GROUP_PARENT_TAG) {
            continue;
        }
        if run.tags.get(COMPLETE_TAG).map(String::as_str) == Some(TAG_TRUE) {
            match run.tags.get(RUN_ID_TAG) {
                Some(source_id) => {
                    finished.insert(source_id.clone());
                }
                None => {
                    warn!(
                        run_id = %run.run_id,
                        "finished run carries no source id tag, cannot skip it",
                    );
                }
            }
        } else {
            info!(
                run_id = %run.run_id,
                "deleting run left unfinished by a previous attempt",
            );
            service
                .delete_run(&run.run_id)
                .await
                .with_context(|| format!("deleting crashed run {}", run.run_id))?;
            reaped += 1;
        }
    }

    info!(
        experiment_id = %experiment.experiment_id,
        finished = finished.len(),
        reaped,
        "crash recovery complete",
    );

    Ok((experiment.experiment_id, finished))
}

/// Snapshot-mode recovery over an experiment directory.
///
/// Same protocol against the local layout: run directories without the
/// completion marker in `tags.csv` are removed wholesale.
pub fn recover_snapshot_experiment(experiment_dir: &Path) -> Result<HashSet<String>> {
    if !experiment_dir.is_dir() {
        return Err(
            MigrationError::ExperimentNotFound(experiment_dir.display().to_string()).into(),
        );
    }

    let mut finished = HashSet::new();
    let mut reaped = 0usize;

    for entry in fs::read_dir(experiment_dir)
        .with_context(|| format!("listing {}", experiment_dir.display()))?
    {
        let entry = entry.with_context(|| format!("listing {}", experiment_dir.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let tags = read_tags(&path)?;
        if tags.get(COMPLETE_TAG).map(String::as_str) == Some(TAG_TRUE) {
            finished.insert(entry.file_name().to_string_lossy().into_owned());
        } else {
            info!(
                dir = %path.display(),
                "removing run dir left unfinished by a previous attempt",
            );
            fs::remove_dir_all(&path)
                .with_context(|| format!("removing {}", path.display()))?;
            reaped += 1;
        }
    }

    info!(
        dir = %experiment_dir.display(),
        finished = finished.len(),
        reaped,
        "snapshot crash recovery complete",
    );

    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dest::snapshot::write_tags;
    use crate::mlflow::testing::FakeMlflow;
    use crate::mlflow::MlflowService as _;

    #[tokio::test]
    async fn test_reaps_unfinished_runs_and_reports_finished() {
        let service = FakeMlflow::default();
        let experiment_id =
            service.seed_experiment("/proj", &[(MIGRATION_TAG, TAG_TRUE)]);

        let finished_run = service
            .create_run(
                &experiment_id,
                "done",
                None,
                &[(RUN_ID_TAG.to_string(), "w1".to_string())],
            )
            .await
            .expect("create");
        service
            .set_tag(&finished_run, COMPLETE_TAG, TAG_TRUE)
            .await
            .expect("tag");

        let crashed_run = service
            .create_run(
                &experiment_id,
                "crashed",
                None,
                &[(RUN_ID_TAG.to_string(), "w2".to_string())],
            )
            .await
            .expect("create");

        let (resolved, finished) = recover_mlflow_experiment(&service, "proj")
            .await
            .expect("recover");

        assert_eq!(resolved, experiment_id);
        assert_eq!(finished, HashSet::from(["w1".to_string()]));

        let state = service.state.lock().expect("lock");
        assert!(state.run(&crashed_run).expect("run").deleted);
        assert!(!state.run(&finished_run).expect("run").deleted);
    }

    #[tokio::test]
    async fn test_group_parents_survive_recovery() {
        let service = FakeMlflow::default();
        let experiment_id =
            service.seed_experiment("/proj", &[(MIGRATION_TAG, TAG_TRUE)]);

        let parent = service
            .create_run(
                &experiment_id,
                "sweep-1",
                None,
                &[
                    (GROUP_PARENT_TAG.to_string(), TAG_TRUE.to_string()),
                    (COMPLETE_TAG.to_string(), TAG_TRUE.to_string()),
                ],
            )
            .await
            .expect("parent");

        let (_, finished) = recover_mlflow_experiment(&service, "proj")
            .await
            .expect("recover");

        // Not reported as a finished source run, not reaped either.
        assert!(finished.is_empty());
        let state = service.state.lock().expect("lock");
        assert!(!state.run(&parent).expect("parent").deleted);
    }

    #[tokio::test]
    async fn test_missing_experiment_is_fatal() {
        let service = FakeMlflow::default();
        let err = recover_mlflow_experiment(&service, "proj")
            .await
            .expect_err("missing");
        assert!(err.to_string().contains("resuming from a crash"));
    }

    #[tokio::test]
    async fn test_unowned_experiment_is_fatal() {
        // Same name, but not created by a migration: never adopt it
        // during recovery.
        let service = FakeMlflow::default();
        service.seed_experiment("/proj", &[]);
        assert!(recover_mlflow_experiment(&service, "proj").await.is_err());
    }

    #[test]
    fn test_snapshot_recovery_removes_unfinished_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");

        let done = dir.path().join("w1");
        std::fs::create_dir(&done).expect("mkdir");
        write_tags(
            &done,
            &[(COMPLETE_TAG.to_string(), TAG_TRUE.to_string())],
        )
        .expect("tags");
        // Unfinished run with nested metric files.
        let crashed = dir.path().join("w2");
        std::fs::create_dir_all(crashed.join("metrics/eval")).expect("mkdir");
        std::fs::write(crashed.join("metrics/eval/acc.csv"), "1,0,0\n").expect("write");

        let finished = recover_snapshot_experiment(dir.path()).expect("recover");
        assert_eq!(finished, HashSet::from(["w1".to_string()]));
        assert!(done.is_dir());
        assert!(!crashed.exists());
    }

    #[test]
    fn test_snapshot_recovery_missing_dir_is_fatal() {
        let err = recover_snapshot_experiment(Path::new("/no/such/dir")).expect_err("missing");
        assert!(err.to_string().contains("resuming from a crash"));
    }
}
