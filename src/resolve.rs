use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::dest::snapshot::write_tags;
use crate::dest::{
    COMPLETE_TAG, DUAL_WRITE_TAG, GROUP_PARENT_TAG, MIGRATION_TAG, PROJECT_NAME_TAG,
    RUN_GROUP_TAG, TAG_TRUE,
};
use crate::error::MigrationError;
use crate::mlflow::MlflowService;

/// Workspace experiment names are rooted at `/`.
fn workspace_name(name: &str) -> String {
    format!("/{name}")
}

fn migration_tags(project: &str) -> Vec<(String, String)> {
    vec![
        (MIGRATION_TAG.to_string(), TAG_TRUE.to_string()),
        (PROJECT_NAME_TAG.to_string(), project.to_string()),
    ]
}

/// Resolves the destination experiment for a source project.
///
/// The resolution order:
/// 1. An externally supplied dual-write experiment id is reused
///    unconditionally and tagged as such, with no name search.
/// 2. An existing experiment of the candidate name is reused when it is
///    migration-owned, or when `skip_existing` asks us to adopt it
///    (retro-tagging it so the next resume recognizes it).
/// 3. An existing unrelated experiment is never overwritten: a fresh one
///    is created under the name plus a random suffix.
/// 4. Otherwise a fresh experiment is created and tagged.
pub async fn resolve_mlflow_experiment<S: MlflowService>(
    service: &S,
    project: &str,
    experiment_name: &str,
    skip_existing: bool,
    dual_write_experiment_id: Option<&str>,
) -> Result<String> {
    if let Some(experiment_id) = dual_write_experiment_id {
        let mut tags = migration_tags(project);
        tags.push((DUAL_WRITE_TAG.to_string(), TAG_TRUE.to_string()));
        for (key, value) in &tags {
            service
                .set_experiment_tag(experiment_id, key, value)
                .await
                .context("tagging dual-write experiment")?;
        }
        info!(experiment_id, "reusing dual-write experiment");
        return Ok(experiment_id.to_string());
    }

    let candidate = workspace_name(experiment_name);
    let existing = service
        .get_experiment_by_name(&candidate)
        .await
        .context("looking up destination experiment")?;

    let experiment_id = match existing {
        Some(experiment) if experiment.tags.contains_key(MIGRATION_TAG) => {
            info!(
                experiment_id = %experiment.experiment_id,
                name = %candidate,
                "reusing migration-owned experiment",
            );
            experiment.experiment_id
        }
        Some(experiment) if skip_existing => {
            // Assume an external dual-write created it; adopt and tag it.
            for (key, value) in migration_tags(project) {
                service
                    .set_experiment_tag(&experiment.experiment_id, &key, &value)
                    .await
                    .context("adopting existing experiment")?;
            }
            info!(
                experiment_id = %experiment.experiment_id,
                name = %candidate,
                "adopted existing experiment",
            );
            experiment.experiment_id
        }
        Some(_) => {
            // The name belongs to an unrelated experiment. Disambiguate
            // rather than writing into it.
            let suffix = Uuid::new_v4().simple().to_string();
            let disambiguated = format!("{candidate}_{}", &suffix[..6]);
            let experiment_id = service
                .create_experiment(&disambiguated, &migration_tags(project))
                .await
                .context("creating disambiguated experiment")?;
            info!(
                experiment_id = %experiment_id,
                name = %disambiguated,
                "name was taken, created experiment with suffix",
            );
            experiment_id
        }
        None => {
            let experiment_id = service
                .create_experiment(&candidate, &migration_tags(project))
                .await
                .context("creating destination experiment")?;
            info!(experiment_id = %experiment_id, name = %candidate, "created experiment");
            experiment_id
        }
    };

    Ok(experiment_id)
}

/// Resolves the snapshot experiment directory.
///
/// The save dir must already exist (validated at startup); the
/// experiment directory beneath it is created fresh and tagged. An
/// existing directory is only acceptable when resuming or adopting.
pub fn resolve_snapshot_experiment(
    save_dir: &Path,
    project: &str,
    experiment_name: &str,
    reuse_existing: bool,
) -> Result<PathBuf> {
    let experiment_dir = save_dir.join(experiment_name);

    if experiment_dir.exists() {
        if reuse_existing {
            info!(dir = %experiment_dir.display(), "reusing snapshot experiment dir");
            return Ok(experiment_dir);
        }
        return Err(MigrationError::TargetExists(experiment_dir).into());
    }

    std::fs::create_dir(&experiment_dir)
        .with_context(|| format!("creating {}", experiment_dir.display()))?;
    write_tags(&experiment_dir, &migration_tags(project))?;
    info!(dir = %experiment_dir.display(), "created snapshot experiment dir");

    Ok(experiment_dir)
}

/// Resolves destination parent runs for source run groups.
///
/// Each distinct group maps onto one parent run in the experiment, named
/// after the group and marked with [`GROUP_PARENT_TAG`]. Resolution is
/// memoized per process and de-duplicated across restarts by searching
/// for the marker tag, so a crash-resume reattaches children to the
/// parent created by the previous attempt. Parent runs carry the
/// completion marker from birth; they hold no data that a crash could
/// leave half-written.
#[derive(Debug, Default)]
pub struct GroupParents {
    by_group: HashMap<String, String>,
}

impl GroupParents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the parent run id for a group, creating it on first use.
    pub async fn resolve<S: MlflowService>(
        &mut self,
        service: &S,
        experiment_id: &str,
        group: &str,
    ) -> Result<String> {
        if let Some(run_id) = self.by_group.get(group) {
            return Ok(run_id.clone());
        }

        let existing = service
            .search_runs(experiment_id, None)
            .await
            .context("searching for group parent run")?
            .into_iter()
            .find(|run| {
                run.tags.contains_key(GROUP_PARENT_TAG)
                    && run.tags.get(RUN_GROUP_TAG).map(String::as_str) == Some(group)
            });

        let run_id = match existing {
            Some(run) => {
                info!(group, run_id = %run.run_id, "reusing group parent run");
                run.run_id
            }
            None => {
                let tags = vec![
                    (RUN_GROUP_TAG.to_string(), group.to_string()),
                    (GROUP_PARENT_TAG.to_string(), TAG_TRUE.to_string()),
                    (COMPLETE_TAG.to_string(), TAG_TRUE.to_string()),
                ];
                let run_id = service
                    .create_run(experiment_id, group, None, &tags)
                    .await
                    .with_context(|| format!("creating parent run for group {group}"))?;
                info!(group, run_id = %run_id, "created group parent run");
                run_id
            }
        };

        self.by_group.insert(group.to_string(), run_id.clone());
        Ok(run_id)
    }
}
