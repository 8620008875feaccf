pub mod mlflow_target;
pub mod snapshot;
pub mod writer;

use std::collections::BTreeMap;

use anyhow::Result;

use crate::metric::{MetricBatch, MetricKind};

/// Marks an experiment as created by (or adopted into) a migration.
pub const MIGRATION_TAG: &str = "migrate_from_wandb_project";
/// Records the source project an experiment was migrated from.
pub const PROJECT_NAME_TAG: &str = "wandb_project_name";
/// Marks an experiment that is dual-written from the source side.
pub const DUAL_WRITE_TAG: &str = "dual_write_mlflow_wandb";
/// Completion marker: present and true only after a run fully migrated.
pub const COMPLETE_TAG: &str = "wandb_migration_complete";
/// The source run's stable identifier.
pub const RUN_ID_TAG: &str = "wandb_run_id";
/// The source run's display name.
pub const RUN_NAME_TAG: &str = "wandb_run_name";
/// The source run's group, when it has one.
pub const RUN_GROUP_TAG: &str = "run_group";
/// Marks a destination run that stands in for a source group. Parent
/// runs hold no metric data of their own.
pub const GROUP_PARENT_TAG: &str = "wandb_group_parent";
/// The destination's own nesting convention: a child run points at its
/// parent through this tag.
pub const PARENT_RUN_ID_TAG: &str = "mlflow.parentRunId";
/// Canonical boolean tag value.
pub const TAG_TRUE: &str = "True";

/// One open destination run.
///
/// Exactly one target is open per run; the two implementations (network
/// and snapshot) satisfy the same contract so everything downstream of
/// target selection is branch-free. `finalize` is the only way to set the
/// completion marker; early exits leave the run unmarked so a later
/// crash-resume reaps it.
pub trait RunTarget: Send {
    /// Appends one bounded batch. Submission order per run is preserved.
    fn log_metrics(
        &mut self,
        kind: MetricKind,
        batch: MetricBatch,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn log_params(
        &mut self,
        params: &BTreeMap<String, String>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn set_tags(
        &mut self,
        tags: &[(String, String)],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Blocks until every previously submitted write has landed (or is
    /// reported failed).
    fn flush(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Flushes, sets the completion marker and closes the run.
    fn finalize(self) -> impl std::future::Future<Output = Result<()>> + Send;
}
