use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::dest::writer::RunWriter;
use crate::dest::{RunTarget, COMPLETE_TAG, PARENT_RUN_ID_TAG, RUN_ID_TAG, TAG_TRUE};
use crate::metric::{MetricBatch, MetricKind, RunDescriptor};
use crate::mlflow::{MlflowService, RunStatus, MAX_PARAMS_PER_BATCH};

/// Network destination: one live run on the tracking server.
///
/// Metric batches go through the per-run ordered write queue; params and
/// tags are low-volume and logged directly.
pub struct MlflowTarget<S: MlflowService> {
    service: S,
    run_id: String,
    writer: RunWriter,
}

impl<S> MlflowTarget<S>
where
    S: MlflowService + Clone + Send + Sync + 'static,
{
    /// Creates the destination run and opens its write queue.
    ///
    /// The run is named after the source run's display name but tagged
    /// with its stable identifier; ids, not names, key crash recovery.
    /// A parent run id nests the run beneath its group's parent.
    pub async fn open(
        service: S,
        experiment_id: &str,
        run: &RunDescriptor,
        parent_run_id: Option<&str>,
        pending: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let mut tags = vec![(RUN_ID_TAG.to_string(), run.id.clone())];
        if let Some(parent) = parent_run_id {
            tags.push((PARENT_RUN_ID_TAG.to_string(), parent.to_string()));
        }
        let run_id = service
            .create_run(experiment_id, &run.name, run.created_at, &tags)
            .await
            .with_context(|| format!("creating destination run for {}", run.id))?;

        info!(
            source_run = %run.id,
            run_name = %run.name,
            mlflow_run_id = %run_id,
            "created destination run",
        );

        let writer = RunWriter::spawn(service.clone(), run_id.clone(), pending);

        Ok(Self {
            service,
            run_id,
            writer,
        })
    }

    /// The destination run id.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl<S> RunTarget for MlflowTarget<S>
where
    S: MlflowService + Clone + Send + Sync + 'static,
{
    async fn log_metrics(&mut self, _kind: MetricKind, batch: MetricBatch) -> Result<()> {
        // Both streams share the batched endpoint; system metric keys are
        // already namespaced.
        self.writer.submit(batch).await
    }

    async fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<()> {
        let entries: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for chunk in entries.chunks(MAX_PARAMS_PER_BATCH) {
            self.service
                .log_params(&self.run_id, chunk)
                .await
                .context("logging params")?;
        }
        Ok(())
    }

    async fn set_tags(&mut self, tags: &[(String, String)]) -> Result<()> {
        for (key, value) in tags {
            self.service
                .set_tag(&self.run_id, key, value)
                .await
                .with_context(|| format!("setting tag {key}"))?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    async fn finalize(self) -> Result<()> {
        // The barrier must come first: the completion marker may only be
        // observable after every metric write has landed.
        self.writer.flush().await?;

        self.service
            .set_tag(&self.run_id, COMPLETE_TAG, TAG_TRUE)
            .await
            .context("setting completion marker")?;

        self.service
            .update_run_status(
                &self.run_id,
                RunStatus::Finished,
                Some(Utc::now().timestamp_millis()),
            )
            .await
            .context("closing destination run")?;

        self.writer.shutdown().await
    }
}
