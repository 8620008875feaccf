use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::metric::MetricPoint;

/// Hard per-call limit of the params portion of a batched logging call.
pub const MAX_PARAMS_PER_BATCH: usize = 100;

/// Page size used when searching runs.
const SEARCH_PAGE_SIZE: usize = 1000;

/// A destination experiment, as returned by the tracking server.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub tags: HashMap<String, String>,
}

/// A destination run: identifier plus its tags.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: String,
    pub tags: HashMap<String, String>,
}

/// Terminal run status set when a run is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }
}

/// Write access to the destination tracking service.
///
/// `log_batch` is the only high-volume call; everything else happens a
/// handful of times per run. Ordering across calls is the caller's
/// responsibility.
pub trait MlflowService: Send + Sync {
    fn get_experiment_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Experiment>>> + Send;

    /// Creates an experiment and returns its id.
    fn create_experiment(
        &self,
        name: &str,
        tags: &[(String, String)],
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    fn set_experiment_tag(
        &self,
        experiment_id: &str,
        key: &str,
        value: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Creates a run and returns its id.
    fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        start_time: Option<i64>,
        tags: &[(String, String)],
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Appends up to 1000 metric points in one call.
    fn log_batch(
        &self,
        run_id: &str,
        metrics: &[MetricPoint],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Logs up to [`MAX_PARAMS_PER_BATCH`] params in one call.
    fn log_params(
        &self,
        run_id: &str,
        params: &[(String, String)],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn set_tag(
        &self,
        run_id: &str,
        key: &str,
        value: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns every run in the experiment matching the filter, draining
    /// pagination.
    fn search_runs(
        &self,
        experiment_id: &str,
        filter: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<RunInfo>>> + Send;

    fn delete_run(&self, run_id: &str)
        -> impl std::future::Future<Output = Result<()>> + Send;

    fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<i64>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[derive(Debug, Serialize)]
struct TagDto<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentDto {
    experiment_id: String,
    name: String,
    #[serde(default)]
    tags: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: ExperimentDto,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: RunDto,
}

#[derive(Debug, Deserialize)]
struct RunDto {
    info: RunInfoDto,
    #[serde(default)]
    data: Option<RunDataDto>,
}

#[derive(Debug, Deserialize)]
struct RunInfoDto {
    run_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct RunDataDto {
    #[serde(default)]
    tags: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchRunsResponse {
    #[serde(default)]
    runs: Vec<RunDto>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
}

/// HTTP client for the MLflow REST API 2.0.
///
/// Cheap to clone; every replay worker and per-run writer task holds its
/// own copy over the shared connection pool.
#[derive(Clone)]
pub struct MlflowApi {
    http: reqwest::Client,
    base_url: String,
}

impl MlflowApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building mlflow HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/mlflow/{endpoint}", self.base_url)
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .http
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await
            .with_context(|| format!("posting to {endpoint}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from {endpoint}: {body}");
        }

        response
            .json()
            .await
            .with_context(|| format!("decoding response from {endpoint}"))
    }

    /// POST for endpoints whose success response body carries nothing we
    /// need.
    async fn post_ack<B: Serialize>(&self, endpoint: &str, body: &B) -> Result<()> {
        let response = self
            .http
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await
            .with_context(|| format!("posting to {endpoint}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from {endpoint}: {body}");
        }

        Ok(())
    }

    fn tag_dtos(tags: &[(String, String)]) -> Vec<TagDto<'_>> {
        tags.iter()
            .map(|(key, value)| TagDto { key, value })
            .collect()
    }
}

fn tags_to_map(tags: Vec<TagEntry>) -> HashMap<String, String> {
    tags.into_iter().map(|t| (t.key, t.value)).collect()
}

impl MlflowService for MlflowApi {
    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        let response = self
            .http
            .get(self.url("experiments/get-by-name"))
            .query(&[("experiment_name", name)])
            .send()
            .await
            .context("requesting experiment by name")?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // Distinguish a missing experiment from a missing endpoint.
            let error: ApiError = response.json().await.unwrap_or(ApiError {
                error_code: String::new(),
            });
            if error.error_code == "RESOURCE_DOES_NOT_EXIST" {
                return Ok(None);
            }
            bail!("experiments/get-by-name returned 404: {}", error.error_code);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from experiments/get-by-name: {body}");
        }

        let parsed: GetExperimentResponse = response
            .json()
            .await
            .context("decoding experiment response")?;

        Ok(Some(Experiment {
            experiment_id: parsed.experiment.experiment_id,
            name: parsed.experiment.name,
            tags: tags_to_map(parsed.experiment.tags),
        }))
    }

    async fn create_experiment(&self, name: &str, tags: &[(String, String)]) -> Result<String> {
        #[derive(Serialize)]
        struct Body<'a> {
            name: &'a str,
            tags: Vec<TagDto<'a>>,
        }

        let response: CreateExperimentResponse = self
            .post_json(
                "experiments/create",
                &Body {
                    name,
                    tags: Self::tag_dtos(tags),
                },
            )
            .await?;

        Ok(response.experiment_id)
    }

    async fn set_experiment_tag(
        &self,
        experiment_id: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            experiment_id: &'a str,
            key: &'a str,
            value: &'a str,
        }

        self.post_ack(
            "experiments/set-experiment-tag",
            &Body {
                experiment_id,
                key,
                value,
            },
        )
        .await
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        start_time: Option<i64>,
        tags: &[(String, String)],
    ) -> Result<String> {
        #[derive(Serialize)]
        struct Body<'a> {
            experiment_id: &'a str,
            run_name: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            start_time: Option<i64>,
            tags: Vec<TagDto<'a>>,
        }

        let response: CreateRunResponse = self
            .post_json(
                "runs/create",
                &Body {
                    experiment_id,
                    run_name,
                    start_time,
                    tags: Self::tag_dtos(tags),
                },
            )
            .await?;

        Ok(response.run.info.run_id)
    }

    async fn log_batch(&self, run_id: &str, metrics: &[MetricPoint]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        #[derive(Serialize)]
        struct Body<'a> {
            run_id: &'a str,
            metrics: &'a [MetricPoint],
        }

        self.post_ack("runs/log-batch", &Body { run_id, metrics })
            .await
    }

    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()> {
        if params.is_empty() {
            return Ok(());
        }

        #[derive(Serialize)]
        struct Body<'a> {
            run_id: &'a str,
            params: Vec<TagDto<'a>>,
        }

        self.post_ack(
            "runs/log-batch",
            &Body {
                run_id,
                params: Self::tag_dtos(params),
            },
        )
        .await
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            run_id: &'a str,
            key: &'a str,
            value: &'a str,
        }

        self.post_ack("runs/set-tag", &Body { run_id, key, value })
            .await
    }

    async fn search_runs(
        &self,
        experiment_id: &str,
        filter: Option<&str>,
    ) -> Result<Vec<RunInfo>> {
        #[derive(Serialize)]
        struct Body<'a> {
            experiment_ids: [&'a str; 1],
            #[serde(skip_serializing_if = "Option::is_none")]
            filter: Option<&'a str>,
            max_results: usize,
            #[serde(skip_serializing_if = "Option::is_none")]
            page_token: Option<&'a str>,
        }

        let mut runs = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let response: SearchRunsResponse = self
                .post_json(
                    "runs/search",
                    &Body {
                        experiment_ids: [experiment_id],
                        filter,
                        max_results: SEARCH_PAGE_SIZE,
                        page_token: token.as_deref(),
                    },
                )
                .await?;

            for run in response.runs {
                runs.push(RunInfo {
                    run_id: run.info.run_id,
                    tags: tags_to_map(run.data.unwrap_or_default().tags),
                });
            }

            match response.next_page_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }

        Ok(runs)
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            run_id: &'a str,
        }

        self.post_ack("runs/delete", &Body { run_id }).await
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<i64>,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            run_id: &'a str,
            status: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            end_time: Option<i64>,
        }

        self.post_ack(
            "runs/update",
            &Body {
                run_id,
                status: status.as_str(),
                end_time,
            },
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use anyhow::{bail, Result};

    use super::{Experiment, MlflowService, RunInfo, RunStatus};
    use crate::metric::MetricPoint;

    #[derive(Debug)]
    pub struct FakeExperiment {
        pub experiment_id: String,
        pub name: String,
        pub tags: HashMap<String, String>,
    }

    #[derive(Debug, Default)]
    pub struct FakeRun {
        pub run_id: String,
        pub experiment_id: String,
        pub name: String,
        pub start_time: Option<i64>,
        pub tags: HashMap<String, String>,
        pub params: HashMap<String, String>,
        pub metrics: Vec<MetricPoint>,
        pub batch_sizes: Vec<usize>,
        pub status: Option<&'static str>,
        pub deleted: bool,
    }

    #[derive(Debug, Default)]
    pub struct FakeState {
        next_id: u64,
        experiments: Vec<FakeExperiment>,
        pub runs: Vec<FakeRun>,
    }

    impl FakeState {
        pub fn experiment(&self, id: &str) -> Option<&FakeExperiment> {
            self.experiments.iter().find(|e| e.experiment_id == id)
        }

        pub fn experiment_by_name(&self, name: &str) -> Option<&FakeExperiment> {
            self.experiments.iter().find(|e| e.name == name)
        }

        pub fn experiment_count(&self) -> usize {
            self.experiments.len()
        }

        pub fn run(&self, run_id: &str) -> Option<&FakeRun> {
            self.runs.iter().find(|r| r.run_id == run_id)
        }

        pub fn live_runs_in(&self, experiment_id: &str) -> Vec<&FakeRun> {
            self.runs
                .iter()
                .filter(|r| r.experiment_id == experiment_id && !r.deleted)
                .collect()
        }

        fn fresh_id(&mut self, prefix: &str) -> String {
            self.next_id += 1;
            format!("{prefix}-{}", self.next_id)
        }
    }

    /// In-memory tracking server double. Enforces the same per-call
    /// limits as the real batched endpoint so capacity violations fail
    /// tests loudly.
    #[derive(Clone, Default)]
    pub struct FakeMlflow {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeMlflow {
        pub fn seed_experiment(&self, name: &str, tags: &[(&str, &str)]) -> String {
            let mut state = self.state.lock().expect("lock");
            let experiment_id = state.fresh_id("exp");
            state.experiments.push(FakeExperiment {
                experiment_id: experiment_id.clone(),
                name: name.to_string(),
                tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
            experiment_id
        }
    }

    impl MlflowService for FakeMlflow {
        async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
            let state = self.state.lock().expect("lock");
            Ok(state.experiments.iter().find(|e| e.name == name).map(|e| {
                Experiment {
                    experiment_id: e.experiment_id.clone(),
                    name: e.name.clone(),
                    tags: e.tags.clone(),
                }
            }))
        }

        async fn create_experiment(
            &self,
            name: &str,
            tags: &[(String, String)],
        ) -> Result<String> {
            let mut state = self.state.lock().expect("lock");
            let experiment_id = state.fresh_id("exp");
            state.experiments.push(FakeExperiment {
                experiment_id: experiment_id.clone(),
                name: name.to_string(),
                tags: tags.iter().cloned().collect(),
            });
            Ok(experiment_id)
        }

        async fn set_experiment_tag(
            &self,
            experiment_id: &str,
            key: &str,
            value: &str,
        ) -> Result<()> {
            let mut state = self.state.lock().expect("lock");
            let experiment = state
                .experiments
                .iter_mut()
                .find(|e| e.experiment_id == experiment_id);
            match experiment {
                Some(experiment) => {
                    experiment.tags.insert(key.to_string(), value.to_string());
                    Ok(())
                }
                None => bail!("no such experiment: {experiment_id}"),
            }
        }

        async fn create_run(
            &self,
            experiment_id: &str,
            run_name: &str,
            start_time: Option<i64>,
            tags: &[(String, String)],
        ) -> Result<String> {
            let mut state = self.state.lock().expect("lock");
            let run_id = state.fresh_id("run");
            state.runs.push(FakeRun {
                run_id: run_id.clone(),
                experiment_id: experiment_id.to_string(),
                name: run_name.to_string(),
                start_time,
                tags: tags.iter().cloned().collect(),
                status: Some("RUNNING"),
                ..Default::default()
            });
            Ok(run_id)
        }

        async fn log_batch(&self, run_id: &str, metrics: &[MetricPoint]) -> Result<()> {
            if metrics.len() > 1000 {
                bail!("batch of {} metrics exceeds the per-call limit", metrics.len());
            }
            let mut state = self.state.lock().expect("lock");
            let run = state
                .runs
                .iter_mut()
                .find(|r| r.run_id == run_id)
                .ok_or_else(|| anyhow::anyhow!("no such run: {run_id}"))?;
            run.batch_sizes.push(metrics.len());
            run.metrics.extend(metrics.iter().cloned());
            Ok(())
        }

        async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()> {
            if params.len() > super::MAX_PARAMS_PER_BATCH {
                bail!("params batch of {} exceeds the per-call limit", params.len());
            }
            let mut state = self.state.lock().expect("lock");
            let run = state
                .runs
                .iter_mut()
                .find(|r| r.run_id == run_id)
                .ok_or_else(|| anyhow::anyhow!("no such run: {run_id}"))?;
            run.params
                .extend(params.iter().cloned());
            Ok(())
        }

        async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
            let mut state = self.state.lock().expect("lock");
            let run = state
                .runs
                .iter_mut()
                .find(|r| r.run_id == run_id)
                .ok_or_else(|| anyhow::anyhow!("no such run: {run_id}"))?;
            run.tags.insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn search_runs(
            &self,
            experiment_id: &str,
            _filter: Option<&str>,
        ) -> Result<Vec<RunInfo>> {
            let state = self.state.lock().expect("lock");
            Ok(state
                .live_runs_in(experiment_id)
                .into_iter()
                .map(|r| RunInfo {
                    run_id: r.run_id.clone(),
                    tags: r.tags.clone(),
                })
                .collect())
        }

        async fn delete_run(&self, run_id: &str) -> Result<()> {
            let mut state = self.state.lock().expect("lock");
            let run = state
                .runs
                .iter_mut()
                .find(|r| r.run_id == run_id)
                .ok_or_else(|| anyhow::anyhow!("no such run: {run_id}"))?;
            run.deleted = true;
            Ok(())
        }

        async fn update_run_status(
            &self,
            run_id: &str,
            status: RunStatus,
            _end_time: Option<i64>,
        ) -> Result<()> {
            let mut state = self.state.lock().expect("lock");
            let run = state
                .runs
                .iter_mut()
                .find(|r| r.run_id == run_id)
                .ok_or_else(|| anyhow::anyhow!("no such run: {run_id}"))?;
            run.status = Some(status.as_str());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let api = MlflowApi::new("http://localhost:5000/").expect("client");
        assert_eq!(
            api.url("runs/log-batch"),
            "http://localhost:5000/api/2.0/mlflow/runs/log-batch"
        );
    }

    #[test]
    fn test_run_status_strings() {
        assert_eq!(RunStatus::Finished.as_str(), "FINISHED");
        assert_eq!(RunStatus::Failed.as_str(), "FAILED");
    }

    #[test]
    fn test_search_response_tolerates_missing_fields() {
        let parsed: SearchRunsResponse = serde_json::from_str("{}").expect("empty response");
        assert!(parsed.runs.is_empty());
        assert!(parsed.next_page_token.is_none());

        let parsed: SearchRunsResponse = serde_json::from_str(
            r#"{"runs": [{"info": {"run_id": "r1"}}], "next_page_token": ""}"#,
        )
        .expect("run without data block");
        assert_eq!(parsed.runs.len(), 1);
        assert_eq!(parsed.runs[0].info.run_id, "r1");
    }
}
