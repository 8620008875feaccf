use anyhow::{bail, Context, Result};
use chrono::DateTime;
use serde::Deserialize;

use crate::metric::{Row, RunDescriptor};

/// History rows fetched per page when scanning a run.
const PAGE_SIZE: usize = 500;

/// One page of history rows plus the cursor for the next page.
#[derive(Debug, Default)]
pub struct RowPage {
    pub rows: Vec<Row>,
    pub next: Option<String>,
}

/// Read access to one source project.
///
/// The reader is project-scoped: run identifiers are only unique within
/// a project. History scans are restartable per run (each call sequence
/// starting from a `None` cursor is a fresh stream) but not mid-run.
pub trait RunReader: Send + Sync {
    /// Lists every run in the project.
    fn list_runs(&self) -> impl std::future::Future<Output = Result<Vec<RunDescriptor>>> + Send;

    /// Reads a run's config key/value mapping. Read once per run.
    fn read_config(&self, run_id: &str) -> impl std::future::Future<Output = Result<Row>> + Send;

    /// Scans one page of the run's metric history.
    fn scan_metric_rows(
        &self,
        run_id: &str,
        cursor: Option<&str>,
    ) -> impl std::future::Future<Output = Result<RowPage>> + Send;

    /// Scans one page of the run's system telemetry rows.
    fn read_system_rows(
        &self,
        run_id: &str,
        cursor: Option<&str>,
    ) -> impl std::future::Future<Output = Result<RowPage>> + Send;
}

#[derive(Debug, Deserialize)]
struct RunsResponse {
    runs: Vec<RunEntry>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunEntry {
    id: String,
    /// Display name; not guaranteed unique.
    name: String,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    rows: Vec<Row>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// HTTP client for the source tracking service's export API.
///
/// A thin wrapper: pagination and JSON decoding only, no conversion
/// logic. Retry policy is left to the service's own HTTP semantics.
pub struct WandbApi {
    http: reqwest::Client,
    base_url: String,
    entity: String,
    project: String,
}

impl WandbApi {
    pub fn new(base_url: &str, entity: &str, project: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building wandb HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            entity: entity.to_string(),
            project: project.to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting {path}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from {path}: {body}");
        }

        response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))
    }

    fn run_path(&self, run_id: &str, resource: &str) -> String {
        format!(
            "/api/v1/runs/{}/{}/{}/{}",
            self.entity, self.project, run_id, resource
        )
    }

    async fn fetch_history(
        &self,
        run_id: &str,
        resource: &str,
        cursor: Option<&str>,
    ) -> Result<RowPage> {
        let mut path = format!("{}?page_size={PAGE_SIZE}", self.run_path(run_id, resource));
        if let Some(cursor) = cursor {
            path.push_str("&cursor=");
            path.push_str(cursor);
        }

        let response: HistoryResponse = self.get_json(&path).await?;
        Ok(RowPage {
            rows: response.rows,
            next: response.next_cursor,
        })
    }
}

impl RunReader for WandbApi {
    async fn list_runs(&self) -> Result<Vec<RunDescriptor>> {
        let mut runs = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut path = format!("/api/v1/projects/{}/{}/runs", self.entity, self.project);
            if let Some(cursor) = &cursor {
                path.push_str("?cursor=");
                path.push_str(cursor);
            }

            let page: RunsResponse = self.get_json(&path).await?;
            for entry in page.runs {
                runs.push(RunDescriptor {
                    id: entry.id,
                    name: entry.name,
                    group: entry.group,
                    created_at: entry.created_at.as_deref().and_then(parse_timestamp_ms),
                });
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(runs)
    }

    async fn read_config(&self, run_id: &str) -> Result<Row> {
        self.get_json(&self.run_path(run_id, "config")).await
    }

    async fn scan_metric_rows(&self, run_id: &str, cursor: Option<&str>) -> Result<RowPage> {
        self.fetch_history(run_id, "history", cursor).await
    }

    async fn read_system_rows(&self, run_id: &str, cursor: Option<&str>) -> Result<RowPage> {
        self.fetch_history(run_id, "system", cursor).await
    }
}

/// Parses an RFC 3339 creation time into milliseconds since epoch.
fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
