pub mod replay;

use std::collections::{HashSet, VecDeque};

use anyhow::Result;

use crate::convert::metrics::{convert_row, MetricExcludes, SingleObservationTracker};
use crate::convert::system::SystemMetricsMapper;
use crate::metric::{MetricBatch, Row};
use crate::wandb::RunReader;

/// A lazy, mode-agnostic stream of candidate batches for one run.
///
/// Each candidate is one unit the batch accumulator must treat
/// atomically: a converted history row, a telemetry row's device+host
/// pair, or one bounded chunk of a snapshot file. Consumers read a
/// stream to completion or abandon it; there is no mid-run restart.
pub trait RecordSource: Send {
    fn next_candidate(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Option<MetricBatch>>> + Send;
}

/// Live experiment metrics, pulled page-wise from the source service.
///
/// Opening the stream costs one full classification pass over the run's
/// history to find single-observation keys; conversion then streams a
/// second, independent scan. Both scans are per-run and read-only, so
/// the double read is safe.
pub struct LiveMetricSource<'a, R: RunReader> {
    reader: &'a R,
    run_id: &'a str,
    excludes: &'a MetricExcludes,
    single_observation: HashSet<String>,
    pending: VecDeque<Row>,
    cursor: Option<String>,
    exhausted: bool,
}

impl<'a, R: RunReader> LiveMetricSource<'a, R> {
    pub async fn open(
        reader: &'a R,
        run_id: &'a str,
        excludes: &'a MetricExcludes,
    ) -> Result<Self> {
        let mut tracker = SingleObservationTracker::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = reader.scan_metric_rows(run_id, cursor.as_deref()).await?;
            for row in &page.rows {
                tracker.observe_row(row);
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(Self {
            reader,
            run_id,
            excludes,
            single_observation: tracker.finish(),
            pending: VecDeque::new(),
            cursor: None,
            exhausted: false,
        })
    }

    /// Keys that will emit with their sequence pinned to 0.
    pub fn single_observation_keys(&self) -> &HashSet<String> {
        &self.single_observation
    }
}

impl<R: RunReader> RecordSource for LiveMetricSource<'_, R> {
    async fn next_candidate(&mut self) -> Result<Option<MetricBatch>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(convert_row(
                    &row,
                    &self.single_observation,
                    self.excludes,
                )));
            }
            if self.exhausted {
                return Ok(None);
            }

            let page = self
                .reader
                .scan_metric_rows(self.run_id, self.cursor.as_deref())
                .await?;
            self.pending.extend(page.rows);
            match page.next {
                Some(next) => self.cursor = Some(next),
                None => self.exhausted = true,
            }
        }
    }
}

/// Live system telemetry, pulled page-wise from the source service.
///
/// The source records no timestamps for telemetry rows; a running row
/// index substitutes for both timestamp and sequence.
pub struct LiveSystemSource<'a, R: RunReader> {
    reader: &'a R,
    run_id: &'a str,
    mapper: SystemMetricsMapper,
    pending: VecDeque<Row>,
    cursor: Option<String>,
    exhausted: bool,
    index: i64,
}

impl<'a, R: RunReader> LiveSystemSource<'a, R> {
    pub fn new(reader: &'a R, run_id: &'a str) -> Self {
        Self {
            reader,
            run_id,
            mapper: SystemMetricsMapper::new(),
            pending: VecDeque::new(),
            cursor: None,
            exhausted: false,
            index: 0,
        }
    }
}

impl<R: RunReader> RecordSource for LiveSystemSource<'_, R> {
    async fn next_candidate(&mut self) -> Result<Option<MetricBatch>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                let batch = self.mapper.convert_row(&row, self.index);
                self.index += 1;
                return Ok(Some(batch));
            }
            if self.exhausted {
                return Ok(None);
            }

            let page = self
                .reader
                .read_system_rows(self.run_id, self.cursor.as_deref())
                .await?;
            self.pending.extend(page.rows);
            match page.next {
                Some(next) => self.cursor = Some(next),
                None => self.exhausted = true,
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::FakeReader;
    use super::*;
    use crate::metric::MetricValue;

    fn row(entries: serde_json::Value) -> Row {
        entries.as_object().expect("object").clone()
    }

    #[tokio::test]
    async fn test_live_metrics_stream_across_pages() {
        let mut reader = FakeReader {
            page_size: 2,
            ..Default::default()
        };
        reader.history.insert(
            "run1".into(),
            vec![
                row(json!({"_timestamp": 1.0, "_step": 0, "loss": 0.5})),
                row(json!({"_timestamp": 2.0, "_step": 1, "loss": 0.4})),
                row(json!({"_timestamp": 3.0, "_step": 2, "loss": 0.3})),
            ],
        );

        let excludes = MetricExcludes::default();
        let mut source = LiveMetricSource::open(&reader, "run1", &excludes)
            .await
            .expect("open");

        let mut sequences = Vec::new();
        while let Some(batch) = source.next_candidate().await.expect("next") {
            for point in batch {
                assert_eq!(point.key, "loss");
                sequences.push(point.sequence);
            }
        }
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_live_metrics_classification_spans_all_pages() {
        // "final" appears once, in the last row of the last page; the
        // classification pass must still see it.
        let mut reader = FakeReader {
            page_size: 2,
            ..Default::default()
        };
        let mut rows: Vec<Row> = (0..5)
            .map(|step| row(json!({"_timestamp": step as f64, "_step": step, "loss": 0.1})))
            .collect();
        rows[4].insert("final".into(), json!(0.99));
        reader.history.insert("run1".into(), rows);

        let excludes = MetricExcludes::default();
        let mut source = LiveMetricSource::open(&reader, "run1", &excludes)
            .await
            .expect("open");
        assert!(source.single_observation_keys().contains("final"));

        let mut final_sequence = None;
        while let Some(batch) = source.next_candidate().await.expect("next") {
            for point in batch {
                if point.key == "final" {
                    final_sequence = Some(point.sequence);
                }
            }
        }
        assert_eq!(final_sequence, Some(0));
    }

    #[tokio::test]
    async fn test_live_system_rows_indexed() {
        let mut reader = FakeReader {
            page_size: 2,
            ..Default::default()
        };
        reader.system.insert(
            "run1".into(),
            vec![
                row(json!({"system.cpu": 10.0})),
                row(json!({"system.cpu": 20.0})),
                row(json!({"system.cpu": 30.0})),
            ],
        );

        let mut source = LiveSystemSource::new(&reader, "run1");
        let mut seen = Vec::new();
        while let Some(batch) = source.next_candidate().await.expect("next") {
            for point in batch {
                seen.push((point.value, point.timestamp, point.sequence));
            }
        }
        assert_eq!(
            seen,
            vec![
                (MetricValue::Float(10.0), 0, 0),
                (MetricValue::Float(20.0), 1, 1),
                (MetricValue::Float(30.0), 2, 2),
            ]
        );
    }
}
