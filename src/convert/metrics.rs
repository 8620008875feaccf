use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::warn;

use crate::metric::{MetricBatch, MetricPoint, MetricValue, Row};

/// Bookkeeping fields the source injects into every history row. Never
/// converted.
pub const EXCLUDED_KEYS: [&str; 3] = ["_timestamp", "_step", "_run_time"];

/// Source-side hierarchical key separator.
const SOURCE_SEPARATOR: char = '.';

/// Destination-side hierarchical key separator. The destination UI groups
/// metrics by this character, so the rewrite is not optional.
const DEST_SEPARATOR: &str = "/";

/// Caller-supplied metric exclusion list, exact match or regex.
#[derive(Debug, Default)]
pub struct MetricExcludes {
    exact: HashSet<String>,
    patterns: Vec<Regex>,
}

impl MetricExcludes {
    /// Compiles the exclusion entries. Every entry matches its exact text;
    /// entries that also compile as a regex match as an anchored pattern.
    /// Entries that fail to compile are kept as exact matches only.
    pub fn new(entries: &[String]) -> Self {
        let mut exact = HashSet::new();
        let mut patterns = Vec::new();

        for entry in entries {
            exact.insert(entry.clone());
            match Regex::new(&format!("^(?:{entry})$")) {
                Ok(re) => patterns.push(re),
                Err(err) => {
                    warn!(pattern = %entry, error = %err, "metric exclude is not a valid regex, matching exact key only");
                }
            }
        }

        Self { exact, patterns }
    }

    pub fn matches(&self, key: &str) -> bool {
        if EXCLUDED_KEYS.contains(&key) {
            return true;
        }
        if self.exact.contains(key) {
            return true;
        }
        self.patterns.iter().any(|re| re.is_match(key))
    }
}

/// Partitions metric keys into single-observation and time-series classes.
///
/// A key with exactly one non-missing value across a run's entire row set
/// is single-observation: the source assigns those a non-deterministic
/// step, which would scatter the lone point across an unpredictable
/// x-axis position, so its emitted sequence is pinned to 0 instead.
#[derive(Debug, Default)]
pub struct SingleObservationTracker {
    counts: HashMap<String, u64>,
}

impl SingleObservationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts non-missing values in one row. NaN and null are missing.
    pub fn observe_row(&mut self, row: &Row) {
        for (key, value) in row {
            let missing = value.is_null()
                || value.as_f64().map(f64::is_nan).unwrap_or(false);
            if !missing {
                *self.counts.entry(key.clone()).or_default() += 1;
            }
        }
    }

    /// Keys seen with exactly one non-missing value.
    pub fn finish(self) -> HashSet<String> {
        self.counts
            .into_iter()
            .filter(|(_, count)| *count == 1)
            .map(|(key, _)| key)
            .collect()
    }
}

/// Rewrites a hierarchical source key to the destination separator.
pub fn rewrite_key(key: &str) -> String {
    key.replace(SOURCE_SEPARATOR, DEST_SEPARATOR)
}

/// Converts one history row into metric points.
///
/// Excluded and non-numeric fields are skipped, never the whole row. The
/// row's ingestion timestamp (fractional seconds) becomes milliseconds;
/// single-observation keys emit with sequence 0, everything else with the
/// row's native step.
pub fn convert_row(
    row: &Row,
    single_observation: &HashSet<String>,
    excludes: &MetricExcludes,
) -> MetricBatch {
    let timestamp = row
        .get("_timestamp")
        .and_then(|v| v.as_f64())
        .map(|secs| (secs * 1000.0) as i64)
        .unwrap_or(0);
    let step = row.get("_step").and_then(|v| v.as_i64()).unwrap_or(0);

    let mut points = Vec::new();
    for (key, value) in row {
        if excludes.matches(key) {
            continue;
        }
        let Some(value) = MetricValue::from_json(value) else {
            continue;
        };
        let sequence = if single_observation.contains(key) {
            0
        } else {
            step
        };
        points.push(MetricPoint::new(rewrite_key(key), value, timestamp, sequence));
    }
    points
}
