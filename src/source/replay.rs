use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::config::MAX_METRICS_PER_BATCH;
use crate::dest::snapshot::metric_subdir;
use crate::metric::{MetricBatch, MetricKind, MetricPoint, MetricValue};
use crate::source::RecordSource;

struct ReplayFile {
    key: String,
    path: PathBuf,
    reader: BufReader<File>,
}

/// Replays one run's persisted snapshot files as candidate batches.
///
/// Files rotate round-robin: one bounded batch per file per pass, so no
/// single large metric holds the head of the line and buffered memory
/// stays proportional to one batch. A file leaves the rotation only
/// after a read returns fewer than a full batch, which signals
/// exhaustion.
pub struct ReplaySource {
    files: VecDeque<ReplayFile>,
    batch_size: usize,
}

impl ReplaySource {
    /// Opens every `<key>.csv` under the run's directory for `kind`.
    ///
    /// A missing subdirectory replays as an empty stream; a run may
    /// legitimately have no telemetry. Files open in sorted path order
    /// so replay is deterministic.
    pub fn open(run_dir: &Path, kind: MetricKind) -> Result<Self> {
        Self::with_batch_size(run_dir, kind, MAX_METRICS_PER_BATCH)
    }

    pub fn with_batch_size(run_dir: &Path, kind: MetricKind, batch_size: usize) -> Result<Self> {
        let root = run_dir.join(metric_subdir(kind));
        let mut paths = Vec::new();
        if root.is_dir() {
            collect_csv_files(&root, &mut paths)?;
        }
        paths.sort();

        let mut files = VecDeque::with_capacity(paths.len());
        for path in paths {
            let key = path
                .strip_prefix(&root)
                .expect("path is under root")
                .with_extension("")
                .to_string_lossy()
                .into_owned();
            let file =
                File::open(&path).with_context(|| format!("opening {}", path.display()))?;
            files.push_back(ReplayFile {
                key,
                path,
                reader: BufReader::new(file),
            });
        }

        Ok(Self { files, batch_size })
    }

    /// Number of metric files still in the rotation.
    pub fn open_files(&self) -> usize {
        self.files.len()
    }
}

impl RecordSource for ReplaySource {
    async fn next_candidate(&mut self) -> Result<Option<MetricBatch>> {
        while let Some(mut file) = self.files.pop_front() {
            let mut batch = Vec::with_capacity(self.batch_size.min(256));
            let mut lines_read = 0;
            let mut line = String::new();

            while lines_read < self.batch_size {
                line.clear();
                let n = file
                    .reader
                    .read_line(&mut line)
                    .with_context(|| format!("reading {}", file.path.display()))?;
                if n == 0 {
                    break;
                }
                lines_read += 1;

                match parse_line(&file.key, line.trim_end()) {
                    Some(point) => batch.push(point),
                    None => {
                        warn!(
                            file = %file.path.display(),
                            line = %line.trim_end(),
                            "skipping malformed snapshot line",
                        );
                    }
                }
            }

            // A full read may have more behind it; a short read means the
            // file is done and leaves the rotation.
            if lines_read == self.batch_size {
                self.files.push_back(file);
            }

            if !batch.is_empty() {
                return Ok(Some(batch));
            }
        }

        Ok(None)
    }
}

/// Parses one `value,timestamp,sequence` line.
///
/// The value parses integer-first so the original numeric kind survives
/// the round trip where the text makes it unambiguous.
fn parse_line(key: &str, line: &str) -> Option<MetricPoint> {
    if line.is_empty() {
        return None;
    }
    let mut parts = line.splitn(3, ',');
    let value = MetricValue::parse(parts.next()?)?;
    let timestamp: i64 = parts.next()?.trim().parse().ok()?;
    let sequence: i64 = parts.next()?.trim().parse().ok()?;
    Some(MetricPoint::new(key, value, timestamp, sequence))
}

fn collect_csv_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_csv_files(&path, out)?;
        } else if path.extension().map(|ext| ext == "csv").unwrap_or(false) {
            out.push(path);
        }
    }
    Ok(())
}
