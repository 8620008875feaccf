use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::dest::{RunTarget, COMPLETE_TAG, TAG_TRUE};
use crate::error::MigrationError;
use crate::metric::{MetricBatch, MetricKind};

/// Tag file name inside an experiment or run directory.
pub const TAGS_FILE: &str = "tags.csv";
/// Params file name inside a run directory.
pub const PARAMS_FILE: &str = "params.json";

/// Directory a metric kind is persisted under.
pub fn metric_subdir(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Experiment => "metrics",
        MetricKind::System => "system_metrics",
    }
}

/// Local snapshot destination: one run directory instead of a live run.
///
/// Layout: `tags.csv`, `params.json`, and one append-only
/// `metrics/<key>.csv` (or `system_metrics/<key>.csv`) per metric key,
/// each line `value,timestamp,sequence`. Hierarchical keys map to nested
/// paths, so replay recovers the key from the file's relative path.
pub struct SnapshotTarget {
    run_dir: PathBuf,
    writers: HashMap<PathBuf, BufWriter<File>>,
}

impl SnapshotTarget {
    /// Creates the run directory, named by the source run's stable id.
    ///
    /// An existing directory is a naming collision: snapshot data is
    /// append-only and a half-written directory from a previous attempt
    /// must be reaped by crash recovery, never silently reused.
    pub fn open(experiment_dir: &Path, source_run_id: &str) -> Result<Self> {
        let run_dir = experiment_dir.join(source_run_id);
        if run_dir.exists() {
            return Err(MigrationError::TargetExists(run_dir).into());
        }
        fs::create_dir(&run_dir)
            .with_context(|| format!("creating run dir {}", run_dir.display()))?;

        Ok(Self {
            run_dir,
            writers: HashMap::new(),
        })
    }

    /// The run directory this target writes into.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn metric_writer(&mut self, kind: MetricKind, key: &str) -> Result<&mut BufWriter<File>> {
        let path = self
            .run_dir
            .join(metric_subdir(kind))
            .join(format!("{key}.csv"));

        if !self.writers.contains_key(&path) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            self.writers.insert(path.clone(), BufWriter::new(file));
        }

        Ok(self.writers.get_mut(&path).expect("writer just inserted"))
    }

    fn append_tags(&self, tags: &[(String, String)]) -> Result<()> {
        write_tags(&self.run_dir, tags)
    }
}

impl RunTarget for SnapshotTarget {
    async fn log_metrics(&mut self, kind: MetricKind, batch: MetricBatch) -> Result<()> {
        for point in &batch {
            let writer = self.metric_writer(kind, &point.key)?;
            writeln!(writer, "{},{},{}", point.value, point.timestamp, point.sequence)
                .with_context(|| format!("writing metric {}", point.key))?;
        }
        Ok(())
    }

    async fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<()> {
        let path = self.run_dir.join(PARAMS_FILE);
        let file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), params)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    async fn set_tags(&mut self, tags: &[(String, String)]) -> Result<()> {
        self.append_tags(tags)
    }

    async fn flush(&mut self) -> Result<()> {
        for (path, writer) in &mut self.writers {
            writer
                .flush()
                .with_context(|| format!("flushing {}", path.display()))?;
        }
        Ok(())
    }

    async fn finalize(mut self) -> Result<()> {
        self.flush().await?;
        self.append_tags(&[(COMPLETE_TAG.to_string(), TAG_TRUE.to_string())])
    }
}

/// Appends tag lines to a directory's `tags.csv`.
pub fn write_tags(dir: &Path, tags: &[(String, String)]) -> Result<()> {
    let path = dir.join(TAGS_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for (key, value) in tags {
        writeln!(writer, "{key},{value}").with_context(|| format!("writing {}", path.display()))?;
    }
    writer.flush().context("flushing tags")?;
    Ok(())
}

/// Reads a directory's `tags.csv` into a map.
///
/// Values keep any embedded commas: only the first comma splits. Missing
/// file reads as no tags, matching a run that crashed before tagging.
pub fn read_tags(dir: &Path) -> Result<HashMap<String, String>> {
    let path = dir.join(TAGS_FILE);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("opening {}", path.display()));
        }
    };

    let mut tags = HashMap::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(',') {
            tags.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(tags)
}

/// Reads a run directory's `params.json`.
pub fn read_params(dir: &Path) -> Result<BTreeMap<String, String>> {
    let path = dir.join(PARAMS_FILE);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(BTreeMap::new())
        }
        Err(err) => {
            return Err(err).with_context(|| format!("opening {}", path.display()));
        }
    };
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("decoding {}", path.display()))
}
