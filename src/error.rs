use std::path::PathBuf;

use thiserror::Error;

/// Fatal migration errors.
///
/// Everything here aborts the whole migration before or between runs.
/// Per-record problems (non-numeric values, NaN) are not errors at all:
/// the offending field is skipped. A crash mid-run is not surfaced as an
/// error either: it is detected on the next start by the absence of the
/// completion marker.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Conflicting or incomplete configuration, caught before any run is
    /// touched.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A destination run path already exists and no resume flag was given.
    /// Aborting beats guessing whether the data belongs to this migration.
    #[error(
        "destination for run already exists at {0}; remove it or pass \
         --resume-from-crash if you are resuming a previous attempt"
    )]
    TargetExists(PathBuf),

    /// Crash-resume could not locate the migration-owned experiment.
    /// Falling back to a fresh experiment would duplicate every already
    /// finished run under a new identity, so this is never retried.
    #[error(
        "cannot find migration experiment {0:?} while resuming from a crash; \
         double-check the project name or drop --resume-from-crash"
    )]
    ExperimentNotFound(String),
}
