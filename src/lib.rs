//! Crash-resumable migration of Weights & Biases projects into MLflow.
//!
//! The pipeline core converts an unbounded, lazily-read stream of source
//! records into ordered, size-bounded write batches, and a whole-run
//! completion-marker protocol makes multi-hour migrations idempotent and
//! restartable after partial failure.

pub mod batch;
pub mod config;
pub mod convert;
pub mod dest;
pub mod driver;
pub mod error;
pub mod metric;
pub mod mlflow;
pub mod recover;
pub mod resolve;
pub mod source;
pub mod wandb;

pub use batch::BatchAccumulator;
pub use config::{Config, MAX_METRICS_PER_BATCH};
pub use error::MigrationError;
pub use metric::{MetricBatch, MetricKind, MetricPoint, MetricValue, RunDescriptor};
