use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::error;

use crate::metric::MetricBatch;
use crate::mlflow::MlflowService;

/// Bounded depth of the per-run write queue. Submitting past this depth
/// applies backpressure to the conversion loop.
const WRITE_QUEUE_DEPTH: usize = 32;

enum WriteOp {
    Batch(MetricBatch),
    Barrier(oneshot::Sender<Result<()>>),
}

/// Ordered fire-and-forget write queue for one destination run.
///
/// A single consumer task drains the queue, so batches land in submission
/// order, since downstream time-series reconstruction may depend on monotonic
/// append order. `submit` does not wait for the write to complete;
/// `flush` is the barrier that surfaces the first write error, if any.
/// After a write error the task stops writing (the run will never be
/// marked complete) but keeps draining so the producer is never stuck.
pub struct RunWriter {
    tx: mpsc::Sender<WriteOp>,
    handle: JoinHandle<()>,
    pending: Arc<AtomicUsize>,
}

impl RunWriter {
    /// Spawns the consumer task for one run.
    ///
    /// `pending` is shared with the progress reporter; it counts batches
    /// submitted but not yet written across all live writers.
    pub fn spawn<S>(service: S, run_id: String, pending: Arc<AtomicUsize>) -> Self
    where
        S: MlflowService + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<WriteOp>(WRITE_QUEUE_DEPTH);
        let task_pending = Arc::clone(&pending);

        let handle = tokio::spawn(async move {
            let mut first_error: Option<anyhow::Error> = None;

            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Batch(batch) => {
                        if first_error.is_none() {
                            if let Err(err) = service.log_batch(&run_id, &batch).await {
                                error!(
                                    run_id = %run_id,
                                    batch_len = batch.len(),
                                    error = %err,
                                    "metric batch write failed",
                                );
                                first_error = Some(err);
                            }
                        }
                        task_pending.fetch_sub(1, Ordering::Relaxed);
                    }
                    WriteOp::Barrier(ack) => {
                        let result = match first_error.take() {
                            Some(err) => Err(err),
                            None => Ok(()),
                        };
                        let _ = ack.send(result);
                    }
                }
            }
        });

        Self {
            tx,
            handle,
            pending,
        }
    }

    /// Enqueues one batch without waiting for the write.
    pub async fn submit(&self, batch: MetricBatch) -> Result<()> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(WriteOp::Batch(batch)).await.is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow!("run writer task is gone"));
        }
        Ok(())
    }

    /// Waits until every batch submitted so far has been written.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Barrier(ack_tx))
            .await
            .map_err(|_| anyhow!("run writer task is gone"))?;
        ack_rx.await.map_err(|_| anyhow!("run writer task dropped barrier"))?
    }

    /// Closes the queue and waits for the consumer to drain.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.tx);
        self.handle.await.map_err(|err| anyhow!("run writer task panicked: {err}"))
    }
}
