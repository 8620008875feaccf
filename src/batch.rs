use std::mem;

use crate::config::MAX_METRICS_PER_BATCH;
use crate::metric::MetricBatch;

/// Capacity-bounded write batch accumulator.
///
/// Collects converted metric points and decides when the buffered batch
/// must be handed to a writer. The capacity check runs against the whole
/// candidate, so a candidate is never split across a flush boundary: it
/// either extends the current buffer or becomes the new buffer after the
/// old one is flushed as-is.
///
/// Two invariants hold for any sequence of calls:
/// - no returned batch ever exceeds the capacity;
/// - every appended point appears in exactly one returned batch (counting
///   the final [`finish`](Self::finish) remainder).
#[derive(Debug)]
pub struct BatchAccumulator {
    capacity: usize,
    buffer: MetricBatch,
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new(MAX_METRICS_PER_BATCH)
    }
}

impl BatchAccumulator {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "batch capacity must be positive");
        Self {
            capacity,
            buffer: Vec::new(),
        }
    }

    /// Appends one candidate batch, returning the batches that became due.
    ///
    /// Normally returns nothing or the previously buffered batch. A
    /// candidate that alone reaches the capacity is additionally split
    /// into capacity-sized chunks, flushed in order; only the tail stays
    /// buffered. The caller must write every returned batch before
    /// appending more.
    pub fn append(&mut self, candidate: MetricBatch) -> Vec<MetricBatch> {
        let mut flushed = Vec::new();

        if self.buffer.len() + candidate.len() >= self.capacity {
            flushed.push(mem::replace(&mut self.buffer, candidate));
            // An oversized candidate must not ride along past the cap.
            while self.buffer.len() >= self.capacity {
                let tail = self.buffer.split_off(self.capacity);
                flushed.push(mem::replace(&mut self.buffer, tail));
            }
            flushed.retain(|batch| !batch.is_empty());
        } else {
            self.buffer.extend(candidate);
        }

        flushed
    }

    /// Takes the remainder at stream end.
    ///
    /// The caller performs the final flush unconditionally, even when a
    /// record set lands exactly on a capacity multiple and the remainder
    /// is empty. A non-empty remainder is never silently dropped.
    pub fn finish(&mut self) -> MetricBatch {
        mem::take(&mut self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
