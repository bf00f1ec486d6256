use ratesync_core::EntityRecord;
use ratesync_storage::{EntityStore, StoreError};
use serde::Serialize;
use tracing::{error, info};

/// Groups reconciled rows into fixed-size batches.
#[derive(Debug)]
pub struct BatchAccumulator<T> {
    batch_size: usize,
    pending: Vec<T>,
}

impl<T> BatchAccumulator<T> {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Add one row; returns a full batch once the threshold is reached.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.pending.push(item);
        if self.pending.len() >= self.batch_size {
            let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
            return Some(full);
        }
        None
    }

    /// Hand back whatever is left at end of pass.
    pub fn finish(&mut self) -> Option<Vec<T>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    pub batches_committed: usize,
    pub batches_failed: usize,
    pub rows_committed: usize,
    pub rows_lost: usize,
}

/// Single writer for a pass. Each batch is one transaction: it commits whole
/// or is lost whole. Only connection-level failures escape `flush`.
pub struct Upserter<'a> {
    store: &'a dyn EntityStore,
    stats: FlushStats,
}

impl<'a> Upserter<'a> {
    pub fn new(store: &'a dyn EntityStore) -> Self {
        Self {
            store,
            stats: FlushStats::default(),
        }
    }

    /// Returns whether the batch was committed.
    pub async fn flush(&mut self, batch: Vec<EntityRecord>) -> Result<bool, StoreError> {
        if batch.is_empty() {
            return Ok(false);
        }
        let rows = batch.len();
        match self.store.upsert_batch(&batch).await {
            Ok(_) => {
                self.stats.batches_committed += 1;
                self.stats.rows_committed += rows;
                info!(rows, batch = self.stats.batches_committed, "batch committed");
                Ok(true)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                error!(rows, error = %err, "batch lost; rows will be picked up by a later pass");
                self.record_lost(rows);
                Ok(false)
            }
        }
    }

    /// Count rows that never reached the store, e.g. when their base records
    /// could not be read.
    pub fn record_lost(&mut self, rows: usize) {
        self.stats.batches_failed += 1;
        self.stats.rows_lost += rows;
    }

    pub fn stats(&self) -> FlushStats {
        self.stats
    }
}
