//! Update queue between the ingestion side and the batch processor.
//!
//! Guarantees:
//! - Producers never block: push is a synchronous append.
//! - FIFO: a drain pops records in the order they were enqueued.
//! - The queue is unbounded; the drain cadence and batch cap bound the
//!   downstream work instead.

pub mod batch;

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::market::types::UpdateRecord;

#[derive(Default)]
pub struct UpdateQueue {
    inner: Mutex<VecDeque<UpdateRecord>>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: UpdateRecord) {
        self.inner.lock().push_back(record);
    }

    /// Pop up to `max` records, oldest first.
    pub fn drain(&self, max: usize) -> Vec<UpdateRecord> {
        let mut g = self.inner.lock();
        let n = g.len().min(max);
        g.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
