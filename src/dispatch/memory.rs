use crate::dispatch::{Job, JobQueue};
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A job with its insertion sequence number
struct QueuedJob {
    seq: u64,
    job: Job,
}

// Higher priority pops first; among equals the lower sequence number
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
}

/// In-process job queue for tests and single-process runs
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobQueue for MemoryQueue {
    fn enqueue(&self, job: Job) -> Result<()> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedJob { seq, job });
        Ok(())
    }

    fn dequeue(&self) -> Result<Option<Job>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        // Pop in priority order until a ready job shows up
        let mut not_ready = Vec::new();
        let mut found = None;
        while let Some(queued) = inner.heap.pop() {
            if queued.job.is_ready(now) {
                found = Some(queued.job);
                break;
            }
            not_ready.push(queued);
        }
        inner.heap.extend(not_ready);

        Ok(found)
    }

    fn cancel(&self, dataset: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        let before = inner.heap.len();
        inner.heap.retain(|queued| queued.job.dataset != dataset);
        Ok(before - inner.heap.len())
    }

    fn pending(&self, dataset: Option<&str>) -> Result<usize> {
        let inner = self.inner.lock();
        Ok(match dataset {
            Some(dataset) => inner
                .heap
                .iter()
                .filter(|queued| queued.job.dataset == dataset)
                .count(),
            None => inner.heap.len(),
        })
    }

    fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock();
        Ok(inner.heap.iter().map(|queued| queued.job.not_before).min())
    }
}
