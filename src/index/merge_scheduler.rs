//! Merge execution
//!
//! The writer registers merges in a [`MergeQueue`]; a scheduler decides on
//! which threads they run. Schedulers only pull merges from a
//! [`MergeSource`] and hand them back for execution, so merge failures are
//! handled by the source and never reach the scheduler.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

use super::merge_policy::{MergeSpecification, MergeTrigger, OneMerge};
use crate::config::MergeSchedulerConfig;

/// A registered merge
#[derive(Clone, Debug)]
pub(crate) struct QueuedMerge {
    pub(crate) id: u64,
    pub(crate) merge: OneMerge,
    pub(crate) abort: Arc<AtomicBool>,
}

impl QueuedMerge {
    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn is_forced(&self) -> bool {
        self.merge.max_num_segments.is_some()
    }
}

/// Tracks pending and running merges
#[derive(Debug)]
pub(crate) struct MergeQueue {
    pending: Vec<QueuedMerge>,
    running: Vec<QueuedMerge>,
    max_concurrent: usize,
    next_id: u64,
}

impl MergeQueue {
    pub(crate) fn new(max_concurrent: usize) -> Self {
        Self {
            pending: Vec::new(),
            running: Vec::new(),
            max_concurrent: max_concurrent.max(1),
            next_id: 1,
        }
    }

    /// Register merges; returns the ids of those accepted
    ///
    /// A merge sharing a segment with any pending or running merge is
    /// rejected.
    pub(crate) fn add_candidates(&mut self, spec: MergeSpecification) -> Vec<u64> {
        let mut accepted = Vec::new();
        for candidate in spec.merges {
            let overlaps = self
                .pending
                .iter()
                .chain(self.running.iter())
                .any(|queued| queued.merge.overlaps(&candidate));
            if overlaps {
                debug!(merge = %candidate, "merge overlaps a registered merge; skipped");
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            accepted.push(id);
            self.pending.push(QueuedMerge {
                id,
                merge: candidate,
                abort: Arc::new(AtomicBool::new(false)),
            });
        }

        // highest score first; stable for ties
        self.pending.sort_by(|a, b| {
            b.merge
                .score
                .partial_cmp(&a.merge.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        accepted
    }

    /// Get the next merge to execute (if any)
    pub(crate) fn next_merge(&mut self) -> Option<QueuedMerge> {
        if self.running.len() >= self.max_concurrent || self.pending.is_empty() {
            return None;
        }
        let queued = self.pending.remove(0);
        self.running.push(queued.clone());
        Some(queued)
    }

    /// Mark a merge as complete
    pub(crate) fn complete_merge(&mut self, id: u64) -> Option<QueuedMerge> {
        let pos = self.running.iter().position(|m| m.id == id)?;
        Some(self.running.remove(pos))
    }

    /// Segments taking part in a registered merge
    pub(crate) fn merging_segments(&self) -> HashSet<String> {
        self.pending
            .iter()
            .chain(self.running.iter())
            .flat_map(|m| m.merge.segments.iter().cloned())
            .collect()
    }

    /// Drop pending merges and flag running ones; returns the dropped ones
    pub(crate) fn abort_all(&mut self) -> Vec<QueuedMerge> {
        for running in &self.running {
            running.abort.store(true, Ordering::SeqCst);
        }
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    pub(crate) fn running_count(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Supplies and executes merges
pub(crate) trait MergeSource: Send + Sync {
    fn next_merge(&self) -> Option<QueuedMerge>;

    /// Run and publish `merge`; failures are handled here
    fn run_merge(&self, merge: QueuedMerge);

    fn has_pending_merges(&self) -> bool;
}

/// Decides where merges run
pub(crate) trait MergeScheduler: Send + Sync + fmt::Debug {
    /// Run whatever `source` has pending
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger);

    /// Upper bound on merges running at once
    fn max_concurrent(&self) -> usize;

    /// Stop accepting work and wait for workers to exit
    fn close(&self);
}

impl MergeSchedulerConfig {
    pub(crate) fn build(&self) -> Box<dyn MergeScheduler> {
        match self {
            MergeSchedulerConfig::Serial => Box::new(SerialMergeScheduler::new()),
            MergeSchedulerConfig::Concurrent { max_threads } => {
                Box::new(ConcurrentMergeScheduler::new(*max_threads))
            }
        }
    }
}

/// Runs merges one at a time on the calling thread
#[derive(Debug, Default)]
pub(crate) struct SerialMergeScheduler {
    running: Mutex<()>,
}

impl SerialMergeScheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl MergeScheduler for SerialMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) {
        loop {
            // another thread already drains the queue
            let Some(guard) = self.running.try_lock() else {
                return;
            };
            while let Some(merge) = source.next_merge() {
                debug!(merge_id = merge.id, ?trigger, "running merge inline");
                source.run_merge(merge);
            }
            drop(guard);
            if !source.has_pending_merges() {
                return;
            }
        }
    }

    fn max_concurrent(&self) -> usize {
        1
    }

    fn close(&self) {
        // wait for an inline merge on another thread
        drop(self.running.lock());
    }
}

/// Runs merges on a fixed set of background threads
pub(crate) struct ConcurrentMergeScheduler {
    tx: Mutex<Option<Sender<Arc<dyn MergeSource>>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    max_threads: usize,
}

impl ConcurrentMergeScheduler {
    pub(crate) fn new(max_threads: usize) -> Self {
        let max_threads = max_threads.max(1);
        let (tx, rx) = channel::unbounded::<Arc<dyn MergeSource>>();
        let workers = (0..max_threads)
            .filter_map(|i| Self::spawn_worker(i, rx.clone()))
            .collect();
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            max_threads,
        }
    }

    fn spawn_worker(
        index: usize,
        rx: Receiver<Arc<dyn MergeSource>>,
    ) -> Option<thread::JoinHandle<()>> {
        let spawned = thread::Builder::new()
            .name(format!("segdex-merge-{}", index))
            .spawn(move || {
                while let Ok(source) = rx.recv() {
                    while let Some(merge) = source.next_merge() {
                        debug!(worker = index, merge_id = merge.id, "running merge");
                        source.run_merge(merge);
                    }
                }
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(worker = index, error = %e, "failed to spawn merge thread");
                None
            }
        }
    }
}

impl fmt::Debug for ConcurrentMergeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMergeScheduler")
            .field("max_threads", &self.max_threads)
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return;
        };
        if self.workers.lock().is_empty() {
            // no worker could be started; degrade to inline execution
            while let Some(merge) = source.next_merge() {
                source.run_merge(merge);
            }
            return;
        }
        debug!(?trigger, "waking merge workers");
        for _ in 0..self.max_threads {
            if tx.send(source.clone()).is_err() {
                break;
            }
        }
    }

    fn max_concurrent(&self) -> usize {
        self.max_threads
    }

    fn close(&self) {
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!("merge thread panicked");
            }
        }
    }
}

impl Drop for ConcurrentMergeScheduler {
    fn drop(&mut self) {
        self.close();
    }
}
