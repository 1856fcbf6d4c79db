//! The index writer
//!
//! Documents enter through the [`DocumentsWriter`]; buffers it selects for
//! flushing are written here and published into the in-memory segment
//! list. Buffered deletes are resolved against published segments lazily,
//! merges are registered from the merge policy and run by the configured
//! scheduler, and commits are written in two phases so a failure leaves the
//! previous commit point current.
//!
//! Lock order: `commit_lock`, then `state`. The flush controller and delete
//! queue have their own short locks and are never held while `state` is
//! taken.

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::commit::IndexCommit;
use super::delete_queue::DeleteEntry;
use super::deletion_policy::{IndexDeletionPolicy, KeepOnlyLastCommit};
use super::documents_writer::{DocumentsWriter, FlushedSegment, PendingWork};
use super::events::{EventSink, IndexEvent, IndexEventListener};
use super::file_deleter::IndexFileDeleter;
use super::file_names::{
    live_docs_file_name, parse_base36, segment_name, segment_of, LIVE_DOCS_EXTENSION,
};
use super::flush_control::FlushController;
use super::merge_policy::{MergePolicy, MergeReason, MergeTrigger};
use super::merge_scheduler::{MergeQueue, MergeScheduler, MergeSource, QueuedMerge};
use super::merger::{MergeInput, MergedSegment, SegmentMerger};
use super::segment_info::SegmentCommitInfo;
use super::segment_infos::{last_commit_generation, SegmentInfos};
use super::thread_buffer::ThreadBuffer;
use crate::codec::{Codec, DefaultCodec, SegmentCore};
use crate::config::{OpenMode, WriterConfig};
use crate::document::{DeleteQuery, Document, Term};
use crate::error::{IndexError, Result};
use crate::store::{Directory, Lock, WRITE_LOCK_NAME};

/// Where the writer is in its commit cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterPhase {
    Idle,
    Flushing,
    PreparedCommit,
    Committed,
    RolledBack,
    Closed,
}

/// Live collaborators supplied when opening a writer
#[derive(Clone)]
pub struct WriterOptions {
    deletion_policy: Arc<dyn IndexDeletionPolicy>,
    codec: Arc<dyn Codec>,
    index_commit: Option<IndexCommit>,
    listener: Option<Arc<dyn IndexEventListener>>,
    merge_policy: Option<Arc<dyn MergePolicy>>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            deletion_policy: Arc::new(KeepOnlyLastCommit),
            codec: Arc::new(DefaultCodec),
            index_commit: None,
            listener: None,
            merge_policy: None,
        }
    }
}

impl WriterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deletion_policy(mut self, policy: Arc<dyn IndexDeletionPolicy>) -> Self {
        self.deletion_policy = policy;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Open on a historical commit instead of the newest one
    pub fn with_index_commit(mut self, commit: IndexCommit) -> Self {
        self.index_commit = Some(commit);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn IndexEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Use this policy instead of the one named in the config
    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = Some(policy);
        self
    }
}

/// A published segment with everything needed to resolve deletes and merge
#[derive(Clone, Debug)]
struct LiveSegment {
    core: Arc<SegmentCore>,
    deleted: Arc<RoaringBitmap>,
    /// Per-doc sequence numbers; empty means every doc came from disk
    doc_seqs: Arc<Vec<u64>>,
    /// Delete log position applied so far
    resolved_upto: u64,
    /// Deletions not yet written to a live-docs file
    dirty: bool,
    next_del_gen: u64,
    /// Segment size without its live-docs file
    base_size: u64,
}

#[derive(Debug)]
struct PendingCommit {
    infos: SegmentInfos,
    pending_file: String,
    files: Vec<String>,
}

struct WriterState {
    infos: SegmentInfos,
    pool: HashMap<String, LiveSegment>,
    deleter: IndexFileDeleter,
    merges: MergeQueue,
    /// Segments a forced merge must consolidate; false for its own outputs
    segments_to_merge: HashMap<String, bool>,
    /// Failures of forced merges, drained by the caller that forced them
    merge_errors: Vec<String>,
    pending_commit: Option<PendingCommit>,
    /// A failed commit attempt burns its generation
    last_attempted_gen: u64,
    committed_version: u64,
    phase: WriterPhase,
}

impl WriterState {
    fn checkpoint(&mut self) {
        if let Err(e) = self.deleter.checkpoint(&self.infos, false) {
            warn!(error = %e, "checkpoint failed");
        }
    }

    fn merges_idle(&self) -> bool {
        !self.merges.has_pending() && !self.merges.has_running()
    }

    fn new_segment_name(&mut self) -> String {
        let name = segment_name(self.infos.counter);
        self.infos.counter += 1;
        name
    }
}

/// One segment of a near-real-time view
pub(crate) struct NrtSegment {
    pub(crate) info: SegmentCommitInfo,
    pub(crate) core: Arc<SegmentCore>,
    pub(crate) deleted: Arc<RoaringBitmap>,
}

/// The writer's segment list at one instant
pub(crate) struct NrtSnapshot {
    pub(crate) infos: SegmentInfos,
    pub(crate) segments: Vec<NrtSegment>,
}

pub(crate) struct WriterInner {
    dir: Arc<dyn Directory>,
    config: WriterConfig,
    codec: Arc<dyn Codec>,
    merge_policy: Arc<dyn MergePolicy>,
    docs_writer: DocumentsWriter,
    state: Mutex<WriterState>,
    merges_done: Condvar,
    commit_lock: Mutex<()>,
    /// Infos of the last successful commit
    last_committed: ArcSwap<SegmentInfos>,
    closing: AtomicBool,
    closed: AtomicBool,
    events: EventSink,
    write_lock: Mutex<Option<Box<dyn Lock>>>,
    flush_count: AtomicU64,
}

/// Adds, updates and deletes documents, then publishes them as commits
///
/// Safe to share between indexing threads. Only one writer may be open
/// per directory; the second fails with [`IndexError::LockObtainFailed`].
/// Dropping an open writer rolls back its uncommitted changes.
pub struct IndexWriter {
    inner: Arc<WriterInner>,
    scheduler: Box<dyn MergeScheduler>,
}

impl IndexWriter {
    pub fn open(dir: Arc<dyn Directory>, config: WriterConfig) -> Result<Self> {
        Self::open_with(dir, config, WriterOptions::default())
    }

    pub fn open_with(
        dir: Arc<dyn Directory>,
        config: WriterConfig,
        options: WriterOptions,
    ) -> Result<Self> {
        config.validate()?;
        let lock = dir.obtain_lock(WRITE_LOCK_NAME)?;
        let events = EventSink::new(options.listener.clone());
        let files = dir.list_all()?;
        let latest = last_commit_generation(&files);

        let (mut infos, changed) = match (&options.index_commit, config.open_mode, latest) {
            (Some(_), OpenMode::Create, _) => {
                return Err(IndexError::InvalidConfiguration(
                    "cannot open a historical commit in Create mode".to_string(),
                ))
            }
            (Some(commit), _, _) => {
                // reopening an older commit publishes a new one on commit
                (commit.infos().clone(), Some(commit.generation()) != latest)
            }
            (None, OpenMode::Create, latest) => {
                let mut infos = SegmentInfos::new();
                if let Some(generation) = latest {
                    infos.generation = generation;
                    // keep numbering even if the old commit is unreadable
                    if let Ok(previous) = SegmentInfos::read_latest(dir.as_ref()) {
                        infos.version = previous.version;
                        infos.counter = previous.counter;
                    }
                }
                (infos, true)
            }
            (None, OpenMode::Append, None) => {
                return Err(IndexError::IndexNotFound(format!(
                    "no segments_N file in {:?}",
                    dir
                )))
            }
            (None, _, Some(_)) => (SegmentInfos::read_latest(dir.as_ref())?, false),
            (None, OpenMode::CreateOrAppend, None) => (SegmentInfos::new(), false),
        };
        infos.counter = infos.counter.max(next_free_segment_counter(&files));
        let committed = infos.clone();
        let committed_version = infos.version;
        if changed {
            infos.changed();
        }

        let mut pool = HashMap::with_capacity(infos.len());
        for info in &infos.segments {
            pool.insert(
                info.name().to_string(),
                load_segment(dir.as_ref(), options.codec.as_ref(), info, &files)?,
            );
        }

        let deleter = IndexFileDeleter::new(
            dir.clone(),
            options.deletion_policy.clone(),
            &infos,
            events.clone(),
        )?;
        let merge_policy = options
            .merge_policy
            .clone()
            .unwrap_or_else(|| config.merge_policy.build());
        let scheduler = config.merge_scheduler.build();
        let docs_writer =
            DocumentsWriter::new(&config, dir.clone(), options.codec.clone(), events.clone())?;

        info!(
            mode = ?config.open_mode,
            generation = infos.generation,
            segments = infos.len(),
            merge_policy = merge_policy.name(),
            "index writer opened"
        );

        let state = WriterState {
            last_attempted_gen: latest.unwrap_or(0).max(infos.generation),
            infos,
            pool,
            deleter,
            merges: MergeQueue::new(scheduler.max_concurrent()),
            segments_to_merge: HashMap::new(),
            merge_errors: Vec::new(),
            pending_commit: None,
            committed_version,
            phase: WriterPhase::Idle,
        };

        Ok(Self {
            inner: Arc::new(WriterInner {
                dir,
                config,
                codec: options.codec,
                merge_policy,
                docs_writer,
                state: Mutex::new(state),
                merges_done: Condvar::new(),
                commit_lock: Mutex::new(()),
                last_committed: ArcSwap::from_pointee(committed),
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events,
                write_lock: Mutex::new(Some(lock)),
                flush_count: AtomicU64::new(0),
            }),
            scheduler,
        })
    }

    fn source(&self) -> Arc<dyn MergeSource> {
        self.inner.clone()
    }

    pub(crate) fn downgrade(&self) -> Weak<WriterInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn add_document(&self, doc: Document) -> Result<()> {
        self.update_internal(doc, None)
    }

    /// Atomically delete documents matching `term`, then add `doc`
    pub fn update_document(&self, term: Term, doc: Document) -> Result<()> {
        self.update_internal(doc, Some(term))
    }

    fn update_internal(&self, doc: Document, term: Option<Term>) -> Result<()> {
        self.inner.ensure_open()?;
        let work = self.inner.docs_writer.update_document(doc, term)?;
        self.process_work(work)
    }

    pub fn delete_documents(&self, term: Term) -> Result<()> {
        self.delete_by_query(DeleteQuery::Term(term))
    }

    pub fn delete_by_query(&self, query: DeleteQuery) -> Result<()> {
        self.inner.ensure_open()?;
        let work = self.inner.docs_writer.delete(query);
        self.process_work(work)
    }

    /// Flush buffers the flush control handed back and apply deletes it
    /// asked for
    fn process_work(&self, work: PendingWork) -> Result<()> {
        if work.is_empty() {
            return Ok(());
        }
        let flushed = !work.buffers.is_empty();
        let mut first_error = None;
        for buffer in work.buffers {
            if let Err(e) = self.inner.flush_buffer(buffer) {
                first_error.get_or_insert(e);
            }
        }
        if work.apply_deletes {
            self.inner.apply_all_deletes()?;
        }
        if flushed {
            self.maybe_merge_with(MergeTrigger::SegmentFlush);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flush every buffered document into segments and apply deletes
    ///
    /// Nothing becomes durable until [`commit`](Self::commit).
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.flush_all()?;
        self.inner.apply_all_deletes()?;
        self.maybe_merge_with(MergeTrigger::FullFlush);
        Ok(())
    }

    /// Phase one of a commit: flush, then durably write the next commit
    /// point without publishing it
    pub fn prepare_commit(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let _commit = self.inner.commit_lock.lock();
        self.inner.ensure_not_closed()?;
        self.inner.prepare_commit_locked()
    }

    /// Publish every change made so far as a new commit point
    ///
    /// Finishes a pending [`prepare_commit`](Self::prepare_commit) if there
    /// is one. Concurrent commits are serialized. On failure the previous
    /// commit stays current and the call can be retried.
    pub fn commit(&self) -> Result<()> {
        self.inner.ensure_open()?;
        {
            let _commit = self.inner.commit_lock.lock();
            self.inner.ensure_not_closed()?;
            self.inner.commit_locked()?;
        }
        self.maybe_merge_with(MergeTrigger::FullFlush);
        Ok(())
    }

    /// User data stored with the next commit
    pub fn set_commit_data(&self, data: BTreeMap<String, String>) {
        let mut state = self.inner.state.lock();
        state.infos.user_data = data;
        state.infos.changed();
    }

    pub fn commit_data(&self) -> BTreeMap<String, String> {
        self.inner.state.lock().infos.user_data.clone()
    }

    /// Discard everything since the last commit and close the writer
    ///
    /// The directory is left exactly at the last published commit. Safe to
    /// call while another thread commits: whichever takes the commit lock
    /// first wins and the other sees [`IndexError::AlreadyClosed`].
    pub fn rollback(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.rollback_internal()
    }

    fn rollback_internal(&self) -> Result<()> {
        let _commit = self.inner.commit_lock.lock();
        self.abort_merges();
        self.scheduler.close();
        let discarded = self.inner.docs_writer.abort();
        self.inner.docs_writer.flush_control().set_closed();

        let committed = self.inner.last_committed.load_full();
        let result = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if let Some(pending) = state.pending_commit.take() {
                state.deleter.dec_ref_files(&pending.files);
                state.deleter.delete_if_unreferenced(&pending.pending_file);
            }
            state.infos = (*committed).clone();
            state.pool.clear();
            state.segments_to_merge.clear();
            let result = state
                .deleter
                .checkpoint(&state.infos, false)
                .and_then(|_| state.deleter.refresh());
            state.deleter.close();
            state.phase = WriterPhase::RolledBack;
            result
        };

        info!(
            generation = committed.generation,
            discarded_docs = discarded,
            "rolled back to last commit"
        );
        self.inner.events.emit(IndexEvent::RolledBack {
            generation: committed.generation,
        });
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.release_write_lock();
        result
    }

    /// Commit (when `commit_on_close` is set) after waiting for running
    /// merges, then release the directory
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.inner.config.commit_on_close {
            return self.rollback();
        }
        self.flush()?;
        self.wait_for_merges()?;
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _commit = self.inner.commit_lock.lock();
        if let Err(e) = self.inner.commit_locked() {
            // still open; the caller may retry or roll back
            self.inner.closing.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.abort_merges();
        self.scheduler.close();
        self.inner.docs_writer.flush_control().set_closed();
        {
            let mut state = self.inner.state.lock();
            state.deleter.close();
            state.phase = WriterPhase::Closed;
        }
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.release_write_lock();
        info!("index writer closed");
        self.inner.events.emit(IndexEvent::Closed);
        Ok(())
    }

    /// Merge down to at most `max_num_segments` segments, blocking until
    /// done
    ///
    /// Segments larger than the policy's forced-merge bound are left
    /// standalone, so the result may hold more segments than requested.
    pub fn force_merge(&self, max_num_segments: usize) -> Result<()> {
        self.inner.ensure_open()?;
        if max_num_segments == 0 {
            return Err(IndexError::InvalidConfiguration(
                "max_num_segments must be >= 1".to_string(),
            ));
        }
        info!(max_num_segments, "force merge");
        self.flush()?;
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.merge_errors.clear();
            state.segments_to_merge = state
                .infos
                .segments
                .iter()
                .map(|s| (s.name().to_string(), true))
                .collect();
        }

        let result = self.run_forced_merges(max_num_segments);
        self.inner.state.lock().segments_to_merge.clear();
        result
    }

    fn run_forced_merges(&self, max_num_segments: usize) -> Result<()> {
        loop {
            self.inner.ensure_open()?;
            let accepted = {
                let mut guard = self.inner.state.lock();
                let state = &mut *guard;
                let merging = state.merges.merging_segments();
                let mut spec = self.inner.merge_policy.find_forced_merges(
                    &state.infos.segments,
                    max_num_segments,
                    &state.segments_to_merge,
                    &merging,
                );
                for merge in spec.merges.iter_mut() {
                    merge.max_num_segments = Some(max_num_segments);
                }
                !state.merges.add_candidates(spec).is_empty()
            };
            if !accepted && !self.inner.has_merges() {
                return Ok(());
            }
            self.wait_for_merges()?;
            self.inner.take_merge_errors()?;
        }
    }

    /// Merge away deleted documents, blocking until done
    pub fn force_merge_deletes(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.flush()?;
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.merge_errors.clear();
            let merging = state.merges.merging_segments();
            let spec = self
                .inner
                .merge_policy
                .find_forced_deletes_merges(&state.infos.segments, &merging);
            let accepted = state.merges.add_candidates(spec);
            debug!(merges = accepted.len(), "forced deletes merges registered");
        }
        self.wait_for_merges()?;
        self.inner.take_merge_errors()
    }

    /// Ask the merge policy for natural merges and start them
    pub fn maybe_merge(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.maybe_merge_with(MergeTrigger::Explicit);
        Ok(())
    }

    fn maybe_merge_with(&self, trigger: MergeTrigger) {
        if self.inner.register_merges(trigger) {
            self.scheduler.merge(self.source(), trigger);
        }
    }

    /// Block until no merge is pending or running
    pub fn wait_for_merges(&self) -> Result<()> {
        self.inner.ensure_open()?;
        loop {
            self.scheduler.merge(self.source(), MergeTrigger::Explicit);
            if self.inner.wait_merges_idle(Duration::from_millis(100)) {
                return Ok(());
            }
        }
    }

    /// Drop pending merges, flag running ones and wait for them to stop
    fn abort_merges(&self) {
        loop {
            let aborted = self.inner.state.lock().merges.abort_all();
            for queued in aborted {
                debug!(merge_id = queued.id, "pending merge dropped");
                self.inner.events.emit(IndexEvent::MergeAborted {
                    merge_id: queued.id,
                    segments: queued.merge.segments.clone(),
                    reason: "merges aborted".to_string(),
                });
            }
            if self.inner.wait_merges_idle(Duration::from_millis(100)) {
                return;
            }
        }
    }

    /// Remove every document, buffered or published
    ///
    /// Takes effect for readers and on disk at the next commit.
    pub fn delete_all(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let _commit = self.inner.commit_lock.lock();
        self.abort_merges();
        let discarded = self.inner.docs_writer.abort();
        self.inner.docs_writer.resume();
        {
            let mut state = self.inner.state.lock();
            state.infos.segments.clear();
            state.pool.clear();
            state.segments_to_merge.clear();
            state.infos.changed();
            state.checkpoint();
            state.phase = WriterPhase::Idle;
        }
        self.inner.prune_deletes();
        info!(discarded_docs = discarded, "deleted all documents");
        Ok(())
    }

    /// Re-run the deletion policy, e.g. after releasing a snapshot, and
    /// delete whatever it frees
    pub fn delete_unused_files(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let mut state = self.inner.state.lock();
        state.deleter.revisit_policy()?;
        state.deleter.delete_pending_files();
        Ok(())
    }

    /// Flush and expose the current segments without committing
    pub(crate) fn nrt_snapshot(&self, apply_all_deletes: bool) -> Result<NrtSnapshot> {
        let snapshot = self.inner.nrt_snapshot(apply_all_deletes)?;
        self.maybe_merge_with(MergeTrigger::FullFlush);
        Ok(snapshot)
    }

    /// Buffered plus published live documents
    pub fn num_docs(&self) -> u64 {
        let buffered = self.inner.docs_writer.num_buffered_docs() as u64;
        buffered + self.inner.state.lock().infos.total_live_docs()
    }

    /// Like [`num_docs`](Self::num_docs) but counting deleted documents
    pub fn max_doc(&self) -> u64 {
        let buffered = self.inner.docs_writer.num_buffered_docs() as u64;
        buffered + self.inner.state.lock().infos.total_max_doc()
    }

    /// Documents buffered in RAM, not yet flushed
    pub fn num_ram_docs(&self) -> usize {
        self.inner.docs_writer.num_buffered_docs()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().infos.len()
    }

    /// Segments flushed since the writer opened
    pub fn flush_count(&self) -> u64 {
        self.inner.flush_count.load(Ordering::SeqCst)
    }

    /// Merges registered or running
    pub fn pending_merge_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.merges.pending_count() + state.merges.running_count()
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        let changed = {
            let state = self.inner.state.lock();
            state.infos.version != state.committed_version
        };
        changed || self.inner.docs_writer.any_changes()
    }

    /// Buffered documents plus buffered deletes
    pub fn ram_bytes_used(&self) -> u64 {
        self.inner.docs_writer.flush_control().net_bytes()
            + self.inner.docs_writer.delete_queue().ram_bytes_used()
    }

    /// Read-only RAM and flush statistics
    pub fn flush_controller(&self) -> &FlushController {
        self.inner.docs_writer.flush_control()
    }

    /// Copy of the in-memory segment list
    pub fn segment_infos(&self) -> SegmentInfos {
        self.inner.state.lock().infos.clone()
    }

    pub fn phase(&self) -> WriterPhase {
        self.inner.state.lock().phase
    }

    /// Newest commit point the writer knows of
    pub fn last_commit(&self) -> Option<IndexCommit> {
        self.inner.state.lock().deleter.last_commit().cloned()
    }

    /// Commit points currently kept by the deletion policy, oldest first
    pub fn commits(&self) -> Vec<IndexCommit> {
        self.inner.state.lock().deleter.commits().to_vec()
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.inner.dir
    }

    pub fn config(&self) -> &WriterConfig {
        &self.inner.config
    }

    pub(crate) fn codec(&self) -> Arc<dyn Codec> {
        self.inner.codec.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.rollback() {
                warn!(error = %e, "rollback on drop failed");
            }
        }
    }
}

impl fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriter")
            .field("dir", &self.inner.dir)
            .field("scheduler", &self.scheduler)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WriterInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(IndexError::already_closed("IndexWriter"));
        }
        Ok(())
    }

    /// Checked again once the commit lock is held: a rollback may have won
    fn ensure_not_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IndexError::already_closed("IndexWriter"));
        }
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn release_write_lock(&self) {
        if let Some(lock) = self.write_lock.lock().take() {
            debug!(lock = lock.name(), "write lock released");
        }
    }

    fn set_phase(&self, phase: WriterPhase) {
        self.state.lock().phase = phase;
    }

    /// Write `buffer` as a segment and publish it
    ///
    /// The flush controller is told the buffer is done on every path; a
    /// failed flush drops the buffer's documents and its partial files.
    fn flush_buffer(&self, buffer: ThreadBuffer) -> Result<()> {
        let id = buffer.id();
        let name = self.state.lock().new_segment_name();
        let result = self
            .docs_writer
            .flush_buffer(buffer, &name)
            .and_then(|flushed| match flushed {
                Some(flushed) => self.publish_flushed(flushed),
                None => Ok(()),
            });
        if let Err(e) = &result {
            warn!(segment = %name, error = %e, "flush failed; buffered documents dropped");
            self.state.lock().deleter.delete_new_segment_files(&name);
            self.events.emit(IndexEvent::FlushFailed {
                segment: name.clone(),
                message: e.to_string(),
            });
        }
        self.docs_writer.flush_control().do_after_flush(id);
        self.prune_deletes();
        result
    }

    fn publish_flushed(&self, flushed: FlushedSegment) -> Result<()> {
        let FlushedSegment {
            buffer_id,
            info,
            core,
            deleted,
            doc_seqs,
            resolved_upto,
        } = flushed;
        let name = info.name().to_string();
        let docs = info.max_doc();
        let del_count = info.del_count;
        let bytes = info.size_in_bytes;
        {
            let mut state = self.state.lock();
            state.pool.insert(
                name.clone(),
                LiveSegment {
                    core,
                    deleted: Arc::new(deleted),
                    doc_seqs: Arc::new(doc_seqs),
                    resolved_upto,
                    dirty: del_count > 0,
                    next_del_gen: 1,
                    base_size: bytes,
                },
            );
            state.infos.segments.push(info);
            state.infos.changed();
            state.checkpoint();
        }
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        debug!(
            segment = %name,
            buffer = buffer_id,
            docs,
            deleted = del_count,
            bytes,
            "flushed segment"
        );
        self.events.emit(IndexEvent::Flushed {
            segment: name,
            docs,
            deleted: del_count,
            bytes,
        });
        Ok(())
    }

    /// Flush every buffer holding documents, waiting for flushes other
    /// threads have in flight
    fn flush_all(&self) -> Result<()> {
        self.set_phase(WriterPhase::Flushing);
        let result = self.docs_writer.full_flush(|buffers| {
            let mut first_error = None;
            for buffer in buffers {
                if let Err(e) = self.flush_buffer(buffer) {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        });
        let mut state = self.state.lock();
        if state.phase == WriterPhase::Flushing {
            state.phase = if state.pending_commit.is_some() {
                WriterPhase::PreparedCommit
            } else {
                WriterPhase::Idle
            };
        }
        result
    }

    /// Resolve every buffered delete against published segments
    pub(crate) fn apply_all_deletes(&self) -> Result<()> {
        let queue = self.docs_writer.delete_queue();
        let end = queue.end();
        let mut touched = 0usize;
        let mut docs_deleted = 0u64;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for info in state.infos.segments.iter_mut() {
                let Some(live) = state.pool.get_mut(info.name()) else {
                    continue;
                };
                if live.resolved_upto >= end {
                    continue;
                }
                let entries = queue.slice(live.resolved_upto, end);
                live.resolved_upto = end;
                let hits = resolve_deletes(&live.core, &live.doc_seqs, &live.deleted, &entries);
                if hits.is_empty() {
                    continue;
                }
                let mut deleted = (*live.deleted).clone();
                deleted |= &hits;
                info.del_count = deleted.len() as u32;
                live.deleted = Arc::new(deleted);
                live.dirty = true;
                touched += 1;
                docs_deleted += hits.len();
            }
            queue.mark_applied();
            if touched > 0 {
                state.infos.changed();
                drop_fully_deleted(state);
                state.checkpoint();
            }
        }
        self.prune_deletes();
        if touched > 0 {
            debug!(segments = touched, docs = docs_deleted, "applied buffered deletes");
            self.events.emit(IndexEvent::DeletesApplied {
                segments_touched: touched,
                docs_deleted,
            });
        }
        Ok(())
    }

    /// Drop delete log entries nothing needs anymore
    fn prune_deletes(&self) {
        let queue = self.docs_writer.delete_queue();
        let mut upto = queue.end();
        if let Some(start) = self.docs_writer.flush_control().min_delete_start() {
            upto = upto.min(start);
        }
        let state = self.state.lock();
        if let Some(resolved) = state.pool.values().map(|s| s.resolved_upto).min() {
            upto = upto.min(resolved);
        }
        queue.prune(upto);
    }

    /// Write live-docs files for segments whose deletions changed
    fn write_live_docs(&self, state: &mut WriterState) -> Result<()> {
        let mut result = Ok(());
        let mut wrote = false;
        for info in state.infos.segments.iter_mut() {
            let Some(live) = state.pool.get_mut(info.name()) else {
                continue;
            };
            if !live.dirty {
                continue;
            }
            let del_gen = live.next_del_gen;
            live.next_del_gen += 1;
            match self
                .codec
                .write_live_docs(self.dir.as_ref(), info.name(), del_gen, &live.deleted)
            {
                Ok((file, len)) => {
                    info.del_gen = Some(del_gen);
                    info.del_count = live.deleted.len() as u32;
                    info.size_in_bytes = live.base_size + len;
                    live.dirty = false;
                    wrote = true;
                    debug!(segment = info.name(), file = %file, deleted = info.del_count, "wrote live docs");
                }
                Err(e) => {
                    let file = live_docs_file_name(info.name(), del_gen);
                    state.deleter.delete_if_unreferenced(&file);
                    result = Err(e);
                    break;
                }
            }
        }
        if wrote {
            state.infos.changed();
            state.checkpoint();
        }
        result
    }

    fn prepare_commit_locked(&self) -> Result<()> {
        if self.state.lock().pending_commit.is_some() {
            return Err(IndexError::IllegalState(
                "prepare_commit was already called with no corresponding call to commit"
                    .to_string(),
            ));
        }
        self.flush_all()?;
        self.apply_all_deletes()?;

        let (mut infos, files, generation) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Err(e) = self.write_live_docs(state) {
                state.phase = WriterPhase::Idle;
                return Err(e);
            }
            if state.infos.version == state.committed_version && state.infos.generation > 0 {
                debug!(generation = state.infos.generation, "no changes to commit");
                state.phase = WriterPhase::Idle;
                return Ok(());
            }
            let generation = state.infos.generation.max(state.last_attempted_gen) + 1;
            state.last_attempted_gen = generation;
            let infos = state.infos.clone();
            let files: Vec<String> = infos.files(false).into_iter().collect();
            state.deleter.inc_ref_files(&files);
            (infos, files, generation)
        };

        let written = self
            .dir
            .sync(&files)
            .and_then(|_| infos.write_pending(self.dir.as_ref(), generation));
        let mut state = self.state.lock();
        match written {
            Ok(pending_file) => {
                debug!(generation, file = %pending_file, files = files.len(), "commit prepared");
                state.pending_commit = Some(PendingCommit {
                    infos,
                    pending_file,
                    files,
                });
                state.phase = WriterPhase::PreparedCommit;
                drop(state);
                self.events.emit(IndexEvent::CommitPrepared { generation });
                Ok(())
            }
            Err(e) => {
                error!(generation, error = %e, "prepare commit failed");
                state.deleter.dec_ref_files(&files);
                state.phase = WriterPhase::Idle;
                drop(state);
                self.events.emit(IndexEvent::CommitFailed {
                    generation,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn commit_locked(&self) -> Result<()> {
        let prepared = self.state.lock().pending_commit.is_some();
        if !prepared {
            self.prepare_commit_locked()?;
        }
        self.finish_commit()
    }

    /// Phase two: publish the prepared commit point
    fn finish_commit(&self) -> Result<()> {
        let Some(pending) = self.state.lock().pending_commit.take() else {
            return Ok(());
        };
        let PendingCommit {
            infos,
            pending_file,
            files,
        } = pending;
        let generation = infos.generation;

        match infos.finish_commit(self.dir.as_ref(), &pending_file) {
            Ok(segments_file) => {
                {
                    let mut state = self.state.lock();
                    if let Err(e) = state.deleter.checkpoint(&infos, true) {
                        warn!(generation, error = %e, "deletion policy failed after commit");
                    }
                    state.deleter.dec_ref_files(&files);
                    state.infos.generation = generation;
                    state.committed_version = infos.version;
                    state.phase = WriterPhase::Committed;
                }
                let segments = infos.segments.iter().map(|s| s.name().to_string()).collect();
                info!(
                    generation,
                    file = %segments_file,
                    segments = infos.len(),
                    docs = infos.total_live_docs(),
                    "committed"
                );
                self.last_committed.store(Arc::new(infos));
                self.events.emit(IndexEvent::Committed {
                    generation,
                    segments,
                });
                Ok(())
            }
            Err(e) => {
                error!(generation, error = %e, "commit failed; previous commit stays current");
                {
                    let mut state = self.state.lock();
                    state.deleter.dec_ref_files(&files);
                    state.deleter.delete_if_unreferenced(&pending_file);
                    state.phase = WriterPhase::Idle;
                }
                self.events.emit(IndexEvent::CommitFailed {
                    generation,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Register natural merges; true when merges are waiting to run
    fn register_merges(&self, trigger: MergeTrigger) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            return false;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let merging = state.merges.merging_segments();
        let spec = self
            .merge_policy
            .find_merges(trigger, &state.infos.segments, &merging);
        if !spec.is_empty() {
            let accepted = state.merges.add_candidates(spec);
            debug!(?trigger, merges = accepted.len(), "natural merges registered");
        }
        state.merges.has_pending()
    }

    fn has_merges(&self) -> bool {
        !self.state.lock().merges_idle()
    }

    /// True once no merge is pending or running; otherwise waits up to
    /// `timeout` for one to finish
    fn wait_merges_idle(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.merges_idle() {
            return true;
        }
        self.merges_done.wait_for(&mut state, timeout);
        state.merges_idle()
    }

    fn take_merge_errors(&self) -> Result<()> {
        let errors = std::mem::take(&mut self.state.lock().merge_errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(IndexError::MergeAborted(errors.join("; ")))
        }
    }

    fn execute_merge(&self, queued: &QueuedMerge) -> Result<()> {
        let merge = &queued.merge;
        // resolve deletes first so the merge drops as much as possible
        self.apply_all_deletes()?;

        let (name, inputs) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if queued.is_aborted() || self.closing.load(Ordering::SeqCst) {
                return Err(IndexError::MergeAborted(format!("{} aborted before start", merge)));
            }
            let mut inputs = Vec::with_capacity(merge.segments.len());
            for segment in &merge.segments {
                let live = state.pool.get(segment).ok_or_else(|| {
                    IndexError::MergeAborted(format!("merge source {} is gone", segment))
                })?;
                inputs.push(MergeInput {
                    name: segment.clone(),
                    core: live.core.clone(),
                    deleted: live.deleted.clone(),
                    doc_seqs: live.doc_seqs.clone(),
                });
            }
            (state.new_segment_name(), inputs)
        };

        debug!(merge_id = queued.id, merge = %merge, into = %name, "merge started");
        self.events.emit(IndexEvent::MergeStarted {
            merge_id: queued.id,
            segments: merge.segments.clone(),
            forced: queued.is_forced(),
        });

        let merger = SegmentMerger::new(
            self.dir.as_ref(),
            self.codec.as_ref(),
            self.config.use_compound_file,
        );
        let result = merger
            .merge(&name, &inputs, &queued.abort)
            .and_then(|merged| self.commit_merge(queued, &name, &inputs, merged));
        if result.is_err() {
            self.state.lock().deleter.delete_new_segment_files(&name);
        }
        result
    }

    /// Swap the merge sources for the merged segment
    fn commit_merge(
        &self,
        queued: &QueuedMerge,
        name: &str,
        inputs: &[MergeInput],
        merged: Option<MergedSegment>,
    ) -> Result<()> {
        let merge = &queued.merge;
        let docs = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if queued.is_aborted() {
                return Err(IndexError::MergeAborted(format!("{} aborted", merge)));
            }

            // deletes resolved against the sources while the merge ran
            let mut carried = RoaringBitmap::new();
            let mut resolved_upto = u64::MAX;
            for (source, input) in inputs.iter().enumerate() {
                let live = state.pool.get(&input.name).ok_or_else(|| {
                    IndexError::MergeAborted(format!("merge source {} is gone", input.name))
                })?;
                resolved_upto = resolved_upto.min(live.resolved_upto);
                if let Some(merged) = &merged {
                    if !Arc::ptr_eq(&live.deleted, &input.deleted) {
                        for doc in live.deleted.iter() {
                            if input.deleted.contains(doc) {
                                continue;
                            }
                            if let Some(new_doc) = merged.doc_map.get(source, doc) {
                                carried.insert(new_doc);
                            }
                        }
                    }
                }
            }

            let position = merge
                .segments
                .iter()
                .filter_map(|s| state.infos.position(s))
                .min()
                .unwrap_or(state.infos.len());
            let forced_source = merge
                .segments
                .iter()
                .any(|s| state.segments_to_merge.contains_key(s));
            for segment in &merge.segments {
                state.pool.remove(segment);
                state.segments_to_merge.remove(segment);
            }
            state.infos.segments.retain(|s| !merge.contains(s.name()));

            let docs = match merged {
                Some(merged) => {
                    let MergedSegment {
                        mut info,
                        core,
                        doc_seqs,
                        ..
                    } = merged;
                    info.del_count = carried.len() as u32;
                    let docs = info.max_doc();
                    state.pool.insert(
                        name.to_string(),
                        LiveSegment {
                            core,
                            dirty: !carried.is_empty(),
                            deleted: Arc::new(carried),
                            doc_seqs: Arc::new(doc_seqs),
                            resolved_upto,
                            next_del_gen: 1,
                            base_size: info.size_in_bytes,
                        },
                    );
                    let position = position.min(state.infos.len());
                    state.infos.segments.insert(position, info);
                    if forced_source {
                        state.segments_to_merge.insert(name.to_string(), false);
                    }
                    docs
                }
                None => 0,
            };
            state.infos.changed();
            state.checkpoint();
            docs
        };

        info!(merge_id = queued.id, merged = %name, docs, sources = merge.segments.len(), "merge completed");
        self.events.emit(IndexEvent::MergeCompleted {
            merge_id: queued.id,
            segments: merge.segments.clone(),
            merged: name.to_string(),
            docs,
        });
        Ok(())
    }

    pub(crate) fn nrt_snapshot(&self, apply_all_deletes: bool) -> Result<NrtSnapshot> {
        self.ensure_open()?;
        self.flush_all()?;
        if apply_all_deletes {
            self.apply_all_deletes()?;
        }
        let state = self.state.lock();
        let segments = state
            .infos
            .segments
            .iter()
            .filter_map(|info| {
                state.pool.get(info.name()).map(|live| {
                    let mut info = info.clone();
                    info.del_count = live.deleted.len() as u32;
                    NrtSegment {
                        info,
                        core: live.core.clone(),
                        deleted: live.deleted.clone(),
                    }
                })
            })
            .collect();
        Ok(NrtSnapshot {
            infos: state.infos.clone(),
            segments,
        })
    }

    /// True when a view taken at `version` still shows everything
    pub(crate) fn is_current(&self, version: u64) -> bool {
        if !self.is_open() {
            return false;
        }
        let unchanged = self.state.lock().infos.version == version;
        unchanged && !self.docs_writer.any_changes()
    }
}

impl MergeSource for WriterInner {
    fn next_merge(&self) -> Option<QueuedMerge> {
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }
        self.state.lock().merges.next_merge()
    }

    fn run_merge(&self, queued: QueuedMerge) {
        let result = self.execute_merge(&queued);
        if result.is_ok() {
            self.register_merges(MergeTrigger::MergeFinished);
        }
        {
            let mut state = self.state.lock();
            state.merges.complete_merge(queued.id);
            if let Err(e) = &result {
                if matches!(queued.merge.reason, MergeReason::Forced | MergeReason::ForcedDeletes) {
                    state.merge_errors.push(format!("{}: {}", queued.merge, e));
                }
            }
        }
        self.merges_done.notify_all();

        if let Err(e) = result {
            warn!(merge_id = queued.id, error = %e, "merge aborted; sources stay live");
            self.events.emit(IndexEvent::MergeAborted {
                merge_id: queued.id,
                segments: queued.merge.segments.clone(),
                reason: e.to_string(),
            });
        }
    }

    fn has_pending_merges(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && self.state.lock().merges.has_pending()
    }
}

/// Docs in `core` hit by `entries` and not already deleted
fn resolve_deletes(
    core: &SegmentCore,
    doc_seqs: &[u64],
    already: &RoaringBitmap,
    entries: &[Arc<DeleteEntry>],
) -> RoaringBitmap {
    let seq_of = |doc: u32| doc_seqs.get(doc as usize).copied().unwrap_or(0);
    let mut hits = RoaringBitmap::new();
    for entry in entries {
        match &entry.query {
            DeleteQuery::Term(term) => {
                for &doc in core.postings(term) {
                    if seq_of(doc) < entry.seq && !already.contains(doc) {
                        hits.insert(doc);
                    }
                }
            }
            query => {
                for (doc, document) in core.documents().iter().enumerate() {
                    let doc = doc as u32;
                    if seq_of(doc) < entry.seq && !already.contains(doc) && query.matches(document) {
                        hits.insert(doc);
                    }
                }
            }
        }
    }
    hits
}

/// Remove segments with no live documents unless a merge holds them
fn drop_fully_deleted(state: &mut WriterState) {
    let merging = state.merges.merging_segments();
    let dropped: Vec<String> = state
        .infos
        .segments
        .iter()
        .filter(|s| s.live_doc_count() == 0 && !merging.contains(s.name()))
        .map(|s| s.name().to_string())
        .collect();
    for name in &dropped {
        debug!(segment = %name, "dropping fully deleted segment");
        state.pool.remove(name);
        state.segments_to_merge.remove(name);
    }
    state.infos.segments.retain(|s| !dropped.iter().any(|d| d == s.name()));
}

fn load_segment(
    dir: &dyn Directory,
    codec: &dyn Codec,
    info: &SegmentCommitInfo,
    files: &[String],
) -> Result<LiveSegment> {
    let core = Arc::new(codec.read_segment(dir, &info.info)?);
    let deleted = match info.del_gen {
        Some(del_gen) => codec.read_live_docs(dir, info.name(), del_gen, info.max_doc())?,
        None => RoaringBitmap::new(),
    };
    let live_docs_len = match info.live_docs_file() {
        Some(file) => dir.file_length(&file)?,
        None => 0,
    };
    let next_del_gen = info
        .del_gen
        .map_or(1, |g| g + 1)
        .max(max_live_docs_gen(files, info.name()) + 1);
    Ok(LiveSegment {
        core,
        deleted: Arc::new(deleted),
        doc_seqs: Arc::new(Vec::new()),
        resolved_upto: 0,
        dirty: false,
        next_del_gen,
        base_size: info.size_in_bytes.saturating_sub(live_docs_len),
    })
}

/// First segment counter no file in the directory uses
fn next_free_segment_counter(files: &[String]) -> u64 {
    files
        .iter()
        .filter_map(|f| segment_of(f))
        .filter_map(|segment| parse_base36(&segment[1..]))
        .map(|n| n + 1)
        .max()
        .unwrap_or(0)
}

/// Highest live-docs generation on disk for `segment`
fn max_live_docs_gen(files: &[String], segment: &str) -> u64 {
    let suffix = format!(".{}", LIVE_DOCS_EXTENSION);
    files
        .iter()
        .filter_map(|f| f.strip_suffix(suffix.as_str()))
        .filter_map(|stem| stem.rsplit_once('_'))
        .filter(|(seg, _)| *seg == segment)
        .filter_map(|(_, del_gen)| parse_base36(del_gen))
        .max()
        .unwrap_or(0)
}
