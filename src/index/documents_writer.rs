//! Front door for buffered documents and deletes
//!
//! Owns the buffer pool, the flush controller and the delete queue. It
//! never publishes segments itself: buffers selected for flushing are
//! handed back to the writer, which writes and publishes them.

use roaring::RoaringBitmap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::buffer_pool::BufferPool;
use super::delete_queue::DeleteQueue;
use super::events::EventSink;
use super::flush_control::FlushController;
use super::flush_policy::{FlushPolicy, FlushStats};
use super::segment_info::{SegmentCommitInfo, SegmentInfo, SOURCE_FLUSH};
use super::thread_buffer::{BufferId, ThreadBuffer};
use crate::codec::{Codec, SegmentCore};
use crate::config::WriterConfig;
use crate::document::{DeleteQuery, Document, Term};
use crate::error::{IndexError, Result};
use crate::store::Directory;

/// A buffer written out as a segment, ready to publish
#[derive(Debug)]
pub(crate) struct FlushedSegment {
    pub(crate) buffer_id: BufferId,
    pub(crate) info: SegmentCommitInfo,
    pub(crate) core: Arc<SegmentCore>,
    pub(crate) deleted: RoaringBitmap,
    pub(crate) doc_seqs: Vec<u64>,
    /// Delete log position already applied
    pub(crate) resolved_upto: u64,
}

/// Work an indexing call leaves for the writer
#[derive(Debug, Default)]
pub(crate) struct PendingWork {
    pub(crate) buffers: Vec<ThreadBuffer>,
    pub(crate) apply_deletes: bool,
}

impl PendingWork {
    pub(crate) fn is_empty(&self) -> bool {
        self.buffers.is_empty() && !self.apply_deletes
    }
}

#[derive(Debug)]
pub(crate) struct DocumentsWriter {
    pool: BufferPool,
    flush_control: FlushController,
    delete_queue: DeleteQueue,
    dir: Arc<dyn Directory>,
    codec: Arc<dyn Codec>,
    use_compound_file: bool,
}

impl DocumentsWriter {
    pub(crate) fn new(
        config: &WriterConfig,
        dir: Arc<dyn Directory>,
        codec: Arc<dyn Codec>,
        events: EventSink,
    ) -> Result<Self> {
        let policy = FlushPolicy::from_config(config)?;
        Ok(Self {
            pool: BufferPool::new(config.max_thread_states),
            flush_control: FlushController::new(
                policy,
                config.ram_per_thread_hard_limit_bytes(),
                events,
            ),
            delete_queue: DeleteQueue::new(),
            dir,
            codec,
            use_compound_file: config.use_compound_file,
        })
    }

    pub(crate) fn flush_control(&self) -> &FlushController {
        &self.flush_control
    }

    pub(crate) fn delete_queue(&self) -> &DeleteQueue {
        &self.delete_queue
    }

    fn new_buffer(&self, id: BufferId) -> ThreadBuffer {
        let start = self.delete_queue.end();
        self.flush_control.register(id, start);
        trace!(buffer = id, delete_start = start, "new thread buffer");
        ThreadBuffer::new(id, start)
    }

    fn delete_stats(&self) -> FlushStats {
        FlushStats {
            active_bytes: 0,
            delete_bytes: self.delete_queue.ram_bytes_used(),
            num_delete_terms: self.delete_queue.num_terms_since_apply(),
        }
    }

    /// Buffer `doc`, deleting `delete_term` matches buffered before it
    pub(crate) fn update_document(
        &self,
        doc: Document,
        delete_term: Option<Term>,
    ) -> Result<PendingWork> {
        self.flush_control.wait_if_stalled();
        let mut buffer = self
            .pool
            .checkout(|id| self.new_buffer(id))
            .ok_or_else(|| IndexError::already_closed("IndexWriter"))?;

        let has_delete = delete_term.is_some();
        if let Some(term) = delete_term {
            self.delete_queue.push(DeleteQuery::Term(term));
        }
        let seq = self.delete_queue.next_doc_seq();
        buffer.add_document(doc, seq);

        let action = self.flush_control.do_after_document(
            buffer.id(),
            buffer.bytes_used(),
            buffer.num_docs(),
            self.delete_stats(),
        );

        let mut work = PendingWork::default();
        if action.checkout {
            self.pool.checkin(None);
            work.buffers.push(buffer);
        } else if let Some(rejected) = self.pool.checkin(Some(buffer)) {
            self.flush_control.do_on_abort(rejected.id());
            return Err(IndexError::already_closed("IndexWriter"));
        }

        if has_delete {
            work.apply_deletes |= self.flush_control.do_after_delete(self.delete_stats()).apply_deletes;
        }
        work.buffers.extend(self.take_pending_idle());
        Ok(work)
    }

    /// Buffer a delete against everything indexed so far
    pub(crate) fn delete(&self, query: DeleteQuery) -> PendingWork {
        self.delete_queue.push(query);
        let action = self.flush_control.do_after_delete(self.delete_stats());
        PendingWork {
            buffers: self.take_pending_idle(),
            apply_deletes: action.apply_deletes,
        }
    }

    /// Check out pending buffers nobody is using
    pub(crate) fn take_pending_idle(&self) -> Vec<ThreadBuffer> {
        let mut out = Vec::new();
        for id in self.flush_control.pending_ids() {
            if let Some(buffer) = self.pool.take_idle(id) {
                if self.flush_control.checkout_pending(id) {
                    self.pool.checkin(None);
                    out.push(buffer);
                } else if let Some(rejected) = self.pool.checkin(Some(buffer)) {
                    self.flush_control.do_on_abort(rejected.id());
                }
            }
        }
        out
    }

    /// Flush every buffer holding documents at call time
    ///
    /// `flush` is invoked with batches of checked-out buffers; buffers in use
    /// by other threads are flushed by those threads and waited for.
    pub(crate) fn full_flush<F>(&self, mut flush: F) -> Result<()>
    where
        F: FnMut(Vec<ThreadBuffer>) -> Result<()>,
    {
        self.flush_control.mark_for_full_flush();
        let result = loop {
            let buffers = self.take_pending_idle();
            if !buffers.is_empty() {
                if let Err(e) = flush(buffers) {
                    break Err(e);
                }
            }
            if self.flush_control.full_flush_done(Duration::from_millis(10)) {
                break Ok(());
            }
        };
        self.flush_control.finish_full_flush();
        result
    }

    /// Write `buffer` as segment `name`
    ///
    /// Returns `None` when nothing survives: an empty buffer, or one whose
    /// every document was deleted before the flush.
    pub(crate) fn flush_buffer(
        &self,
        buffer: ThreadBuffer,
        name: &str,
    ) -> Result<Option<FlushedSegment>> {
        let buffer_id = buffer.id();
        let resolved_upto = self.delete_queue.end();
        let entries = self.delete_queue.slice(buffer.delete_start(), resolved_upto);
        let deleted = buffer.apply_deletes(&entries);
        let (docs, doc_seqs) = buffer.into_parts();

        if docs.is_empty() || deleted.len() == docs.len() as u64 {
            trace!(buffer = buffer_id, docs = docs.len(), "nothing to flush");
            return Ok(None);
        }

        let written = self
            .codec
            .write_segment(self.dir.as_ref(), name, &docs, self.use_compound_file)?;
        let info = SegmentInfo::new(name, docs.len() as u32, self.codec.name(), self.use_compound_file)
            .with_files(written.files)
            .with_diagnostic("source", SOURCE_FLUSH);
        let mut commit_info = SegmentCommitInfo::new(info, written.size_in_bytes);
        commit_info.del_count = deleted.len() as u32;

        Ok(Some(FlushedSegment {
            buffer_id,
            info: commit_info,
            core: Arc::new(SegmentCore::from_documents(name, docs)),
            deleted,
            doc_seqs,
            resolved_upto,
        }))
    }

    /// Discard every buffered document and delete
    pub(crate) fn abort(&self) -> usize {
        let idle = self.pool.close();
        let mut discarded = 0;
        for buffer in idle {
            discarded += buffer.num_docs();
            self.flush_control.do_on_abort(buffer.id());
        }
        self.flush_control.wait_for_flushes();
        self.delete_queue.clear();
        discarded
    }

    /// Accept documents again after [`abort`](Self::abort)
    pub(crate) fn resume(&self) {
        self.pool.reopen();
    }

    pub(crate) fn num_buffered_docs(&self) -> usize {
        self.flush_control.num_buffered_docs()
    }

    /// Buffered documents or unapplied deletes exist
    pub(crate) fn any_changes(&self) -> bool {
        self.num_buffered_docs() > 0 || self.delete_queue.ram_bytes_used() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultCodec;
    use crate::store::RamDirectory;

    fn writer(config: WriterConfig) -> DocumentsWriter {
        DocumentsWriter::new(
            &config,
            Arc::new(RamDirectory::new()),
            Arc::new(DefaultCodec),
            EventSink::default(),
        )
        .unwrap()
    }

    fn doc(id: &str) -> Document {
        Document::new().with_keyword("id", id).with_text("body", "some text")
    }

    #[test]
    fn test_max_buffered_docs_hands_out_buffer() {
        let dw = writer(WriterConfig::new().with_max_buffered_docs(Some(2)));
        let work = dw.update_document(doc("1"), None).unwrap();
        assert!(work.is_empty());
        let work = dw.update_document(doc("2"), None).unwrap();
        assert_eq!(work.buffers.len(), 1);
        assert_eq!(work.buffers[0].num_docs(), 2);

        let flushed = dw
            .flush_buffer(work.buffers.into_iter().next().unwrap(), "_0")
            .unwrap()
            .unwrap();
        assert_eq!(flushed.info.max_doc(), 2);
        assert_eq!(flushed.info.del_count, 0);
        dw.flush_control().do_after_flush(flushed.buffer_id);
        assert_eq!(dw.num_buffered_docs(), 0);
    }

    #[test]
    fn test_update_replaces_buffered_doc() {
        let dw = writer(WriterConfig::default());
        dw.update_document(doc("a"), None).unwrap();
        dw.update_document(doc("a"), Some(Term::new("id", "a"))).unwrap();

        let mut flushed = Vec::new();
        dw.full_flush(|batch| {
            for buffer in batch {
                let segment = dw.flush_buffer(buffer, "_0")?.unwrap();
                dw.flush_control().do_after_flush(segment.buffer_id);
                flushed.push(segment);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].info.max_doc(), 2);
        assert_eq!(flushed[0].deleted.iter().collect::<Vec<_>>(), vec![0]);
        assert!(!dw.flush_control().is_full_flush());
    }

    #[test]
    fn test_fully_deleted_buffer_writes_nothing() {
        let dir = RamDirectory::new();
        let dw = DocumentsWriter::new(
            &WriterConfig::default(),
            Arc::new(dir.clone()),
            Arc::new(DefaultCodec),
            EventSink::default(),
        )
        .unwrap();
        dw.update_document(doc("a"), None).unwrap();
        dw.delete(DeleteQuery::term("id", "a"));

        let mut buffers = Vec::new();
        dw.flush_control().mark_for_full_flush();
        buffers.extend(dw.take_pending_idle());
        let flushed = dw.flush_buffer(buffers.pop().unwrap(), "_0").unwrap();
        assert!(flushed.is_none());
        assert!(dir.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_abort_discards_everything() {
        let dw = writer(WriterConfig::default());
        dw.update_document(doc("a"), None).unwrap();
        dw.delete(DeleteQuery::MatchAll);
        assert!(dw.any_changes());

        assert_eq!(dw.abort(), 1);
        assert!(!dw.any_changes());
        assert!(dw.update_document(doc("b"), None).is_err());
        dw.resume();
        assert!(dw.update_document(doc("b"), None).is_ok());
    }
}
