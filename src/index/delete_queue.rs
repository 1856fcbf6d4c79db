//! Global ordered log of buffered deletes
//!
//! Documents and deletes draw from one sequence counter. A delete with
//! sequence `S` applies to a document only if the document's sequence is
//! lower, which is what gives `update_document` its delete-then-add
//! semantics. Each thread buffer remembers the log position it started at;
//! flushed segments remember the position they are resolved up to. Entries
//! below every such position are pruned.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::document::DeleteQuery;

#[derive(Debug)]
pub(crate) struct DeleteEntry {
    pub(crate) seq: u64,
    pub(crate) query: DeleteQuery,
    pub(crate) bytes: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    /// Log position of `entries[0]`
    base: u64,
    entries: VecDeque<Arc<DeleteEntry>>,
    bytes: usize,
    /// Single-term deletes since the last full apply
    num_terms_since_apply: usize,
    /// Bytes logged since the last full apply
    bytes_since_apply: usize,
}

#[derive(Debug)]
pub(crate) struct DeleteQueue {
    inner: Mutex<QueueInner>,
    seq: AtomicU64,
}

impl DeleteQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            // Sequence 0 is reserved for documents loaded from disk
            seq: AtomicU64::new(1),
        }
    }

    /// Sequence number for a newly buffered document
    pub(crate) fn next_doc_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Append a delete; returns the log end after the append
    pub(crate) fn push(&self, query: DeleteQuery) -> u64 {
        let mut inner = self.inner.lock();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let bytes = query.ram_bytes_used();
        if query.is_term() {
            inner.num_terms_since_apply += 1;
        }
        inner.bytes += bytes;
        inner.bytes_since_apply += bytes;
        inner.entries.push_back(Arc::new(DeleteEntry { seq, query, bytes }));
        inner.base + inner.entries.len() as u64
    }

    /// Current log end position
    pub(crate) fn end(&self) -> u64 {
        let inner = self.inner.lock();
        inner.base + inner.entries.len() as u64
    }

    /// Entries in `[start, end)`
    pub(crate) fn slice(&self, start: u64, end: u64) -> Vec<Arc<DeleteEntry>> {
        let inner = self.inner.lock();
        let from = start.saturating_sub(inner.base) as usize;
        let to = (end.saturating_sub(inner.base) as usize).min(inner.entries.len());
        debug_assert!(start >= inner.base, "slice below pruned log position");
        if from >= to {
            return Vec::new();
        }
        inner.entries.range(from..to).cloned().collect()
    }

    /// Drop entries below `upto`
    pub(crate) fn prune(&self, upto: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut pruned = 0;
        while inner.base < upto {
            match inner.entries.pop_front() {
                Some(entry) => {
                    inner.bytes -= entry.bytes;
                    inner.base += 1;
                    pruned += 1;
                }
                None => break,
            }
        }
        pruned
    }

    /// Reset the delete-trigger counters after a full apply
    pub(crate) fn mark_applied(&self) {
        let mut inner = self.inner.lock();
        inner.num_terms_since_apply = 0;
        inner.bytes_since_apply = 0;
    }

    /// Bytes of deletes not yet applied to flushed segments
    pub(crate) fn ram_bytes_used(&self) -> u64 {
        self.inner.lock().bytes_since_apply as u64
    }

    #[cfg(test)]
    /// Bytes still retained by the log
    pub(crate) fn retained_bytes(&self) -> u64 {
        self.inner.lock().bytes as u64
    }

    pub(crate) fn num_terms_since_apply(&self) -> usize {
        self.inner.lock().num_terms_since_apply
    }

    #[cfg(test)]
    pub(crate) fn num_entries(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Forget every entry; positions keep increasing
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.base += inner.entries.len() as u64;
        inner.entries.clear();
        inner.bytes = 0;
        inner.num_terms_since_apply = 0;
        inner.bytes_since_apply = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequences_are_shared() {
        let queue = DeleteQueue::new();
        let doc = queue.next_doc_seq();
        queue.push(DeleteQuery::term("id", "1"));
        let later = queue.next_doc_seq();

        let entries = queue.slice(0, queue.end());
        assert_eq!(entries.len(), 1);
        assert!(doc < entries[0].seq);
        assert!(entries[0].seq < later);
    }

    #[test]
    fn test_slice_and_prune() {
        let queue = DeleteQueue::new();
        for i in 0..5 {
            queue.push(DeleteQuery::term("id", i.to_string()));
        }
        queue.push(DeleteQuery::MatchAll);
        assert_eq!(queue.end(), 6);
        assert_eq!(queue.num_terms_since_apply(), 5);
        assert_eq!(queue.slice(2, 4).len(), 2);

        assert_eq!(queue.prune(3), 3);
        assert_eq!(queue.num_entries(), 3);
        assert_eq!(queue.slice(3, 6).len(), 3);
        assert_eq!(queue.end(), 6);

        queue.mark_applied();
        assert_eq!(queue.num_terms_since_apply(), 0);
        assert_eq!(queue.ram_bytes_used(), 0);
        assert!(queue.retained_bytes() > 0);

        queue.clear();
        assert_eq!(queue.end(), 6);
        assert!(queue.slice(6, 6).is_empty());
    }
}
