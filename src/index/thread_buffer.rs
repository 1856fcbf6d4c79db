//! Per-thread in-memory buffer of not-yet-flushed documents

use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::sync::Arc;

use super::delete_queue::DeleteEntry;
use crate::document::{DeleteQuery, Document, Term};

/// Identifies a thread buffer for its whole life
pub type BufferId = u64;

#[derive(Debug)]
pub(crate) struct ThreadBuffer {
    id: BufferId,
    docs: Vec<Document>,
    /// Sequence number of each buffered document
    seqs: Vec<u64>,
    /// Term to buffered doc ids, for resolving term deletes at flush
    postings: HashMap<Term, Vec<u32>>,
    bytes_used: u64,
    /// Delete log position this buffer's pending deletes start at
    delete_start: u64,
}

impl ThreadBuffer {
    pub(crate) fn new(id: BufferId, delete_start: u64) -> Self {
        Self {
            id,
            docs: Vec::new(),
            seqs: Vec::new(),
            postings: HashMap::new(),
            bytes_used: 0,
            delete_start,
        }
    }

    pub(crate) fn id(&self) -> BufferId {
        self.id
    }

    pub(crate) fn num_docs(&self) -> usize {
        self.docs.len()
    }

    pub(crate) fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    pub(crate) fn delete_start(&self) -> u64 {
        self.delete_start
    }

    /// Buffer `doc`; returns the bytes it added
    pub(crate) fn add_document(&mut self, doc: Document, seq: u64) -> u64 {
        let doc_id = self.docs.len() as u32;
        for term in doc.terms() {
            self.postings.entry(term).or_default().push(doc_id);
        }
        let bytes = (doc.ram_bytes_used() + std::mem::size_of::<u64>()) as u64;
        self.bytes_used += bytes;
        self.docs.push(doc);
        self.seqs.push(seq);
        bytes
    }

    /// Buffered doc ids hit by `entries`, honoring sequence order
    pub(crate) fn apply_deletes(&self, entries: &[Arc<DeleteEntry>]) -> RoaringBitmap {
        let mut deleted = RoaringBitmap::new();
        for entry in entries {
            match &entry.query {
                DeleteQuery::Term(term) => {
                    if let Some(ids) = self.postings.get(term) {
                        for &doc in ids {
                            if self.seqs[doc as usize] < entry.seq {
                                deleted.insert(doc);
                            }
                        }
                    }
                }
                query => {
                    for (doc, d) in self.docs.iter().enumerate() {
                        if self.seqs[doc] < entry.seq && query.matches(d) {
                            deleted.insert(doc as u32);
                        }
                    }
                }
            }
        }
        deleted
    }

    pub(crate) fn into_parts(self) -> (Vec<Document>, Vec<u64>) {
        (self.docs, self.seqs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::delete_queue::DeleteQueue;

    fn doc(id: &str) -> Document {
        Document::new().with_keyword("id", id).with_long("n", id.len() as i64)
    }

    #[test]
    fn test_bytes_accumulate() {
        let mut buffer = ThreadBuffer::new(1, 0);
        let a = buffer.add_document(doc("a"), 1);
        let b = buffer.add_document(doc("bb"), 2);
        assert_eq!(buffer.bytes_used(), a + b);
        assert_eq!(buffer.num_docs(), 2);
    }

    #[test]
    fn test_deletes_respect_sequence() {
        let queue = DeleteQueue::new();
        let mut buffer = ThreadBuffer::new(1, queue.end());

        buffer.add_document(doc("x"), queue.next_doc_seq());
        queue.push(DeleteQuery::term("id", "x"));
        // re-added after the delete: survives
        buffer.add_document(doc("x"), queue.next_doc_seq());
        buffer.add_document(doc("yy"), queue.next_doc_seq());
        queue.push(DeleteQuery::long_range("n", 2, 2));

        let entries = queue.slice(buffer.delete_start(), queue.end());
        let deleted = buffer.apply_deletes(&entries);
        assert_eq!(deleted.iter().collect::<Vec<_>>(), vec![0, 2]);
    }
}
