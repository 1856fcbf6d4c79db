//! Read-only view of one segment at one deletion state
//!
//! Leaves are reference counted independently of the directory readers
//! holding them, so a reopened reader can share unchanged leaves with its
//! predecessor.

use roaring::RoaringBitmap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::segment_info::SegmentCommitInfo;
use crate::codec::{Codec, SegmentCore};
use crate::document::{Document, Term};
use crate::error::{IndexError, Result};
use crate::store::Directory;

struct LeafInner {
    info: SegmentCommitInfo,
    core: Arc<SegmentCore>,
    deleted: Arc<RoaringBitmap>,
    ref_count: AtomicUsize,
}

pub struct SegmentReader {
    inner: Arc<LeafInner>,
}

impl SegmentReader {
    pub(crate) fn new(
        info: SegmentCommitInfo,
        core: Arc<SegmentCore>,
        deleted: Arc<RoaringBitmap>,
    ) -> Self {
        Self {
            inner: Arc::new(LeafInner {
                info,
                core,
                deleted,
                ref_count: AtomicUsize::new(1),
            }),
        }
    }

    /// Load a committed segment and its live docs
    pub(crate) fn open(
        dir: &dyn Directory,
        codec: &dyn Codec,
        info: &SegmentCommitInfo,
    ) -> Result<Self> {
        let core = Arc::new(codec.read_segment(dir, &info.info)?);
        Self::open_with_core(dir, codec, info, core)
    }

    /// Reuse an already loaded core with the live docs `info` names
    pub(crate) fn open_with_core(
        dir: &dyn Directory,
        codec: &dyn Codec,
        info: &SegmentCommitInfo,
        core: Arc<SegmentCore>,
    ) -> Result<Self> {
        let deleted = match info.del_gen {
            Some(del_gen) => codec.read_live_docs(dir, info.name(), del_gen, info.max_doc())?,
            None => RoaringBitmap::new(),
        };
        if deleted.len() != info.del_count as u64 {
            return Err(IndexError::corrupt(
                info.name(),
                format!(
                    "live docs hold {} deletions but the commit records {}",
                    deleted.len(),
                    info.del_count
                ),
            ));
        }
        trace!(segment = info.name(), deleted = deleted.len(), "opened segment reader");
        Ok(Self::new(info.clone(), core, Arc::new(deleted)))
    }

    /// Another handle to this leaf, taking a reference
    pub(crate) fn share(&self) -> Result<Self> {
        self.inc_ref()?;
        Ok(Self {
            inner: self.inner.clone(),
        })
    }

    /// True when this leaf already reflects `info` with `deleted`
    pub(crate) fn matches(&self, info: &SegmentCommitInfo, deleted: Option<&Arc<RoaringBitmap>>) -> bool {
        if self.inner.info.name() != info.name() {
            return false;
        }
        match deleted {
            Some(deleted) => Arc::ptr_eq(&self.inner.deleted, deleted),
            None => {
                self.inner.info.del_gen == info.del_gen && self.inner.info.del_count == info.del_count
            }
        }
    }

    pub(crate) fn core(&self) -> &Arc<SegmentCore> {
        &self.inner.core
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.ref_count.load(Ordering::SeqCst) == 0 {
            return Err(IndexError::already_closed("SegmentReader"));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.inner.info.name()
    }

    pub fn info(&self) -> &SegmentCommitInfo {
        &self.inner.info
    }

    pub fn max_doc(&self) -> u32 {
        self.inner.core.max_doc()
    }

    pub fn num_docs(&self) -> u32 {
        self.max_doc() - self.inner.deleted.len() as u32
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.inner.deleted.len() as u32
    }

    pub fn has_deletions(&self) -> bool {
        !self.inner.deleted.is_empty()
    }

    pub fn is_deleted(&self, doc: u32) -> bool {
        self.inner.deleted.contains(doc)
    }

    /// Stored document `doc`, `None` when deleted or out of range
    pub fn document(&self, doc: u32) -> Result<Option<Document>> {
        self.ensure_open()?;
        if self.is_deleted(doc) {
            return Ok(None);
        }
        Ok(self.inner.core.document(doc).cloned())
    }

    /// Documents containing `term`, deleted ones included
    pub fn doc_freq(&self, term: &Term) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.inner.core.postings(term).len())
    }

    /// Live documents containing `term`
    pub fn term_docs(&self, term: &Term) -> Result<Vec<u32>> {
        self.ensure_open()?;
        Ok(self
            .inner
            .core
            .postings(term)
            .iter()
            .copied()
            .filter(|&doc| !self.is_deleted(doc))
            .collect())
    }

    pub fn ref_count(&self) -> usize {
        self.inner.ref_count.load(Ordering::SeqCst)
    }

    pub fn inc_ref(&self) -> Result<()> {
        if self.try_inc_ref() {
            Ok(())
        } else {
            Err(IndexError::already_closed("SegmentReader"))
        }
    }

    /// Take a reference unless the leaf is already closed
    pub fn try_inc_ref(&self) -> bool {
        self.inner
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count > 0).then(|| count + 1)
            })
            .is_ok()
    }

    pub fn dec_ref(&self) -> Result<()> {
        match self
            .inner
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
        {
            Ok(1) => {
                trace!(segment = self.name(), "segment reader closed");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(_) => Err(IndexError::already_closed("SegmentReader")),
        }
    }

    /// Both handles are the very same leaf
    pub fn is_shared_with(&self, other: &SegmentReader) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentReader")
            .field("segment", &self.name())
            .field("max_doc", &self.max_doc())
            .field("deleted", &self.num_deleted_docs())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
