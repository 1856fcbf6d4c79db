//! Point-in-time reader over a commit point or a writer's live segments
//!
//! A reader starts with one reference. [`DirectoryReader::open_if_changed`]
//! returns `None` when nothing changed; otherwise the new reader shares
//! every unchanged leaf with the old one, taking a reference on it rather
//! than loading it again. Closing a reader releases its leaves; a shared
//! leaf stays open until every reader holding it is closed.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::commit::{self, IndexCommit};
use super::segment_infos::{last_commit_generation, SegmentInfos};
use super::segment_reader::SegmentReader;
use super::writer::{IndexWriter, NrtSnapshot, WriterInner};
use crate::codec::{Codec, DefaultCodec};
use crate::document::{Document, Term};
use crate::error::{IndexError, Result};
use crate::store::Directory;

/// Link from a near-real-time reader back to its writer
#[derive(Clone)]
struct WriterLink {
    writer: Weak<WriterInner>,
    apply_all_deletes: bool,
}

impl WriterLink {
    fn live_writer(&self) -> Option<Arc<WriterInner>> {
        self.writer.upgrade().filter(|w| w.is_open())
    }
}

pub struct DirectoryReader {
    dir: Arc<dyn Directory>,
    codec: Arc<dyn Codec>,
    infos: SegmentInfos,
    leaves: Vec<SegmentReader>,
    /// First global doc id of each leaf
    doc_starts: Vec<u64>,
    max_doc: u64,
    writer: Option<WriterLink>,
    ref_count: AtomicUsize,
}

impl DirectoryReader {
    /// Open the newest commit in `dir`
    pub fn open(dir: Arc<dyn Directory>) -> Result<Self> {
        Self::open_with_codec(dir, Arc::new(DefaultCodec))
    }

    pub fn open_with_codec(dir: Arc<dyn Directory>, codec: Arc<dyn Codec>) -> Result<Self> {
        let infos = SegmentInfos::read_latest(dir.as_ref())?;
        Self::from_commit(dir, codec, infos, None)
    }

    /// Open a specific commit, e.g. one returned by [`list_commits`](Self::list_commits)
    pub fn open_commit(dir: Arc<dyn Directory>, commit: &IndexCommit) -> Result<Self> {
        Self::from_commit(dir, Arc::new(DefaultCodec), commit.infos().clone(), None)
    }

    /// Near-real-time reader over everything `writer` has indexed so far
    ///
    /// Buffered documents are flushed but not committed. With
    /// `apply_all_deletes` false, buffered deletes may not be visible yet.
    pub fn open_from_writer(writer: &IndexWriter, apply_all_deletes: bool) -> Result<Self> {
        let snapshot = writer.nrt_snapshot(apply_all_deletes)?;
        let link = WriterLink {
            writer: writer.downgrade(),
            apply_all_deletes,
        };
        Self::from_snapshot(writer.directory().clone(), writer.codec(), snapshot, link, None)
    }

    /// Every commit point in `dir`, oldest first
    pub fn list_commits(dir: &dyn Directory) -> Result<Vec<IndexCommit>> {
        commit::list_commits(dir)
    }

    /// A new reader if the index changed since `reader` was opened
    ///
    /// Near-real-time readers compare against their writer's live state;
    /// once the writer is closed they fall back to the newest commit.
    pub fn open_if_changed(reader: &DirectoryReader) -> Result<Option<DirectoryReader>> {
        reader.ensure_open()?;
        if let Some(link) = &reader.writer {
            if let Some(writer) = link.live_writer() {
                if writer.is_current(reader.version()) {
                    return Ok(None);
                }
                let snapshot = writer.nrt_snapshot(link.apply_all_deletes)?;
                return Self::from_snapshot(
                    reader.dir.clone(),
                    reader.codec.clone(),
                    snapshot,
                    link.clone(),
                    Some(reader),
                )
                .map(Some);
            }
        }

        let latest = SegmentInfos::read_latest(reader.dir.as_ref())?;
        if latest.generation <= reader.generation() {
            return Ok(None);
        }
        Self::from_commit(reader.dir.clone(), reader.codec.clone(), latest, Some(reader)).map(Some)
    }

    /// A reader on `commit`, sharing unchanged leaves with `reader`
    pub fn open_if_changed_commit(
        reader: &DirectoryReader,
        commit: &IndexCommit,
    ) -> Result<Option<DirectoryReader>> {
        reader.ensure_open()?;
        if reader.writer.is_none() && commit.generation() == reader.generation() {
            return Ok(None);
        }
        Self::from_commit(
            reader.dir.clone(),
            reader.codec.clone(),
            commit.infos().clone(),
            Some(reader),
        )
        .map(Some)
    }

    /// A near-real-time reader on `writer`, sharing unchanged leaves
    pub fn open_if_changed_with_writer(
        reader: &DirectoryReader,
        writer: &IndexWriter,
        apply_all_deletes: bool,
    ) -> Result<Option<DirectoryReader>> {
        reader.ensure_open()?;
        let same_writer = reader.writer.as_ref().map_or(false, |link| {
            Weak::ptr_eq(&link.writer, &writer.downgrade())
                && link.apply_all_deletes == apply_all_deletes
        });
        if same_writer {
            return Self::open_if_changed(reader);
        }
        let snapshot = writer.nrt_snapshot(apply_all_deletes)?;
        let link = WriterLink {
            writer: writer.downgrade(),
            apply_all_deletes,
        };
        Self::from_snapshot(reader.dir.clone(), writer.codec(), snapshot, link, Some(reader))
            .map(Some)
    }

    fn from_commit(
        dir: Arc<dyn Directory>,
        codec: Arc<dyn Codec>,
        infos: SegmentInfos,
        prior: Option<&DirectoryReader>,
    ) -> Result<Self> {
        let mut leaves: Vec<SegmentReader> = Vec::with_capacity(infos.len());
        for info in &infos.segments {
            let leaf = match prior.and_then(|p| p.leaf(info.name())) {
                Some(old) if old.matches(info, None) => old.share(),
                Some(old) => {
                    SegmentReader::open_with_core(dir.as_ref(), codec.as_ref(), info, old.core().clone())
                }
                None => SegmentReader::open(dir.as_ref(), codec.as_ref(), info),
            };
            match leaf {
                Ok(leaf) => leaves.push(leaf),
                Err(e) => {
                    release_all(&leaves);
                    return Err(e);
                }
            }
        }
        debug!(
            generation = infos.generation,
            leaves = leaves.len(),
            shared = shared_count(&leaves, prior),
            "opened reader on commit"
        );
        Ok(Self::assemble(dir, codec, infos, leaves, None))
    }

    fn from_snapshot(
        dir: Arc<dyn Directory>,
        codec: Arc<dyn Codec>,
        snapshot: NrtSnapshot,
        link: WriterLink,
        prior: Option<&DirectoryReader>,
    ) -> Result<Self> {
        let NrtSnapshot { infos, segments } = snapshot;
        let mut leaves: Vec<SegmentReader> = Vec::with_capacity(segments.len());
        for segment in segments {
            match prior.and_then(|p| p.leaf(segment.info.name())) {
                Some(old) if old.matches(&segment.info, Some(&segment.deleted)) => {
                    match old.share() {
                        Ok(leaf) => leaves.push(leaf),
                        Err(e) => {
                            release_all(&leaves);
                            return Err(e);
                        }
                    }
                }
                _ => leaves.push(SegmentReader::new(segment.info, segment.core, segment.deleted)),
            }
        }
        debug!(
            version = infos.version,
            leaves = leaves.len(),
            shared = shared_count(&leaves, prior),
            "opened near-real-time reader"
        );
        Ok(Self::assemble(dir, codec, infos, leaves, Some(link)))
    }

    fn assemble(
        dir: Arc<dyn Directory>,
        codec: Arc<dyn Codec>,
        infos: SegmentInfos,
        leaves: Vec<SegmentReader>,
        writer: Option<WriterLink>,
    ) -> Self {
        let mut doc_starts = Vec::with_capacity(leaves.len());
        let mut max_doc = 0u64;
        for leaf in &leaves {
            doc_starts.push(max_doc);
            max_doc += leaf.max_doc() as u64;
        }
        Self {
            dir,
            codec,
            infos,
            leaves,
            doc_starts,
            max_doc,
            writer,
            ref_count: AtomicUsize::new(1),
        }
    }

    fn leaf(&self, name: &str) -> Option<&SegmentReader> {
        self.leaves.iter().find(|leaf| leaf.name() == name)
    }

    /// Fails once the last reference is gone
    pub fn ensure_open(&self) -> Result<()> {
        if self.ref_count.load(Ordering::SeqCst) == 0 {
            return Err(IndexError::already_closed("DirectoryReader"));
        }
        Ok(())
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn inc_ref(&self) -> Result<()> {
        if self.try_inc_ref() {
            Ok(())
        } else {
            Err(IndexError::already_closed("DirectoryReader"))
        }
    }

    pub fn try_inc_ref(&self) -> bool {
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count > 0).then(|| count + 1)
            })
            .is_ok()
    }

    /// Drop a reference; the last one releases every leaf
    pub fn dec_ref(&self) -> Result<()> {
        let previous = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
            .map_err(|_| IndexError::already_closed("DirectoryReader"))?;
        if previous == 1 {
            debug!(generation = self.generation(), "reader closed");
            release_all(&self.leaves);
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.dec_ref()
    }

    // The counts and `leaves` describe the point-in-time snapshot and keep
    // answering after close; anything reading segment data checks
    // `ensure_open` first.

    pub fn num_docs(&self) -> u64 {
        self.leaves.iter().map(|l| l.num_docs() as u64).sum()
    }

    pub fn max_doc(&self) -> u64 {
        self.max_doc
    }

    pub fn num_deleted_docs(&self) -> u64 {
        self.max_doc - self.num_docs()
    }

    pub fn has_deletions(&self) -> bool {
        self.leaves.iter().any(SegmentReader::has_deletions)
    }

    /// Per-segment readers; released leaves report a zero ref count
    pub fn leaves(&self) -> &[SegmentReader] {
        &self.leaves
    }

    /// Generation of the commit this reader reflects; for near-real-time
    /// readers, the writer's last commit
    pub fn generation(&self) -> u64 {
        self.infos.generation
    }

    pub fn version(&self) -> u64 {
        self.infos.version
    }

    pub fn segments_file_name(&self) -> Option<String> {
        self.infos.segments_file_name()
    }

    pub fn is_near_real_time(&self) -> bool {
        self.writer.is_some()
    }

    pub fn index_commit(&self) -> Result<IndexCommit> {
        self.ensure_open()?;
        let name = self.segments_file_name().ok_or_else(|| {
            IndexError::IllegalState("reader is not on a commit point".to_string())
        })?;
        Ok(IndexCommit::new(name, self.infos.clone()))
    }

    /// Stored document by global doc id; `None` when deleted
    pub fn document(&self, doc: u64) -> Result<Option<Document>> {
        self.ensure_open()?;
        if doc >= self.max_doc {
            return Ok(None);
        }
        let index = self.doc_starts.partition_point(|&start| start <= doc) - 1;
        self.leaves[index].document((doc - self.doc_starts[index]) as u32)
    }

    /// Documents containing `term` across all leaves, deleted ones included
    pub fn doc_freq(&self, term: &Term) -> Result<u64> {
        self.ensure_open()?;
        let mut total = 0u64;
        for leaf in &self.leaves {
            total += leaf.doc_freq(term)? as u64;
        }
        Ok(total)
    }

    /// Global ids of live documents containing `term`
    pub fn term_docs(&self, term: &Term) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let mut docs = Vec::new();
        for (leaf, &start) in self.leaves.iter().zip(&self.doc_starts) {
            docs.extend(leaf.term_docs(term)?.into_iter().map(|d| start + d as u64));
        }
        Ok(docs)
    }

    /// Whether reopening would show nothing new
    pub fn is_current(&self) -> Result<bool> {
        self.ensure_open()?;
        if let Some(writer) = self.writer.as_ref().and_then(WriterLink::live_writer) {
            return Ok(writer.is_current(self.version()));
        }
        let files = self.dir.list_all()?;
        Ok(last_commit_generation(&files) == Some(self.generation()) && self.writer.is_none())
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.dir
    }
}

fn release_all(leaves: &[SegmentReader]) {
    for leaf in leaves {
        if let Err(e) = leaf.dec_ref() {
            warn!(segment = leaf.name(), error = %e, "releasing segment reader failed");
        }
    }
}

fn shared_count(leaves: &[SegmentReader], prior: Option<&DirectoryReader>) -> usize {
    prior.map_or(0, |p| {
        leaves
            .iter()
            .filter(|l| p.leaves.iter().any(|old| old.is_shared_with(l)))
            .count()
    })
}

impl fmt::Debug for DirectoryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryReader")
            .field("generation", &self.generation())
            .field("version", &self.version())
            .field("leaves", &self.leaves)
            .field("nrt", &self.is_near_real_time())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MergePolicyConfig, MergeSchedulerConfig, WriterConfig};
    use crate::store::RamDirectory;

    fn writer(dir: &Arc<dyn Directory>) -> IndexWriter {
        let config = WriterConfig::new()
            .with_max_buffered_docs(Some(2))
            .with_ram_buffer_size_mb(None)
            .with_merge_policy(MergePolicyConfig::NoMerge)
            .with_merge_scheduler(MergeSchedulerConfig::Serial);
        IndexWriter::open(dir.clone(), config).unwrap()
    }

    fn doc(id: &str) -> Document {
        Document::new().with_keyword("id", id)
    }

    #[test]
    fn test_open_without_commit() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        assert!(matches!(
            DirectoryReader::open(dir),
            Err(IndexError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_reopen_shares_unchanged_leaves() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let writer = writer(&dir);
        writer.add_document(doc("a")).unwrap();
        writer.add_document(doc("b")).unwrap();
        writer.commit().unwrap();

        let first = DirectoryReader::open(dir.clone()).unwrap();
        assert_eq!(first.num_docs(), 2);
        assert!(DirectoryReader::open_if_changed(&first).unwrap().is_none());

        writer.add_document(doc("c")).unwrap();
        writer.commit().unwrap();
        let second = DirectoryReader::open_if_changed(&first).unwrap().unwrap();
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(second.num_docs(), 3);
        assert!(second.leaves()[0].is_shared_with(&first.leaves()[0]));
        assert_eq!(first.leaves()[0].ref_count(), 2);

        first.close().unwrap();
        assert_eq!(second.leaves()[0].ref_count(), 1);
        assert!(matches!(first.ensure_open(), Err(IndexError::AlreadyClosed(_))));
        assert_eq!(second.term_docs(&Term::new("id", "c")).unwrap(), vec![2]);
        second.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_new_deletions_reload_live_docs_only() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let writer = writer(&dir);
        writer.add_document(doc("a")).unwrap();
        writer.add_document(doc("b")).unwrap();
        writer.commit().unwrap();
        let first = DirectoryReader::open(dir.clone()).unwrap();

        writer.delete_documents(Term::new("id", "a")).unwrap();
        writer.commit().unwrap();
        let second = DirectoryReader::open_if_changed(&first).unwrap().unwrap();
        assert!(!second.leaves()[0].is_shared_with(&first.leaves()[0]));
        assert_eq!(second.num_deleted_docs(), 1);
        assert!(second.document(0).unwrap().is_none());
        assert_eq!(first.num_docs(), 2);
        writer.close().unwrap();
    }

    #[test]
    fn test_near_real_time_sees_uncommitted() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let writer = writer(&dir);
        writer.add_document(doc("a")).unwrap();

        let reader = DirectoryReader::open_from_writer(&writer, true).unwrap();
        assert_eq!(reader.num_docs(), 1);
        assert!(reader.is_current().unwrap());
        assert!(DirectoryReader::open_if_changed(&reader).unwrap().is_none());

        writer.delete_documents(Term::new("id", "a")).unwrap();
        assert!(!reader.is_current().unwrap());
        let reopened = DirectoryReader::open_if_changed(&reader).unwrap().unwrap();
        assert_eq!(reopened.num_docs(), 0);
        assert_eq!(reader.num_docs(), 1);
        writer.rollback().unwrap();
        assert!(!reopened.is_current().unwrap());
    }

    #[test]
    fn test_inc_ref_keeps_reader_open() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let writer = writer(&dir);
        writer.add_document(doc("a")).unwrap();
        writer.close().unwrap();

        let reader = DirectoryReader::open(dir).unwrap();
        reader.inc_ref().unwrap();
        reader.close().unwrap();
        assert_eq!(reader.doc_freq(&Term::new("id", "a")).unwrap(), 1);
        reader.close().unwrap();
        assert!(!reader.try_inc_ref());
        assert!(reader.close().is_err());
    }

    #[test]
    fn test_counts_survive_close_but_data_access_fails() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let writer = writer(&dir);
        writer.add_document(doc("a")).unwrap();
        writer.add_document(doc("b")).unwrap();
        writer.add_document(doc("c")).unwrap();
        writer.delete_documents(Term::new("id", "b")).unwrap();
        writer.close().unwrap();

        let reader = DirectoryReader::open(dir).unwrap();
        reader.close().unwrap();

        assert_eq!(reader.num_docs(), 2);
        assert_eq!(reader.max_doc(), 3);
        assert_eq!(reader.num_deleted_docs(), 1);
        assert!(reader.has_deletions());
        assert!(reader.leaves().iter().all(|leaf| leaf.ref_count() == 0));

        assert!(matches!(reader.ensure_open(), Err(IndexError::AlreadyClosed(_))));
        assert!(matches!(
            reader.doc_freq(&Term::new("id", "a")),
            Err(IndexError::AlreadyClosed(_))
        ));
        assert!(matches!(reader.document(0), Err(IndexError::AlreadyClosed(_))));
    }
}
