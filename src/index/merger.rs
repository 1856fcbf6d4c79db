//! Combines segments into one, dropping deleted documents

use roaring::RoaringBitmap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::segment_info::{SegmentCommitInfo, SegmentInfo, SOURCE_MERGE};
use crate::codec::{Codec, SegmentCore};
use crate::error::{IndexError, Result};
use crate::store::Directory;

/// A source segment as seen when the merge started
#[derive(Clone, Debug)]
pub(crate) struct MergeInput {
    pub(crate) name: String,
    pub(crate) core: Arc<SegmentCore>,
    pub(crate) deleted: Arc<RoaringBitmap>,
    pub(crate) doc_seqs: Arc<Vec<u64>>,
}

/// Old doc id to merged doc id, per source
#[derive(Clone, Debug, Default)]
pub(crate) struct DocMap {
    maps: Vec<Vec<Option<u32>>>,
}

impl DocMap {
    pub(crate) fn get(&self, source: usize, doc: u32) -> Option<u32> {
        self.maps
            .get(source)
            .and_then(|m| m.get(doc as usize))
            .copied()
            .flatten()
    }

    #[cfg(test)]
    pub(crate) fn num_sources(&self) -> usize {
        self.maps.len()
    }
}

#[derive(Debug)]
pub(crate) struct MergedSegment {
    pub(crate) info: SegmentCommitInfo,
    pub(crate) core: Arc<SegmentCore>,
    pub(crate) doc_seqs: Vec<u64>,
    pub(crate) doc_map: DocMap,
}

pub(crate) struct SegmentMerger<'a> {
    dir: &'a dyn Directory,
    codec: &'a dyn Codec,
    use_compound_file: bool,
}

impl<'a> SegmentMerger<'a> {
    pub(crate) fn new(dir: &'a dyn Directory, codec: &'a dyn Codec, use_compound_file: bool) -> Self {
        Self {
            dir,
            codec,
            use_compound_file,
        }
    }

    /// Write the live documents of `sources` as segment `name`
    ///
    /// Returns `None` when every source document is deleted; nothing is
    /// written in that case. `abort` is polled between sources.
    pub(crate) fn merge(
        &self,
        name: &str,
        sources: &[MergeInput],
        abort: &AtomicBool,
    ) -> Result<Option<MergedSegment>> {
        let mut docs = Vec::new();
        let mut doc_seqs = Vec::new();
        let mut maps = Vec::with_capacity(sources.len());

        for source in sources {
            if abort.load(Ordering::SeqCst) {
                return Err(IndexError::MergeAborted(format!(
                    "merge into {} aborted while reading {}",
                    name, source.name
                )));
            }
            let mut map = Vec::with_capacity(source.core.max_doc() as usize);
            for (doc, document) in source.core.documents().iter().enumerate() {
                if source.deleted.contains(doc as u32) {
                    map.push(None);
                    continue;
                }
                map.push(Some(docs.len() as u32));
                docs.push(document.clone());
                doc_seqs.push(source.doc_seqs.get(doc).copied().unwrap_or(0));
            }
            maps.push(map);
        }

        if docs.is_empty() {
            debug!(segment = name, "merge sources fully deleted");
            return Ok(None);
        }
        if abort.load(Ordering::SeqCst) {
            return Err(IndexError::MergeAborted(format!("merge into {} aborted", name)));
        }

        let written = self
            .codec
            .write_segment(self.dir, name, &docs, self.use_compound_file)?;
        let info = SegmentInfo::new(name, docs.len() as u32, self.codec.name(), self.use_compound_file)
            .with_files(written.files)
            .with_diagnostic("source", SOURCE_MERGE)
            .with_diagnostic("merged_from", sources.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(","));
        debug!(segment = name, docs = docs.len(), bytes = written.size_in_bytes, "merged segment written");

        Ok(Some(MergedSegment {
            info: SegmentCommitInfo::new(info, written.size_in_bytes),
            core: Arc::new(SegmentCore::from_documents(name, docs)),
            doc_seqs,
            doc_map: DocMap { maps },
        }))
    }
}
