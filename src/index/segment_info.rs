//! Segment descriptors
//!
//! [`SegmentInfo`] never changes once a segment is written.
//! [`SegmentCommitInfo`] adds the per-commit view: how many documents are
//! deleted and which live-docs generation records them. A new deletion
//! generation produces a new `SegmentCommitInfo`, never an edit of the
//! files an older one references.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::file_names::live_docs_file_name;

/// Where a segment came from
pub const SOURCE_FLUSH: &str = "flush";
pub const SOURCE_MERGE: &str = "merge";

/// Write-once description of a segment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    /// Documents in the segment, deleted ones included
    pub doc_count: u32,
    pub codec: String,
    pub use_compound_file: bool,
    /// Files written for this segment, live docs excluded
    pub files: Vec<String>,
    /// Free-form provenance such as `source=flush`
    pub diagnostics: BTreeMap<String, String>,
    /// Unix timestamp (seconds)
    pub created_at: i64,
}

impl SegmentInfo {
    pub fn new(name: impl Into<String>, doc_count: u32, codec: impl Into<String>, use_compound_file: bool) -> Self {
        Self {
            name: name.into(),
            doc_count,
            codec: codec.into(),
            use_compound_file,
            files: Vec::new(),
            diagnostics: BTreeMap::new(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_diagnostic(mut self, key: &str, value: impl Into<String>) -> Self {
        self.diagnostics.insert(key.to_string(), value.into());
        self
    }

    pub fn source(&self) -> Option<&str> {
        self.diagnostics.get("source").map(String::as_str)
    }
}

/// A segment as referenced by one commit point
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentCommitInfo {
    pub info: SegmentInfo,
    pub del_count: u32,
    /// Live-docs generation; `None` when nothing was ever persisted deleted
    pub del_gen: Option<u64>,
    /// Size of the segment files, live docs included
    pub size_in_bytes: u64,
}

impl SegmentCommitInfo {
    pub fn new(info: SegmentInfo, size_in_bytes: u64) -> Self {
        Self {
            info,
            del_count: 0,
            del_gen: None,
            size_in_bytes,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn max_doc(&self) -> u32 {
        self.info.doc_count
    }

    pub fn live_doc_count(&self) -> u32 {
        self.info.doc_count.saturating_sub(self.del_count)
    }

    pub fn has_deletions(&self) -> bool {
        self.del_count > 0
    }

    pub fn delete_ratio(&self) -> f64 {
        if self.info.doc_count == 0 {
            0.0
        } else {
            self.del_count as f64 / self.info.doc_count as f64
        }
    }

    pub fn live_docs_file(&self) -> Option<String> {
        self.del_gen
            .map(|generation| live_docs_file_name(&self.info.name, generation))
    }

    /// Every file this view of the segment needs
    pub fn files(&self) -> Vec<String> {
        let mut files = self.info.files.clone();
        files.extend(self.live_docs_file());
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_info_files() {
        let info = SegmentInfo::new("_3", 100, "c", true)
            .with_files(vec!["_3.cfs".to_string()])
            .with_diagnostic("source", SOURCE_FLUSH);
        let mut sci = SegmentCommitInfo::new(info, 4096);
        assert_eq!(sci.files(), vec!["_3.cfs".to_string()]);
        assert!(!sci.has_deletions());
        assert_eq!(sci.info.source(), Some("flush"));

        sci.del_count = 25;
        sci.del_gen = Some(2);
        assert_eq!(sci.files(), vec!["_3.cfs".to_string(), "_3_2.del".to_string()]);
        assert_eq!(sci.live_doc_count(), 75);
        assert!((sci.delete_ratio() - 0.25).abs() < f64::EPSILON);
    }
}
