use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::file_names::generation_from_segments_file_name;
use super::segment_infos::SegmentInfos;
use crate::error::{IndexError, Result};
use crate::store::Directory;

struct CommitInner {
    segments_file_name: String,
    infos: SegmentInfos,
    files: Vec<String>,
    deleted: AtomicBool,
}

/// Handle to one durable commit point
///
/// Clones share state: [`IndexCommit::delete`] on any clone marks the
/// commit for every holder. Two handles compare equal when they name the
/// same generation.
#[derive(Clone)]
pub struct IndexCommit {
    inner: Arc<CommitInner>,
}

impl IndexCommit {
    pub(crate) fn new(segments_file_name: String, infos: SegmentInfos) -> Self {
        let files = infos.files(true).into_iter().collect();
        Self {
            inner: Arc::new(CommitInner {
                segments_file_name,
                infos,
                files,
                deleted: AtomicBool::new(false),
            }),
        }
    }

    /// Same commit, independent deletion flag
    pub(crate) fn detached(&self) -> Self {
        Self {
            inner: Arc::new(CommitInner {
                segments_file_name: self.inner.segments_file_name.clone(),
                infos: self.inner.infos.clone(),
                files: self.inner.files.clone(),
                deleted: AtomicBool::new(false),
            }),
        }
    }

    pub fn segments_file_name(&self) -> &str {
        &self.inner.segments_file_name
    }

    pub fn generation(&self) -> u64 {
        self.inner.infos.generation
    }

    pub fn segment_count(&self) -> usize {
        self.inner.infos.len()
    }

    /// Every file the commit needs, its `segments_N` included
    pub fn file_names(&self) -> &[String] {
        &self.inner.files
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.inner.infos.user_data
    }

    /// Ask the writer to drop this commit at the next policy pass
    pub fn delete(&self) {
        self.inner.deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn undelete(&self) {
        self.inner.deleted.store(false, Ordering::SeqCst);
    }

    pub(crate) fn infos(&self) -> &SegmentInfos {
        &self.inner.infos
    }

    /// Both handles point at the very same commit object
    pub fn same_handle(&self, other: &IndexCommit) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for IndexCommit {
    fn eq(&self, other: &Self) -> bool {
        self.generation() == other.generation()
            && self.segments_file_name() == other.segments_file_name()
    }
}

impl Eq for IndexCommit {}

impl fmt::Debug for IndexCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexCommit")
            .field("segments_file", &self.inner.segments_file_name)
            .field("generation", &self.generation())
            .field("segments", &self.segment_count())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

/// All commits durable in `dir`, oldest first
pub fn list_commits(dir: &dyn Directory) -> Result<Vec<IndexCommit>> {
    let mut names: Vec<(u64, String)> = dir
        .list_all()?
        .into_iter()
        .filter_map(|f| generation_from_segments_file_name(&f).map(|g| (g, f)))
        .collect();
    if names.is_empty() {
        return Err(IndexError::IndexNotFound(
            "no segments_N file found".to_string(),
        ));
    }
    names.sort();

    let mut commits = Vec::with_capacity(names.len());
    for (_, name) in names {
        let infos = SegmentInfos::read(dir, &name)?;
        commits.push(IndexCommit::new(name, infos));
    }
    Ok(commits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RamDirectory;

    fn publish(dir: &RamDirectory, generation: u64) {
        let mut infos = SegmentInfos::new();
        let pending = infos.write_pending(dir, generation).unwrap();
        infos.finish_commit(dir, &pending).unwrap();
    }

    #[test]
    fn test_list_commits_in_generation_order() {
        let dir = RamDirectory::new();
        for generation in [1, 2, 11, 37] {
            publish(&dir, generation);
        }
        let commits = list_commits(&dir).unwrap();
        let generations: Vec<u64> = commits.iter().map(|c| c.generation()).collect();
        assert_eq!(generations, vec![1, 2, 11, 37]);
        assert_eq!(commits[3].segments_file_name(), "segments_11");
    }

    #[test]
    fn test_delete_flag_shared_between_clones() {
        let dir = RamDirectory::new();
        publish(&dir, 1);
        let commit = list_commits(&dir).unwrap().remove(0);
        let clone = commit.clone();
        let detached = commit.detached();

        clone.delete();
        assert!(commit.is_deleted());
        assert!(!detached.is_deleted());
        assert_eq!(commit, detached);
        assert!(commit.same_handle(&clone));
        assert!(!commit.same_handle(&detached));
    }

    #[test]
    fn test_no_commits() {
        let dir = RamDirectory::new();
        assert!(matches!(
            list_commits(&dir),
            Err(IndexError::IndexNotFound(_))
        ));
    }
}
