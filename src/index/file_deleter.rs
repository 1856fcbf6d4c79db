//! Reference-counted index file deletion
//!
//! Every live commit point and the writer's current in-memory segment list
//! hold one reference on each file they use. A file is deleted when its
//! count drops to zero. On open, index-named files nobody references are
//! crash leftovers and are removed.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::commit::IndexCommit;
use super::deletion_policy::IndexDeletionPolicy;
use super::events::{EventSink, IndexEvent};
use super::file_names::{generation_from_segments_file_name, is_index_file, segment_of, SEGMENTS_GEN};
use super::segment_infos::{last_commit_generation, SegmentInfos};
use crate::error::{IndexError, Result};
use crate::store::Directory;

pub(crate) struct IndexFileDeleter {
    dir: Arc<dyn Directory>,
    policy: Arc<dyn IndexDeletionPolicy>,
    ref_counts: HashMap<String, usize>,
    /// Live commits, oldest first
    commits: Vec<IndexCommit>,
    /// Files of the last non-commit checkpoint
    last_files: Vec<String>,
    /// Deletions that failed and will be retried
    pending_deletes: BTreeSet<String>,
    events: EventSink,
}

impl IndexFileDeleter {
    /// Load every commit in `dir`, run the policy's init pass, then drop
    /// whatever is left unreferenced
    pub(crate) fn new(
        dir: Arc<dyn Directory>,
        policy: Arc<dyn IndexDeletionPolicy>,
        current: &SegmentInfos,
        events: EventSink,
    ) -> Result<Self> {
        let files = dir.list_all()?;
        let latest = last_commit_generation(&files);

        let mut commit_files: Vec<(u64, String)> = files
            .iter()
            .filter_map(|f| generation_from_segments_file_name(f).map(|g| (g, f.clone())))
            .collect();
        commit_files.sort();

        let mut deleter = Self {
            dir,
            policy,
            ref_counts: HashMap::new(),
            commits: Vec::new(),
            last_files: Vec::new(),
            pending_deletes: BTreeSet::new(),
            events,
        };

        for (generation, name) in commit_files {
            match SegmentInfos::read(deleter.dir.as_ref(), &name) {
                Ok(infos) => {
                    let commit = IndexCommit::new(name, infos);
                    deleter.inc_ref_files(commit.file_names());
                    deleter.commits.push(commit);
                }
                Err(e) if Some(generation) != latest => {
                    warn!(file = %name, error = %e, "skipping unreadable commit point");
                }
                Err(e) => return Err(e),
            }
        }

        deleter.checkpoint(current, false)?;

        if !deleter.commits.is_empty() {
            deleter.policy.on_init(&deleter.commits)?;
            deleter.delete_commits(current.generation);
        }

        deleter.delete_unreferenced(&files);
        debug!(
            commits = deleter.commits.len(),
            tracked_files = deleter.ref_counts.len(),
            "file deleter initialized"
        );
        Ok(deleter)
    }

    /// Record a new state. A commit checkpoint adds a commit point and runs
    /// the policy; otherwise the in-memory file set is swapped.
    pub(crate) fn checkpoint(&mut self, infos: &SegmentInfos, is_commit: bool) -> Result<()> {
        if is_commit {
            let name = infos.segments_file_name().ok_or_else(|| {
                IndexError::IllegalState("commit checkpoint without a generation".to_string())
            })?;
            let commit = IndexCommit::new(name, infos.clone());
            self.inc_ref_files(commit.file_names());
            self.commits.push(commit);
            let result = self.policy.on_commit(&self.commits);
            self.delete_commits(infos.generation);
            result
        } else {
            let files: Vec<String> = infos.files(false).into_iter().collect();
            self.inc_ref_files(&files);
            let old = std::mem::replace(&mut self.last_files, files);
            self.dec_ref_files(&old);
            Ok(())
        }
    }

    /// Re-run the policy over the live commits, e.g. after a snapshot release
    pub(crate) fn revisit_policy(&mut self) -> Result<()> {
        if self.commits.is_empty() {
            return Ok(());
        }
        let newest = self.commits.last().map(|c| c.generation()).unwrap_or(0);
        let result = self.policy.on_commit(&self.commits);
        self.delete_commits(newest);
        self.delete_pending_files();
        result
    }

    fn delete_commits(&mut self, protected_generation: u64) {
        let newest = self.commits.len().saturating_sub(1);
        let mut removed = Vec::new();
        for (i, commit) in self.commits.iter().enumerate() {
            if !commit.is_deleted() {
                continue;
            }
            if i == newest || commit.generation() == protected_generation {
                debug!(generation = commit.generation(), "ignoring delete of protected commit");
                commit.undelete();
                continue;
            }
            removed.push(commit.clone());
        }
        if removed.is_empty() {
            return;
        }
        self.commits.retain(|c| !c.is_deleted());
        for commit in removed {
            info!(generation = commit.generation(), "deleting commit point");
            self.dec_ref_files(commit.file_names());
            self.events.emit(IndexEvent::CommitDeleted {
                generation: commit.generation(),
            });
        }
    }

    pub(crate) fn inc_ref_files(&mut self, files: &[String]) {
        for file in files {
            *self.ref_counts.entry(file.clone()).or_insert(0) += 1;
        }
    }

    pub(crate) fn dec_ref_files(&mut self, files: &[String]) {
        for file in files {
            self.dec_ref(file);
        }
    }

    fn dec_ref(&mut self, file: &str) {
        match self.ref_counts.get_mut(file) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.ref_counts.remove(file);
                self.delete_file(file);
            }
            None => warn!(file, "decRef of untracked file"),
        }
    }

    fn delete_file(&mut self, name: &str) {
        match self.dir.delete_file(name) {
            Ok(()) => {
                debug!(file = name, "deleted index file");
                self.pending_deletes.remove(name);
            }
            Err(IndexError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                self.pending_deletes.remove(name);
            }
            Err(e) => {
                warn!(file = name, error = %e, "delete failed; will retry");
                self.pending_deletes.insert(name.to_string());
            }
        }
    }

    pub(crate) fn delete_pending_files(&mut self) {
        let pending: Vec<String> = self.pending_deletes.iter().cloned().collect();
        for name in pending {
            if self.ref_counts.contains_key(&name) {
                self.pending_deletes.remove(&name);
            } else {
                self.delete_file(&name);
            }
        }
    }

    /// Delete files written for `segment` that nothing references
    pub(crate) fn delete_new_segment_files(&mut self, segment: &str) {
        let files = match self.dir.list_all() {
            Ok(files) => files,
            Err(e) => {
                warn!(segment, error = %e, "cannot list directory to clean segment files");
                return;
            }
        };
        for file in files {
            if segment_of(&file) == Some(segment) && !self.ref_counts.contains_key(&file) {
                self.delete_file(&file);
            }
        }
    }

    /// Delete a single unreferenced file, e.g. a stale live-docs generation
    pub(crate) fn delete_if_unreferenced(&mut self, file: &str) {
        if !self.ref_counts.contains_key(file) && self.dir.file_exists(file) {
            self.delete_file(file);
        }
    }

    /// Remove every unreferenced index file currently in the directory
    pub(crate) fn refresh(&mut self) -> Result<()> {
        let files = self.dir.list_all()?;
        self.delete_unreferenced(&files);
        Ok(())
    }

    fn delete_unreferenced(&mut self, files: &[String]) {
        for file in files {
            if is_index_file(file) && file != SEGMENTS_GEN && !self.ref_counts.contains_key(file) {
                debug!(file = %file, "removing unreferenced file");
                self.delete_file(file);
            }
        }
    }

    /// Drop the in-memory checkpoint's references
    pub(crate) fn close(&mut self) {
        let files = std::mem::take(&mut self.last_files);
        self.dec_ref_files(&files);
        self.delete_pending_files();
    }

    pub(crate) fn commits(&self) -> &[IndexCommit] {
        &self.commits
    }

    pub(crate) fn last_commit(&self) -> Option<&IndexCommit> {
        self.commits.last()
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self, file: &str) -> usize {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::deletion_policy::{KeepAllCommits, KeepOnlyLastCommit};
    use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo};
    use crate::store::RamDirectory;

    fn segment(dir: &RamDirectory, name: &str) -> SegmentCommitInfo {
        let file = format!("{}.cfs", name);
        dir.write_file(&file, b"data").unwrap();
        SegmentCommitInfo::new(
            SegmentInfo::new(name, 1, "c", true).with_files(vec![file]),
            4,
        )
    }

    fn commit(dir: &RamDirectory, infos: &mut SegmentInfos, generation: u64) {
        let pending = infos.write_pending(dir, generation).unwrap();
        infos.finish_commit(dir, &pending).unwrap();
    }

    #[test]
    fn test_keep_only_last_deletes_old_files() {
        let dir = RamDirectory::new();
        let mut infos = SegmentInfos::new();
        infos.segments.push(segment(&dir, "_0"));
        commit(&dir, &mut infos, 1);

        let shared: Arc<dyn Directory> = Arc::new(dir.clone());
        let mut deleter = IndexFileDeleter::new(
            shared,
            Arc::new(KeepOnlyLastCommit),
            &infos,
            EventSink::default(),
        )
        .unwrap();
        assert_eq!(deleter.ref_count("_0.cfs"), 2);

        // merge _0 into _1 and commit
        infos.segments = vec![segment(&dir, "_1")];
        deleter.checkpoint(&infos, false).unwrap();
        assert_eq!(deleter.ref_count("_0.cfs"), 1);
        commit(&dir, &mut infos, 2);
        deleter.checkpoint(&infos, true).unwrap();

        assert!(!dir.file_exists("_0.cfs"));
        assert!(!dir.file_exists("segments_1"));
        assert!(dir.file_exists("_1.cfs"));
        assert!(dir.file_exists("segments_2"));
        assert_eq!(deleter.commits().len(), 1);
    }

    #[test]
    fn test_leftovers_removed_on_open() {
        let dir = RamDirectory::new();
        let mut infos = SegmentInfos::new();
        infos.segments.push(segment(&dir, "_0"));
        commit(&dir, &mut infos, 1);
        dir.write_file("_5.cfs", b"orphan").unwrap();
        dir.write_file("pending_segments_2", b"torn").unwrap();
        dir.write_file("notes.txt", b"keep").unwrap();

        let shared: Arc<dyn Directory> = Arc::new(dir.clone());
        IndexFileDeleter::new(shared, Arc::new(KeepAllCommits), &infos, EventSink::default())
            .unwrap();

        assert!(!dir.file_exists("_5.cfs"));
        assert!(!dir.file_exists("pending_segments_2"));
        assert!(dir.file_exists("notes.txt"));
        assert!(dir.file_exists("_0.cfs"));
        assert!(dir.file_exists("segments.gen"));
    }

    #[test]
    fn test_newest_commit_is_protected() {
        struct DeleteEverything;
        impl IndexDeletionPolicy for DeleteEverything {
            fn on_init(&self, commits: &[IndexCommit]) -> Result<()> {
                commits.iter().for_each(IndexCommit::delete);
                Ok(())
            }
            fn on_commit(&self, commits: &[IndexCommit]) -> Result<()> {
                self.on_init(commits)
            }
        }

        let dir = RamDirectory::new();
        let mut infos = SegmentInfos::new();
        infos.segments.push(segment(&dir, "_0"));
        commit(&dir, &mut infos, 1);

        let shared: Arc<dyn Directory> = Arc::new(dir.clone());
        let deleter =
            IndexFileDeleter::new(shared, Arc::new(DeleteEverything), &infos, EventSink::default())
                .unwrap();
        assert_eq!(deleter.commits().len(), 1);
        assert!(dir.file_exists("segments_1"));
    }
}
