//! Which commit points survive
//!
//! A policy sees every live commit, oldest first, once when the writer
//! opens and again after each successful commit. It calls
//! [`IndexCommit::delete`] on the ones it no longer wants. The newest
//! commit is never removed even if a policy asks for it.

use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::commit::IndexCommit;
use crate::error::{IndexError, Result};

pub trait IndexDeletionPolicy: Send + Sync {
    fn on_init(&self, commits: &[IndexCommit]) -> Result<()>;

    fn on_commit(&self, commits: &[IndexCommit]) -> Result<()>;
}

/// Keeps only the most recent commit
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepOnlyLastCommit;

impl IndexDeletionPolicy for KeepOnlyLastCommit {
    fn on_init(&self, commits: &[IndexCommit]) -> Result<()> {
        self.on_commit(commits)
    }

    fn on_commit(&self, commits: &[IndexCommit]) -> Result<()> {
        if let Some((_, older)) = commits.split_last() {
            older.iter().for_each(IndexCommit::delete);
        }
        Ok(())
    }
}

/// Never deletes anything
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAllCommits;

impl IndexDeletionPolicy for KeepAllCommits {
    fn on_init(&self, _commits: &[IndexCommit]) -> Result<()> {
        Ok(())
    }

    fn on_commit(&self, _commits: &[IndexCommit]) -> Result<()> {
        Ok(())
    }
}

/// Keeps the newest `n` commits
#[derive(Debug, Clone, Copy)]
pub struct KeepLastNCommits {
    n: usize,
}

impl KeepLastNCommits {
    pub fn new(n: usize) -> Self {
        Self { n: n.max(1) }
    }
}

impl IndexDeletionPolicy for KeepLastNCommits {
    fn on_init(&self, commits: &[IndexCommit]) -> Result<()> {
        self.on_commit(commits)
    }

    fn on_commit(&self, commits: &[IndexCommit]) -> Result<()> {
        let excess = commits.len().saturating_sub(self.n);
        commits[..excess].iter().for_each(IndexCommit::delete);
        Ok(())
    }
}

#[derive(Default)]
struct SnapshotState {
    ref_counts: BTreeMap<u64, usize>,
    snapshots: BTreeMap<u64, IndexCommit>,
    last_commit: Option<IndexCommit>,
}

/// Wraps another policy and pins snapshotted commits
///
/// Snapshots are reference counted per generation: snapshotting the same
/// commit twice returns the same handle and needs two releases. A released
/// commit is handed back to the wrapped policy's judgement on the next
/// policy pass.
pub struct SnapshotDeletionPolicy {
    primary: Box<dyn IndexDeletionPolicy>,
    state: Mutex<SnapshotState>,
}

impl SnapshotDeletionPolicy {
    pub fn new(primary: impl IndexDeletionPolicy + 'static) -> Self {
        Self {
            primary: Box::new(primary),
            state: Mutex::new(SnapshotState::default()),
        }
    }

    /// Pin the most recent commit
    pub fn snapshot(&self) -> Result<IndexCommit> {
        let mut state = self.state.lock();
        let commit = state.last_commit.clone().ok_or_else(|| {
            IndexError::IllegalState("no index commit to snapshot".to_string())
        })?;
        let generation = commit.generation();
        *state.ref_counts.entry(generation).or_insert(0) += 1;
        let pinned = state
            .snapshots
            .entry(generation)
            .or_insert_with(|| commit)
            .clone();
        // A pinned commit can never stay marked
        pinned.undelete();
        Ok(pinned)
    }

    /// Unpin a commit returned by [`snapshot`](Self::snapshot)
    pub fn release(&self, commit: &IndexCommit) -> Result<()> {
        let mut state = self.state.lock();
        let generation = commit.generation();
        let count = state
            .ref_counts
            .get_mut(&generation)
            .ok_or(IndexError::InvalidSnapshot(generation))?;
        *count -= 1;
        if *count == 0 {
            state.ref_counts.remove(&generation);
            state.snapshots.remove(&generation);
        }
        Ok(())
    }

    /// Distinct pinned commits, oldest first
    pub fn snapshots(&self) -> Vec<IndexCommit> {
        self.state.lock().snapshots.values().cloned().collect()
    }

    /// Total outstanding snapshot references
    pub fn snapshot_count(&self) -> usize {
        self.state.lock().ref_counts.values().sum()
    }

    pub fn is_snapshotted(&self, generation: u64) -> bool {
        self.state.lock().ref_counts.contains_key(&generation)
    }

    /// The pinned commit at `generation`, if any
    pub fn index_commit(&self, generation: u64) -> Option<IndexCommit> {
        self.state.lock().snapshots.get(&generation).cloned()
    }

    fn filtered<F>(&self, commits: &[IndexCommit], run: F) -> Result<()>
    where
        F: FnOnce(&dyn IndexDeletionPolicy, &[IndexCommit]) -> Result<()>,
    {
        let proxies: Vec<IndexCommit> = commits.iter().map(IndexCommit::detached).collect();
        run(self.primary.as_ref(), &proxies)?;

        let mut state = self.state.lock();
        for (commit, proxy) in commits.iter().zip(&proxies) {
            if proxy.is_deleted() && !state.ref_counts.contains_key(&commit.generation()) {
                commit.delete();
            }
        }
        state.last_commit = commits.last().cloned();
        Ok(())
    }
}

impl IndexDeletionPolicy for SnapshotDeletionPolicy {
    fn on_init(&self, commits: &[IndexCommit]) -> Result<()> {
        self.filtered(commits, |primary, proxies| primary.on_init(proxies))
    }

    fn on_commit(&self, commits: &[IndexCommit]) -> Result<()> {
        self.filtered(commits, |primary, proxies| primary.on_commit(proxies))
    }
}
