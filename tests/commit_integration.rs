//! Commit points, deletion policies and snapshots on a real filesystem

use segdex::index::list_commits;
use segdex::store::{FaultInjector, FaultOp};
use segdex::testing::{EventLog, GenerationsStrictlyIncrease, Invariant};
use segdex::{
    Directory, DirectoryReader, Document, FsDirectory, IndexError, IndexWriter, KeepAllCommits,
    KeepLastNCommits, KeepOnlyLastCommit, MergePolicyConfig, MergeSchedulerConfig, OpenMode,
    SnapshotDeletionPolicy, Term, WriterConfig, WriterOptions,
};
use std::sync::Arc;
use tempfile::TempDir;

fn create_test_doc(id: usize) -> Document {
    Document::new()
        .with_keyword("id", id.to_string())
        .with_text("body", "durable content")
}

fn config() -> WriterConfig {
    WriterConfig::new()
        .with_max_buffered_docs(Some(2))
        .with_ram_buffer_size_mb(None)
        .with_merge_policy(MergePolicyConfig::NoMerge)
        .with_merge_scheduler(MergeSchedulerConfig::Serial)
}

fn fs_dir(tmp: &TempDir) -> Arc<dyn Directory> {
    Arc::new(FsDirectory::open(tmp.path()).unwrap())
}

fn add_and_commit(writer: &IndexWriter, ids: std::ops::Range<usize>) {
    for id in ids {
        writer.add_document(create_test_doc(id)).unwrap();
    }
    writer.commit().unwrap();
}

#[test]
fn test_keep_only_last_commit_removes_old_files() {
    let tmp = TempDir::new().unwrap();
    let dir = fs_dir(&tmp);
    let writer = IndexWriter::open(dir.clone(), config()).unwrap();

    add_and_commit(&writer, 0..2);
    let first_files: Vec<String> = writer.last_commit().unwrap().file_names().to_vec();
    writer.delete_documents(Term::new("id", "0")).unwrap();
    add_and_commit(&writer, 2..4);

    let commits = list_commits(dir.as_ref()).unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].generation(), 2);
    // segment _0 survives, the old commit file does not
    assert!(!dir.file_exists("segments_1"));
    assert!(first_files.iter().filter(|f| f.starts_with("_0")).all(|f| dir.file_exists(f)));
    writer.close().unwrap();
}

#[test]
fn test_snapshot_keeps_commit_files_on_disk() {
    let tmp = TempDir::new().unwrap();
    let dir = fs_dir(&tmp);
    let snapshots = Arc::new(SnapshotDeletionPolicy::new(KeepOnlyLastCommit));
    let options = WriterOptions::new().with_deletion_policy(snapshots.clone());
    let writer = IndexWriter::open_with(dir.clone(), config(), options).unwrap();

    add_and_commit(&writer, 0..4);
    let snap = snapshots.snapshot().unwrap();
    let again = snapshots.snapshot().unwrap();
    assert!(snap.same_handle(&again));
    assert_eq!(snapshots.snapshot_count(), 2);
    assert_eq!(snap.generation(), 1);

    writer.delete_all().unwrap();
    add_and_commit(&writer, 10..12);
    writer.force_merge(1).unwrap();
    writer.commit().unwrap();

    for file in snap.file_names() {
        assert!(dir.file_exists(file), "{} was deleted while snapshotted", file);
    }
    let reader = DirectoryReader::open_commit(dir.clone(), &snap).unwrap();
    assert_eq!(reader.num_docs(), 4);
    assert_eq!(reader.generation(), 1);
    reader.close().unwrap();

    snapshots.release(&snap).unwrap();
    writer.delete_unused_files().unwrap();
    assert!(dir.file_exists(snap.segments_file_name()));

    snapshots.release(&again).unwrap();
    assert!(matches!(
        snapshots.release(&again),
        Err(IndexError::InvalidSnapshot(1))
    ));
    writer.delete_unused_files().unwrap();
    assert!(!dir.file_exists(snap.segments_file_name()));
    assert_eq!(list_commits(dir.as_ref()).unwrap().len(), 1);
    writer.close().unwrap();
}

#[test]
fn test_keep_last_n_commits() {
    let tmp = TempDir::new().unwrap();
    let dir = fs_dir(&tmp);
    let options = WriterOptions::new().with_deletion_policy(Arc::new(KeepLastNCommits::new(2)));
    let writer = IndexWriter::open_with(dir.clone(), config(), options).unwrap();
    for round in 0..4 {
        add_and_commit(&writer, round * 2..round * 2 + 2);
    }
    let generations: Vec<u64> = list_commits(dir.as_ref())
        .unwrap()
        .iter()
        .map(|c| c.generation())
        .collect();
    assert_eq!(generations, vec![3, 4]);
    writer.close().unwrap();
}

#[test]
fn test_time_travel_open_on_old_commit() {
    let tmp = TempDir::new().unwrap();
    let dir = fs_dir(&tmp);
    let log = EventLog::new();
    let options = WriterOptions::new()
        .with_deletion_policy(Arc::new(KeepAllCommits))
        .with_listener(Arc::new(log.clone()));
    let writer = IndexWriter::open_with(dir.clone(), config(), options).unwrap();
    add_and_commit(&writer, 0..2);
    add_and_commit(&writer, 2..6);
    writer.close().unwrap();

    let commits = DirectoryReader::list_commits(dir.as_ref()).unwrap();
    assert_eq!(commits.len(), 2);
    let first = commits[0].clone();

    let options = WriterOptions::new()
        .with_deletion_policy(Arc::new(KeepOnlyLastCommit))
        .with_index_commit(first)
        .with_listener(Arc::new(log.clone()));
    let writer = IndexWriter::open_with(dir.clone(), config().with_open_mode(OpenMode::Append), options)
        .unwrap();
    assert_eq!(writer.num_docs(), 2);
    writer.add_document(create_test_doc(100)).unwrap();
    writer.commit().unwrap();
    writer.close().unwrap();

    let reader = DirectoryReader::open(dir.clone()).unwrap();
    assert_eq!(reader.generation(), 3);
    assert_eq!(reader.num_docs(), 3);
    assert!(reader.term_docs(&Term::new("id", "4")).unwrap().is_empty());
    reader.close().unwrap();
    assert_eq!(list_commits(dir.as_ref()).unwrap().len(), 1);
    assert!(GenerationsStrictlyIncrease.check(&log).is_ok());
}

#[test]
fn test_failed_commit_leaves_previous_state() {
    let tmp = TempDir::new().unwrap();
    let faults = Arc::new(FaultInjector::new());
    let dir: Arc<dyn Directory> =
        Arc::new(FsDirectory::open(tmp.path()).unwrap().with_faults(faults.clone()));
    let writer = IndexWriter::open(dir.clone(), config()).unwrap();
    add_and_commit(&writer, 0..3);
    let before = DirectoryReader::open(dir.clone()).unwrap();

    writer.add_document(create_test_doc(3)).unwrap();
    faults.fail_times(FaultOp::Sync, "pending_segments", 1);
    assert!(writer.commit().is_err());

    assert!(DirectoryReader::open_if_changed(&before).unwrap().is_none());
    assert_eq!(list_commits(dir.as_ref()).unwrap().len(), 1);

    // retry after the failure succeeds with a fresh generation
    writer.commit().unwrap();
    let after = DirectoryReader::open_if_changed(&before).unwrap().unwrap();
    assert_eq!(after.num_docs(), 4);
    assert!(after.generation() > before.generation() + 1);
    before.close().unwrap();
    after.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn test_lock_contention_and_release() {
    let tmp = TempDir::new().unwrap();
    let writer = IndexWriter::open(fs_dir(&tmp), config()).unwrap();
    assert!(matches!(
        IndexWriter::open(fs_dir(&tmp), config()),
        Err(IndexError::LockObtainFailed(_))
    ));
    writer.rollback().unwrap();

    let writer = IndexWriter::open(fs_dir(&tmp), config()).unwrap();
    add_and_commit(&writer, 0..1);
    drop(writer);
    let writer = IndexWriter::open(fs_dir(&tmp), config().with_open_mode(OpenMode::Append)).unwrap();
    assert_eq!(writer.num_docs(), 1);
    writer.close().unwrap();
}

#[test]
fn test_rollback_restores_last_commit() {
    let tmp = TempDir::new().unwrap();
    let dir = fs_dir(&tmp);
    let writer = IndexWriter::open(dir.clone(), config()).unwrap();
    add_and_commit(&writer, 0..2);
    for id in 2..7 {
        writer.add_document(create_test_doc(id)).unwrap();
    }
    writer.delete_documents(Term::new("id", "0")).unwrap();
    writer.prepare_commit().unwrap();
    writer.rollback().unwrap();

    let reader = DirectoryReader::open(dir.clone()).unwrap();
    assert_eq!(reader.generation(), 1);
    assert_eq!(reader.num_docs(), 2);
    reader.close().unwrap();
    assert!(!dir.list_all().unwrap().iter().any(|f| f.starts_with("pending_segments")));
    // segments flushed after the commit are gone
    let files = dir.list_all().unwrap();
    assert!(files.iter().filter(|f| f.starts_with('_')).all(|f| f.starts_with("_0")));
}

#[test]
fn test_commit_data_and_close_without_commit() {
    let tmp = TempDir::new().unwrap();
    let dir = fs_dir(&tmp);
    let writer = IndexWriter::open(dir.clone(), config()).unwrap();
    let mut data = std::collections::BTreeMap::new();
    data.insert("source".to_string(), "batch-7".to_string());
    writer.set_commit_data(data.clone());
    add_and_commit(&writer, 0..2);
    writer.add_document(create_test_doc(2)).unwrap();
    writer.close().unwrap();

    let commits = list_commits(dir.as_ref()).unwrap();
    assert_eq!(commits.last().unwrap().user_data(), &data);

    let no_commit = config().with_commit_on_close(false).with_open_mode(OpenMode::Append);
    let writer = IndexWriter::open(dir.clone(), no_commit).unwrap();
    writer.add_document(create_test_doc(3)).unwrap();
    writer.close().unwrap();
    let reader = DirectoryReader::open(dir).unwrap();
    assert_eq!(reader.num_docs(), 3);
    reader.close().unwrap();
}
