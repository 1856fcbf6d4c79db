//! Natural and forced merges through the writer

use segdex::testing::{check_all_invariants, default_invariants, EventLog};
use segdex::{
    DeleteQuery, Directory, DirectoryReader, Document, IndexWriter, LogMergeConfig,
    MergePolicyConfig, MergeSchedulerConfig, OpenMode, RamDirectory, Term, TieredMergeConfig,
    WriterConfig, WriterOptions,
};
use std::sync::Arc;

fn create_test_doc(id: usize) -> Document {
    Document::new()
        .with_keyword("id", id.to_string())
        .with_text("body", "merge me please")
        .with_long("n", id as i64)
}

fn flushing_every(docs: usize, policy: MergePolicyConfig, scheduler: MergeSchedulerConfig) -> WriterConfig {
    WriterConfig::new()
        .with_max_buffered_docs(Some(docs))
        .with_ram_buffer_size_mb(None)
        .with_merge_policy(policy)
        .with_merge_scheduler(scheduler)
}

fn with_log(dir: Arc<dyn Directory>, config: WriterConfig) -> (IndexWriter, EventLog) {
    let log = EventLog::new();
    let options = WriterOptions::new().with_listener(Arc::new(log.clone()));
    (IndexWriter::open_with(dir, config, options).unwrap(), log)
}

#[test]
fn test_natural_log_merges_in_background() {
    let policy = MergePolicyConfig::LogDocCount(LogMergeConfig::doc_count().with_merge_factor(3));
    let config = flushing_every(2, policy, MergeSchedulerConfig::Concurrent { max_threads: 2 });
    let (writer, log) = with_log(Arc::new(RamDirectory::new()), config);

    for id in 0..30 {
        writer.add_document(create_test_doc(id)).unwrap();
    }
    writer.wait_for_merges().unwrap();
    writer.commit().unwrap();

    assert!(log.count("merge_completed") > 0);
    assert!(writer.segment_count() < 15);
    assert_eq!(writer.num_docs(), 30);
    assert_eq!(writer.pending_merge_count(), 0);
    let violations = check_all_invariants(&log, &default_invariants());
    assert!(violations.is_empty(), "{:?}", violations);
    writer.close().unwrap();
}

#[test]
fn test_tiered_policy_merges_overflowing_tier() {
    let tiered = TieredMergeConfig {
        segments_per_tier: 3,
        max_merge_at_once: 3,
        ..Default::default()
    };
    let config = flushing_every(2, MergePolicyConfig::Tiered(tiered), MergeSchedulerConfig::Serial);
    let (writer, log) = with_log(Arc::new(RamDirectory::new()), config);

    for id in 0..24 {
        writer.add_document(create_test_doc(id)).unwrap();
    }
    writer.wait_for_merges().unwrap();

    assert!(log.count("merge_completed") > 0);
    assert!(writer.segment_count() < 12);
    assert_eq!(writer.num_docs(), 24);
    assert!(check_all_invariants(&log, &default_invariants()).is_empty());
    writer.close().unwrap();
}

#[test]
fn test_forced_merge_leaves_oversized_segment_standalone() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    let big = flushing_every(10, MergePolicyConfig::NoMerge, MergeSchedulerConfig::Serial);
    let writer = IndexWriter::open(dir.clone(), big).unwrap();
    for id in 0..10 {
        writer.add_document(create_test_doc(id)).unwrap();
    }
    writer.close().unwrap();

    let policy = MergePolicyConfig::LogDocCount(
        LogMergeConfig::doc_count().with_max_merge_size_for_forced_merge(8),
    );
    let small = flushing_every(2, policy, MergeSchedulerConfig::Serial).with_open_mode(OpenMode::Append);
    let writer = IndexWriter::open(dir.clone(), small).unwrap();
    for id in 10..16 {
        writer.add_document(create_test_doc(id)).unwrap();
    }
    writer.flush().unwrap();
    assert_eq!(writer.segment_count(), 4);

    writer.force_merge(1).unwrap();
    let infos = writer.segment_infos();
    let sizes: Vec<u32> = infos.segments.iter().map(|s| s.max_doc()).collect();
    assert_eq!(sizes, vec![10, 6]);
    assert_eq!(infos.segments[0].name(), "_0");
    writer.commit().unwrap();
    writer.close().unwrap();

    let reader = DirectoryReader::open(dir).unwrap();
    assert_eq!(reader.num_docs(), 16);
    assert_eq!(reader.term_docs(&Term::new("id", "15")).unwrap(), vec![15]);
    reader.close().unwrap();
}

#[test]
fn test_force_merge_with_concurrent_scheduler() {
    let policy = MergePolicyConfig::LogDocCount(LogMergeConfig::doc_count());
    let config = flushing_every(3, policy, MergeSchedulerConfig::Concurrent { max_threads: 3 });
    let (writer, log) = with_log(Arc::new(RamDirectory::new()), config);
    for id in 0..40 {
        writer.add_document(create_test_doc(id)).unwrap();
    }
    writer
        .delete_by_query(DeleteQuery::long_range("n", 0, 9))
        .unwrap();

    writer.force_merge(1).unwrap();
    assert_eq!(writer.segment_count(), 1);
    let infos = writer.segment_infos();
    assert_eq!(infos.segments[0].max_doc(), 30);
    assert!(!infos.segments[0].has_deletions());
    assert!(log.filter(|e| matches!(e, segdex::IndexEvent::MergeStarted { forced: true, .. })).len() > 0);
    assert!(check_all_invariants(&log, &default_invariants()).is_empty());
    writer.close().unwrap();
}

#[test]
fn test_force_merge_deletes_reclaims_documents() {
    let policy = MergePolicyConfig::LogDocCount(LogMergeConfig::doc_count());
    let config = flushing_every(5, policy, MergeSchedulerConfig::Serial);
    let writer = IndexWriter::open(Arc::new(RamDirectory::new()), config).unwrap();
    for id in 0..20 {
        writer.add_document(create_test_doc(id)).unwrap();
    }
    for id in [1, 6, 7] {
        writer.delete_documents(Term::new("id", id.to_string())).unwrap();
    }
    writer.commit().unwrap();
    assert_eq!(writer.max_doc(), 20);

    writer.force_merge_deletes().unwrap();
    assert_eq!(writer.num_docs(), 17);
    assert_eq!(writer.max_doc(), 17);
    let infos = writer.segment_infos();
    assert!(infos.segments.iter().all(|s| !s.has_deletions()));
    assert_eq!(infos.len(), 3);
    writer.close().unwrap();
}
