//! Write, merge and commit pipeline
//!
//! # Architecture
//!
//! - `IndexWriter`: accepts documents and deletes, publishes commit points
//! - `DocumentsWriter`: thread buffers, the delete queue and flush control
//! - `MergePolicy` / `MergeScheduler`: pick and run segment merges
//! - `IndexFileDeleter`: reference counts files across commit points
//! - `DirectoryReader`: point-in-time, reference counted views

mod buffer_pool;
mod commit;
mod delete_queue;
mod deletion_policy;
mod directory_reader;
mod documents_writer;
mod events;
mod file_deleter;
pub mod file_names;
mod flush_control;
mod flush_policy;
mod merge_policy;
mod merge_scheduler;
mod merger;
pub mod segment_info;
mod segment_infos;
mod segment_reader;
mod stall_control;
mod thread_buffer;
mod writer;

pub use commit::{list_commits, IndexCommit};
pub use deletion_policy::{
    IndexDeletionPolicy, KeepAllCommits, KeepLastNCommits, KeepOnlyLastCommit,
    SnapshotDeletionPolicy,
};
pub use directory_reader::DirectoryReader;
pub use events::{IndexEvent, IndexEventListener};
pub use flush_control::FlushController;
pub use flush_policy::{BufferStats, FlushDecision, FlushPolicy, FlushStats};
pub use merge_policy::{
    LogMergePolicy, MergePolicy, MergeReason, MergeSpecification, MergeTrigger, NoMergePolicy,
    OneMerge, SizeUnit, TieredMergePolicy, LEVEL_LOG_SPAN,
};
pub use segment_info::{SegmentCommitInfo, SegmentInfo};
pub use segment_infos::{last_commit_generation, read_generation_pointer, SegmentInfos};
pub use segment_reader::SegmentReader;
pub use thread_buffer::BufferId;
pub use writer::{IndexWriter, WriterOptions, WriterPhase};
