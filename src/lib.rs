pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod index;
pub mod store;
pub mod testing;

pub use codec::{Codec, DefaultCodec, SegmentCore};
pub use config::{
    LogMergeConfig, MergePolicyConfig, MergeSchedulerConfig, OpenMode, TieredMergeConfig,
    WriterConfig,
};
pub use document::{DeleteQuery, Document, Term};
pub use error::{IndexError, Result};
pub use index::{
    DirectoryReader, IndexCommit, IndexDeletionPolicy, IndexEvent, IndexEventListener,
    IndexWriter, KeepAllCommits, KeepLastNCommits, KeepOnlyLastCommit, SegmentReader,
    SnapshotDeletionPolicy, WriterOptions, WriterPhase,
};
pub use store::{Directory, FsDirectory, RamDirectory};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
