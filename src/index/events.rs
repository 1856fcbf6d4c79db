//! Observable writer events
//!
//! Listeners are passed to the writer explicitly; there is no global
//! registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Something the writer did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexEvent {
    /// A thread buffer became a segment
    Flushed {
        segment: String,
        docs: u32,
        deleted: u32,
        bytes: u64,
    },
    /// Flushing a thread buffer failed and its documents were discarded
    FlushFailed { segment: String, message: String },
    /// Indexing threads are now blocked on flush progress
    Stalled { active_bytes: u64, flush_bytes: u64 },
    Unstalled,
    /// Buffered deletes were resolved against flushed segments
    DeletesApplied {
        segments_touched: usize,
        docs_deleted: u64,
    },
    MergeStarted {
        merge_id: u64,
        segments: Vec<String>,
        forced: bool,
    },
    MergeCompleted {
        merge_id: u64,
        segments: Vec<String>,
        merged: String,
        docs: u32,
    },
    MergeAborted {
        merge_id: u64,
        segments: Vec<String>,
        reason: String,
    },
    CommitPrepared { generation: u64 },
    Committed { generation: u64, segments: Vec<String> },
    CommitFailed { generation: u64, message: String },
    /// The deletion policy dropped a commit point
    CommitDeleted { generation: u64 },
    RolledBack { generation: u64 },
    Closed,
}

impl IndexEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            IndexEvent::Flushed { .. } => "flushed",
            IndexEvent::FlushFailed { .. } => "flush_failed",
            IndexEvent::Stalled { .. } => "stalled",
            IndexEvent::Unstalled => "unstalled",
            IndexEvent::DeletesApplied { .. } => "deletes_applied",
            IndexEvent::MergeStarted { .. } => "merge_started",
            IndexEvent::MergeCompleted { .. } => "merge_completed",
            IndexEvent::MergeAborted { .. } => "merge_aborted",
            IndexEvent::CommitPrepared { .. } => "commit_prepared",
            IndexEvent::Committed { .. } => "committed",
            IndexEvent::CommitFailed { .. } => "commit_failed",
            IndexEvent::CommitDeleted { .. } => "commit_deleted",
            IndexEvent::RolledBack { .. } => "rolled_back",
            IndexEvent::Closed => "closed",
        }
    }
}

impl fmt::Display for IndexEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.kind(), self)
    }
}

/// Receives writer events; must not call back into the writer
pub trait IndexEventListener: Send + Sync {
    fn on_event(&self, event: &IndexEvent);
}

/// Optional listener handle threaded through writer components
#[derive(Clone, Default)]
pub(crate) struct EventSink(Option<Arc<dyn IndexEventListener>>);

impl EventSink {
    pub(crate) fn new(listener: Option<Arc<dyn IndexEventListener>>) -> Self {
        Self(listener)
    }

    pub(crate) fn emit(&self, event: IndexEvent) {
        if let Some(listener) = &self.0 {
            listener.on_event(&event);
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventSink")
            .field(&self.0.as_ref().map(|_| "listener"))
            .finish()
    }
}
