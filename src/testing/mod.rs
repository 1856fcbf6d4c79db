//! Event capture and invariant checking for writer histories
//!
//! ```rust,ignore
//! use segdex::testing::prelude::*;
//!
//! let log = EventLog::new();
//! let options = WriterOptions::new().with_listener(Arc::new(log.clone()));
//! let writer = IndexWriter::open_with(dir, config, options)?;
//! // ... index, merge, commit ...
//! assert!(check_all_invariants(&log, &default_invariants()).is_empty());
//! ```
//!
//! Provided invariants:
//!
//! - **GenerationsStrictlyIncrease**: commits never repeat or reuse a generation
//! - **FlushedDocsAccounted**: merges never yield more documents than their sources
//! - **MergesAreDisjoint**: a segment takes part in at most one merge

pub mod events;
pub mod history;
pub mod invariants;

pub use events::{RecordedEvent, Timestamp};
pub use history::EventLog;
pub use invariants::{
    check_all_invariants, default_invariants, violated_names, FlushedDocsAccounted,
    GenerationsStrictlyIncrease, Invariant, MergesAreDisjoint, Violation,
};

pub mod prelude {
    pub use super::events::*;
    pub use super::history::EventLog;
    pub use super::invariants::{check_all_invariants, default_invariants, Invariant, Violation};
}
