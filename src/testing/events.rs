//! Recorded writer events
//!
//! Wraps each [`IndexEvent`] with a sequence number, the recording thread
//! and a timestamp so histories from concurrent writers can be replayed
//! in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::index::IndexEvent;

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_nanos_opt().unwrap_or(0))
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.0)
    }
}

/// One writer event as it was observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Position in the log, starting at 0
    pub seq: u64,
    pub at: Timestamp,
    /// Name (or id) of the thread the writer emitted from
    pub thread: String,
    pub event: IndexEvent,
}

impl RecordedEvent {
    pub fn new(seq: u64, event: IndexEvent) -> Self {
        let current = std::thread::current();
        let thread = current
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        Self {
            seq,
            at: Timestamp::now(),
            thread,
            event,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}

impl fmt::Display for RecordedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [{}] {} @ {}",
            self.seq,
            self.thread,
            self.event,
            self.at.to_datetime().to_rfc3339()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        let t1 = Timestamp::from_nanos(100);
        let t2 = Timestamp::from_nanos(200);

        assert!(t1 < t2);
        assert_eq!(t1, Timestamp::from_nanos(100));
        assert_eq!(t2.as_nanos(), 200);
    }

    #[test]
    fn test_recorded_event_display() {
        let recorded = RecordedEvent::new(7, IndexEvent::Committed {
            generation: 3,
            segments: vec!["_0".to_string()],
        });

        assert_eq!(recorded.kind(), "committed");
        let text = recorded.to_string();
        assert!(text.starts_with("#7 ["));
        assert!(text.contains("committed"));
    }
}
