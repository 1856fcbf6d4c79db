//! Thread-safe capture of writer event histories
//!
//! [`EventLog`] is an [`IndexEventListener`]: hand a clone to
//! [`WriterOptions::with_listener`](crate::WriterOptions::with_listener)
//! and keep the other to inspect what the writer did.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::events::{RecordedEvent, Timestamp};
use crate::index::{IndexEvent, IndexEventListener};

#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<RwLock<Vec<RecordedEvent>>>,
    next_seq: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event`; called by the writer through the listener trait
    pub fn record(&self, event: IndexEvent) -> u64 {
        // Sequence and append happen under one lock so seq matches position
        let mut events = self.events.write();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        events.push(RecordedEvent::new(seq, event));
        seq
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().clone()
    }

    /// Bare events in recording order
    pub fn index_events(&self) -> Vec<IndexEvent> {
        self.events.read().iter().map(|e| e.event.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose [`IndexEvent::kind`] equals `kind`
    pub fn of_kind(&self, kind: &str) -> Vec<RecordedEvent> {
        self.filter(|e| e.kind() == kind)
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.read().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn filter(&self, keep: impl Fn(&IndexEvent) -> bool) -> Vec<RecordedEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| keep(&e.event))
            .cloned()
            .collect()
    }

    pub fn events_in_range(&self, start: Timestamp, end: Timestamp) -> Vec<RecordedEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.at >= start && e.at <= end)
            .cloned()
            .collect()
    }

    /// Generations of successful commits, in order
    pub fn committed_generations(&self) -> Vec<u64> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e.event {
                IndexEvent::Committed { generation, .. } => Some(generation),
                _ => None,
            })
            .collect()
    }

    /// Total documents across flushed segments
    pub fn flushed_docs(&self) -> u64 {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e.event {
                IndexEvent::Flushed { docs, .. } => Some(docs as u64),
                _ => None,
            })
            .sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&*self.events.read())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let events: Vec<RecordedEvent> = serde_json::from_str(json)?;
        let next = events.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        Ok(Self {
            events: Arc::new(RwLock::new(events)),
            next_seq: Arc::new(AtomicU64::new(next)),
        })
    }
}

impl IndexEventListener for EventLog {
    fn on_event(&self, event: &IndexEvent) {
        self.record(event.clone());
    }
}
