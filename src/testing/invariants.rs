//! Invariant checks over recorded writer histories

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use super::events::RecordedEvent;
use super::history::EventLog;
use crate::index::IndexEvent;

/// A violation of an invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: String,
    pub description: String,
    /// Sequence numbers of the offending events
    pub violating_events: Vec<u64>,
    pub context: BTreeMap<String, String>,
}

impl Violation {
    fn new(invariant: &str, description: impl Into<String>, events: Vec<u64>) -> Self {
        Self {
            invariant: invariant.to_string(),
            description: description.into(),
            violating_events: events,
            context: BTreeMap::new(),
        }
    }

    fn with_context(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "INVARIANT VIOLATION: {}", self.invariant)?;
        writeln!(f, "  Description: {}", self.description)?;
        writeln!(f, "  Violating events: {:?}", self.violating_events)?;
        if !self.context.is_empty() {
            writeln!(f, "  Context:")?;
            for (key, value) in &self.context {
                writeln!(f, "    {}: {}", key, value)?;
            }
        }
        Ok(())
    }
}

pub trait Invariant: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, log: &EventLog) -> Result<(), Violation>;

    fn description(&self) -> &str {
        "No description provided"
    }
}

pub fn check_all_invariants(log: &EventLog, invariants: &[Box<dyn Invariant>]) -> Vec<Violation> {
    invariants
        .iter()
        .filter_map(|invariant| invariant.check(log).err())
        .collect()
}

pub fn default_invariants() -> Vec<Box<dyn Invariant>> {
    vec![
        Box::new(GenerationsStrictlyIncrease),
        Box::new(FlushedDocsAccounted),
        Box::new(MergesAreDisjoint),
    ]
}

/// Each successful commit has a higher generation than the one before,
/// and a rollback never lands past the newest commit
pub struct GenerationsStrictlyIncrease;

impl Invariant for GenerationsStrictlyIncrease {
    fn name(&self) -> &str {
        "GenerationsStrictlyIncrease"
    }

    fn description(&self) -> &str {
        "Committed generations strictly increase; no two commits share a generation"
    }

    fn check(&self, log: &EventLog) -> Result<(), Violation> {
        let mut last: Option<(u64, u64)> = None;
        for recorded in log.events() {
            match recorded.event {
                IndexEvent::Committed { generation, .. } => {
                    if let Some((prev_seq, prev)) = last {
                        if generation <= prev {
                            return Err(Violation::new(
                                self.name(),
                                format!("generation {} committed after {}", generation, prev),
                                vec![prev_seq, recorded.seq],
                            ));
                        }
                    }
                    last = Some((recorded.seq, generation));
                }
                IndexEvent::RolledBack { generation } => {
                    if let Some((prev_seq, prev)) = last {
                        if generation != prev {
                            return Err(Violation::new(
                                self.name(),
                                "rollback did not return to the newest commit",
                                vec![prev_seq, recorded.seq],
                            )
                            .with_context("newest", prev)
                            .with_context("rolled_back_to", generation));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Segment names are never reused, and a merge never yields more
/// documents than its sources held
pub struct FlushedDocsAccounted;

impl Invariant for FlushedDocsAccounted {
    fn name(&self) -> &str {
        "FlushedDocsAccounted"
    }

    fn description(&self) -> &str {
        "Every merged segment's documents come from known source segments"
    }

    fn check(&self, log: &EventLog) -> Result<(), Violation> {
        // Segments that existed before the log started are unknown; merges
        // over them are skipped rather than flagged
        let mut docs: HashMap<String, (u64, u32)> = HashMap::new();
        for recorded in log.events() {
            match &recorded.event {
                IndexEvent::Flushed { segment, docs: n, .. } => {
                    if let Some((seq, _)) = docs.insert(segment.clone(), (recorded.seq, *n)) {
                        return Err(Violation::new(
                            self.name(),
                            format!("segment {} created twice", segment),
                            vec![seq, recorded.seq],
                        ));
                    }
                }
                IndexEvent::MergeCompleted {
                    segments,
                    merged,
                    docs: n,
                    ..
                } => {
                    let sources: Option<u64> = segments
                        .iter()
                        .map(|s| docs.get(s).map(|&(_, d)| d as u64))
                        .sum();
                    if let Some(available) = sources {
                        if *n as u64 > available {
                            return Err(Violation::new(
                                self.name(),
                                format!("merge into {} produced extra documents", merged),
                                vec![recorded.seq],
                            )
                            .with_context("source_docs", available)
                            .with_context("merged_docs", n));
                        }
                    }
                    if let Some((seq, _)) = docs.insert(merged.clone(), (recorded.seq, *n)) {
                        return Err(Violation::new(
                            self.name(),
                            format!("segment {} created twice", merged),
                            vec![seq, recorded.seq],
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Running merges never share a source segment, and a segment consumed
/// by a completed merge is never merged again
pub struct MergesAreDisjoint;

impl MergesAreDisjoint {
    fn overlap(running: &HashMap<u64, (u64, Vec<String>)>, segments: &[String]) -> Option<u64> {
        running
            .values()
            .find(|(_, other)| other.iter().any(|s| segments.contains(s)))
            .map(|&(seq, _)| seq)
    }
}

impl Invariant for MergesAreDisjoint {
    fn name(&self) -> &str {
        "MergesAreDisjoint"
    }

    fn description(&self) -> &str {
        "No segment participates in two merges"
    }

    fn check(&self, log: &EventLog) -> Result<(), Violation> {
        let mut running: HashMap<u64, (u64, Vec<String>)> = HashMap::new();
        let mut consumed: HashMap<String, u64> = HashMap::new();
        for RecordedEvent { seq, event, .. } in log.events() {
            match event {
                IndexEvent::MergeStarted {
                    merge_id, segments, ..
                } => {
                    if let Some(other) = Self::overlap(&running, &segments) {
                        return Err(Violation::new(
                            self.name(),
                            format!("merge {} overlaps a running merge", merge_id),
                            vec![other, seq],
                        ));
                    }
                    if let Some(s) = segments.iter().find(|s| consumed.contains_key(*s)) {
                        return Err(Violation::new(
                            self.name(),
                            format!("segment {} was already merged away", s),
                            vec![consumed[s], seq],
                        ));
                    }
                    running.insert(merge_id, (seq, segments));
                }
                IndexEvent::MergeCompleted { merge_id, segments, .. } => {
                    running.remove(&merge_id);
                    consumed.extend(segments.into_iter().map(|s| (s, seq)));
                }
                IndexEvent::MergeAborted { merge_id, .. } => {
                    running.remove(&merge_id);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Names of invariants that failed, for terse assertions
pub fn violated_names(violations: &[Violation]) -> HashSet<String> {
    violations.iter().map(|v| v.invariant.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn flushed(log: &EventLog, segment: &str, docs: u32) {
        log.record(IndexEvent::Flushed {
            segment: segment.to_string(),
            docs,
            deleted: 0,
            bytes: 10,
        });
    }

    #[test]
    fn test_clean_history_passes() {
        let log = EventLog::new();
        flushed(&log, "_0", 2);
        flushed(&log, "_1", 3);
        log.record(IndexEvent::Committed { generation: 1, segments: names(&["_0", "_1"]) });
        log.record(IndexEvent::MergeStarted { merge_id: 1, segments: names(&["_0", "_1"]), forced: false });
        log.record(IndexEvent::MergeCompleted {
            merge_id: 1,
            segments: names(&["_0", "_1"]),
            merged: "_2".to_string(),
            docs: 4,
        });
        log.record(IndexEvent::Committed { generation: 2, segments: names(&["_2"]) });
        log.record(IndexEvent::RolledBack { generation: 2 });

        assert!(check_all_invariants(&log, &default_invariants()).is_empty());
    }

    #[test]
    fn test_repeated_generation_flagged() {
        let log = EventLog::new();
        log.record(IndexEvent::Committed { generation: 2, segments: vec![] });
        log.record(IndexEvent::Committed { generation: 2, segments: vec![] });

        let violation = GenerationsStrictlyIncrease.check(&log).unwrap_err();
        assert_eq!(violation.violating_events, vec![0, 1]);
    }

    #[test]
    fn test_merge_creating_documents_flagged() {
        let log = EventLog::new();
        flushed(&log, "_0", 1);
        flushed(&log, "_1", 1);
        log.record(IndexEvent::MergeCompleted {
            merge_id: 1,
            segments: names(&["_0", "_1"]),
            merged: "_2".to_string(),
            docs: 3,
        });

        let violations = check_all_invariants(&log, &default_invariants());
        assert!(violated_names(&violations).contains("FlushedDocsAccounted"));
        assert_eq!(violations[0].context["source_docs"], "2");
    }

    #[test]
    fn test_overlapping_merges_flagged() {
        let log = EventLog::new();
        log.record(IndexEvent::MergeStarted { merge_id: 1, segments: names(&["_0", "_1"]), forced: false });
        log.record(IndexEvent::MergeStarted { merge_id: 2, segments: names(&["_1", "_2"]), forced: true });

        assert!(MergesAreDisjoint.check(&log).is_err());

        let log = EventLog::new();
        log.record(IndexEvent::MergeStarted { merge_id: 1, segments: names(&["_0"]), forced: false });
        log.record(IndexEvent::MergeAborted { merge_id: 1, segments: names(&["_0"]), reason: "x".into() });
        log.record(IndexEvent::MergeStarted { merge_id: 2, segments: names(&["_0"]), forced: false });
        assert!(MergesAreDisjoint.check(&log).is_ok());
    }
}
