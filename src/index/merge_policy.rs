//! Merge selection
//!
//! Policies look at the current segment list and return merges as plain
//! data. They never touch the writer: segments already taking part in a
//! running merge are passed in as `merging`, and deletion counts come from
//! the descriptors the writer hands over.
//!
//! Two families are provided:
//! - log-structured: segments are bucketed into logarithmic levels and
//!   `merge_factor` adjacent segments of one level are combined
//! - tiered: once the index holds more segments than its size budget
//!   allows, the best-scoring run of similarly sized segments is combined

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::segment_info::SegmentCommitInfo;
use crate::config::{LogMergeConfig, MergePolicyConfig, TieredMergeConfig};

/// Width of one level in the log policies, in units of log(merge_factor)
pub const LEVEL_LOG_SPAN: f64 = 0.75;

/// What caused the writer to ask for merges
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeTrigger {
    SegmentFlush,
    FullFlush,
    Explicit,
    MergeFinished,
    Closing,
}

/// Reason why segments should be merged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeReason {
    /// Enough segments collected on one log level
    LevelFull,
    /// More segments than the tiered budget allows
    TierOverflow,
    /// Explicit request to reduce the segment count
    Forced,
    /// Explicit request to drop deleted documents
    ForcedDeletes,
}

/// One proposed merge
#[derive(Clone, Debug, PartialEq)]
pub struct OneMerge {
    /// Names of the source segments, in index order
    pub segments: Vec<String>,
    /// Total size of the sources (bytes)
    pub estimated_size: u64,
    /// Higher runs first
    pub score: f64,
    pub reason: MergeReason,
    /// Set for forced merges
    pub max_num_segments: Option<usize>,
}

impl OneMerge {
    pub fn new(segments: &[&SegmentCommitInfo], reason: MergeReason) -> Self {
        Self {
            segments: segments.iter().map(|s| s.name().to_string()).collect(),
            estimated_size: segments.iter().map(|s| s.size_in_bytes).sum(),
            score: 0.0,
            reason,
            max_num_segments: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_max_num_segments(mut self, max: usize) -> Self {
        self.max_num_segments = Some(max);
        self
    }

    pub fn contains(&self, segment: &str) -> bool {
        self.segments.iter().any(|s| s == segment)
    }

    pub fn overlaps(&self, other: &OneMerge) -> bool {
        self.segments.iter().any(|s| other.contains(s))
    }
}

impl fmt::Display for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]", self.reason, self.segments.join(" "))
    }
}

/// Merges proposed in one policy call; never share a segment
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeSpecification {
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `merge` unless it shares a segment with one already present
    pub fn add(&mut self, merge: OneMerge) -> bool {
        if merge.segments.is_empty() || self.merges.iter().any(|m| m.overlaps(&merge)) {
            return false;
        }
        self.merges.push(merge);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.merges.len()
    }
}

/// Decides which segments to merge
pub trait MergePolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Natural merges, run after flushes and merges
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        segments: &[SegmentCommitInfo],
        merging: &HashSet<String>,
    ) -> MergeSpecification;

    /// Merges bringing the segments named in `segments_to_merge` down to at
    /// most `max_num_segments`
    ///
    /// The map value is true for segments that existed when the forced merge
    /// started and false for segments it produced.
    fn find_forced_merges(
        &self,
        segments: &[SegmentCommitInfo],
        max_num_segments: usize,
        segments_to_merge: &HashMap<String, bool>,
        merging: &HashSet<String>,
    ) -> MergeSpecification;

    /// Merges that drop deleted documents
    fn find_forced_deletes_merges(
        &self,
        segments: &[SegmentCommitInfo],
        merging: &HashSet<String>,
    ) -> MergeSpecification;
}

impl MergePolicyConfig {
    /// Instantiate the configured policy
    pub fn build(&self) -> Arc<dyn MergePolicy> {
        match self {
            MergePolicyConfig::LogByteSize(config) => {
                Arc::new(LogMergePolicy::new(config.clone(), SizeUnit::Bytes))
            }
            MergePolicyConfig::LogDocCount(config) => {
                Arc::new(LogMergePolicy::new(config.clone(), SizeUnit::Docs))
            }
            MergePolicyConfig::Tiered(config) => Arc::new(TieredMergePolicy::new(config.clone())),
            MergePolicyConfig::NoMerge => Arc::new(NoMergePolicy),
        }
    }
}

/// A segment counts as merged when it has nothing left to reclaim
fn is_merged(info: &SegmentCommitInfo) -> bool {
    !info.has_deletions()
}

/// What the log policies measure a segment by
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeUnit {
    Bytes,
    Docs,
}

/// Level-based merge policy
#[derive(Clone, Debug)]
pub struct LogMergePolicy {
    config: LogMergeConfig,
    unit: SizeUnit,
}

impl LogMergePolicy {
    pub fn new(config: LogMergeConfig, unit: SizeUnit) -> Self {
        Self { config, unit }
    }

    pub fn byte_size() -> Self {
        Self::new(LogMergeConfig::byte_size(), SizeUnit::Bytes)
    }

    pub fn doc_count() -> Self {
        Self::new(LogMergeConfig::doc_count(), SizeUnit::Docs)
    }

    pub fn config(&self) -> &LogMergeConfig {
        &self.config
    }

    fn size_docs(&self, info: &SegmentCommitInfo) -> u64 {
        if self.config.calibrate_size_by_deletes {
            info.live_doc_count() as u64
        } else {
            info.max_doc() as u64
        }
    }

    fn size_bytes(&self, info: &SegmentCommitInfo) -> u64 {
        if self.config.calibrate_size_by_deletes {
            (info.size_in_bytes as f64 * (1.0 - info.delete_ratio())) as u64
        } else {
            info.size_in_bytes
        }
    }

    fn size(&self, info: &SegmentCommitInfo) -> u64 {
        match self.unit {
            SizeUnit::Bytes => self.size_bytes(info),
            SizeUnit::Docs => self.size_docs(info),
        }
    }

    fn too_large_for_forced(&self, info: &SegmentCommitInfo) -> bool {
        self.size(info) > self.config.max_merge_size_for_forced_merge
            || self.size_docs(info) > self.config.max_merge_docs
    }

    /// True when no more than `max_num_segments` of the requested segments
    /// remain and a lone survivor needs no cleanup
    fn is_forced_merged(
        &self,
        segments: &[SegmentCommitInfo],
        max_num_segments: usize,
        segments_to_merge: &HashMap<String, bool>,
    ) -> bool {
        let mut num_to_merge = 0;
        let mut last: Option<(&SegmentCommitInfo, bool)> = None;
        for info in segments {
            if num_to_merge > max_num_segments {
                break;
            }
            if let Some(&original) = segments_to_merge.get(info.name()) {
                num_to_merge += 1;
                last = Some((info, original));
            }
        }
        num_to_merge <= max_num_segments
            && (num_to_merge != 1
                || last.map_or(true, |(info, original)| !original || is_merged(info)))
    }

    /// Segments a forced merge must leave standalone
    fn forced_boundary(&self, info: &SegmentCommitInfo, merging: &HashSet<String>) -> bool {
        self.too_large_for_forced(info) || merging.contains(info.name())
    }

    /// Forced merge around segments that cannot take part
    ///
    /// Oversized and already merging segments stay standalone; the runs
    /// between them are merged in windows of at most `merge_factor`.
    fn find_forced_merges_size_limit(
        &self,
        segments: &[SegmentCommitInfo],
        max_num_segments: usize,
        mut last: usize,
        merging: &HashSet<String>,
    ) -> MergeSpecification {
        let mut spec = MergeSpecification::new();
        let mut start = last as isize - 1;
        while start >= 0 {
            let s = start as usize;
            let info = &segments[s];
            if self.forced_boundary(info, merging) {
                debug!(
                    segment = %info.name(),
                    size = self.size(info),
                    merging = merging.contains(info.name()),
                    "forced merge leaves segment standalone"
                );
                self.push_bounded(&mut spec, &segments[s + 1..last], max_num_segments);
                last = s;
            } else if last - s == self.config.merge_factor {
                self.push_bounded(&mut spec, &segments[s..last], max_num_segments);
                last = s;
            }
            start -= 1;
        }
        self.push_bounded(&mut spec, &segments[..last], max_num_segments);
        spec
    }

    /// Add `run` as forced merges whose summed size and doc count stay
    /// within the forced-merge bounds
    ///
    /// Pieces are cut from the tail; a lone clean segment is left alone.
    fn push_bounded(
        &self,
        spec: &mut MergeSpecification,
        run: &[SegmentCommitInfo],
        max_num_segments: usize,
    ) {
        let mut end = run.len();
        while end > 0 {
            let mut start = end;
            let mut size = 0u64;
            let mut docs = 0u64;
            while start > 0 {
                let info = &run[start - 1];
                let next_size = size.saturating_add(self.size(info));
                let next_docs = docs.saturating_add(self.size_docs(info));
                if start < end
                    && (next_size > self.config.max_merge_size_for_forced_merge
                        || next_docs > self.config.max_merge_docs)
                {
                    break;
                }
                size = next_size;
                docs = next_docs;
                start -= 1;
            }
            let piece = &run[start..end];
            if piece.len() > 1 || !is_merged(&piece[0]) {
                spec.add(self.forced(piece, max_num_segments));
            }
            end = start;
        }
    }

    fn find_forced_merges_max_num_segments(
        &self,
        segments: &[SegmentCommitInfo],
        max_num_segments: usize,
        mut last: usize,
    ) -> MergeSpecification {
        let factor = self.config.merge_factor;
        let mut spec = MergeSpecification::new();

        // full windows of merge_factor from the tail
        while last + 1 >= factor + max_num_segments {
            self.push_bounded(&mut spec, &segments[last - factor..last], max_num_segments);
            last -= factor;
        }

        if spec.is_empty() {
            if max_num_segments == 1 {
                self.push_bounded(&mut spec, &segments[..last], max_num_segments);
            } else if last > max_num_segments {
                // one final merge of the cheapest adjacent run
                let final_merge_size = last - max_num_segments + 1;
                let mut best_size = 0u64;
                let mut best_start = 0usize;
                for i in 0..(last - final_merge_size + 1) {
                    let sum: u64 = segments[i..i + final_merge_size]
                        .iter()
                        .map(|s| self.size(s))
                        .sum();
                    if i == 0 || (sum < 2 * self.size(&segments[i - 1]) && sum < best_size) {
                        best_start = i;
                        best_size = sum;
                    }
                }
                self.push_bounded(
                    &mut spec,
                    &segments[best_start..best_start + final_merge_size],
                    max_num_segments,
                );
            }
        }
        spec
    }

    fn forced(&self, run: &[SegmentCommitInfo], max_num_segments: usize) -> OneMerge {
        let refs: Vec<&SegmentCommitInfo> = run.iter().collect();
        OneMerge::new(&refs, MergeReason::Forced).with_max_num_segments(max_num_segments)
    }
}

impl MergePolicy for LogMergePolicy {
    fn name(&self) -> &'static str {
        match self.unit {
            SizeUnit::Bytes => "log_byte_size",
            SizeUnit::Docs => "log_doc_count",
        }
    }

    fn find_merges(
        &self,
        trigger: MergeTrigger,
        segments: &[SegmentCommitInfo],
        merging: &HashSet<String>,
    ) -> MergeSpecification {
        let mut spec = MergeSpecification::new();
        if segments.is_empty() {
            return spec;
        }

        let norm = (self.config.merge_factor as f64).ln();
        let levels: Vec<f64> = segments
            .iter()
            .map(|s| (self.size(s).max(1) as f64).ln() / norm)
            .collect();
        let level_floor = if self.config.min_merge_size == 0 {
            0.0
        } else {
            (self.config.min_merge_size as f64).ln() / norm
        };

        let n = levels.len();
        let mut start = 0;
        while start < n {
            let max_level = levels[start..]
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);

            // everything under the floor is one level
            let level_bottom = if max_level <= level_floor {
                -1.0
            } else {
                let bottom = max_level - LEVEL_LOG_SPAN;
                if bottom < level_floor {
                    level_floor
                } else {
                    bottom
                }
            };

            let upto = (start..n)
                .rev()
                .find(|&i| levels[i] >= level_bottom)
                .unwrap_or(start);

            let mut end = start + self.config.merge_factor;
            while end <= upto + 1 {
                let window = &segments[start..end];
                let any_merging = window.iter().any(|s| merging.contains(s.name()));
                let any_too_large = window.iter().any(|s| {
                    self.size(s) >= self.config.max_merge_size
                        || self.size_docs(s) >= self.config.max_merge_docs
                });
                if !any_merging && !any_too_large {
                    let refs: Vec<&SegmentCommitInfo> = window.iter().collect();
                    let merge = OneMerge::new(&refs, MergeReason::LevelFull)
                        .with_score(max_level);
                    debug!(?trigger, merge = %merge, "log policy proposes merge");
                    spec.add(merge);
                }
                start = end;
                end = start + self.config.merge_factor;
            }
            start = upto + 1;
        }
        spec
    }

    fn find_forced_merges(
        &self,
        segments: &[SegmentCommitInfo],
        max_num_segments: usize,
        segments_to_merge: &HashMap<String, bool>,
        merging: &HashSet<String>,
    ) -> MergeSpecification {
        if max_num_segments == 0
            || self.is_forced_merged(segments, max_num_segments, segments_to_merge)
        {
            return MergeSpecification::new();
        }

        // only segments up to the last requested one take part
        let last = match segments
            .iter()
            .rposition(|s| segments_to_merge.contains_key(s.name()))
        {
            Some(pos) => pos + 1,
            None => return MergeSpecification::new(),
        };

        if max_num_segments == 1 && last == 1 && is_merged(&segments[0]) {
            return MergeSpecification::new();
        }

        let spec = if segments[..last]
            .iter()
            .any(|s| self.forced_boundary(s, merging))
        {
            self.find_forced_merges_size_limit(segments, max_num_segments, last, merging)
        } else {
            self.find_forced_merges_max_num_segments(segments, max_num_segments, last)
        };
        debug!(
            max_num_segments,
            merges = spec.len(),
            "log policy forced merge selection"
        );
        spec
    }

    fn find_forced_deletes_merges(
        &self,
        segments: &[SegmentCommitInfo],
        merging: &HashSet<String>,
    ) -> MergeSpecification {
        let mut spec = MergeSpecification::new();
        let mut first_with_deletions: Option<usize> = None;
        let run = |from: usize, to: usize| {
            let refs: Vec<&SegmentCommitInfo> = segments[from..to].iter().collect();
            OneMerge::new(&refs, MergeReason::ForcedDeletes)
        };

        for (i, info) in segments.iter().enumerate() {
            // a merging segment ends the run like a clean one
            let reclaim = info.has_deletions() && !merging.contains(info.name());
            match first_with_deletions {
                Some(first) if reclaim => {
                    if i - first == self.config.merge_factor {
                        spec.add(run(first, i));
                        first_with_deletions = Some(i);
                    }
                }
                None if reclaim => first_with_deletions = Some(i),
                Some(first) => {
                    spec.add(run(first, i));
                    first_with_deletions = None;
                }
                None => {}
            }
        }
        if let Some(first) = first_with_deletions {
            spec.add(run(first, segments.len()));
        }
        spec
    }
}

/// Merges segments of roughly equal byte size, up to a per-index budget
///
/// The budget allows `segments_per_tier` segments on each tier, where a
/// tier is `max_merge_at_once` times wider than the one below it.
/// Once the index holds more eligible segments than the budget, the
/// cheapest candidate merge is picked by score: evenly sized candidates
/// that reclaim many deletes win.
#[derive(Clone, Debug, Default)]
pub struct TieredMergePolicy {
    config: TieredMergeConfig,
}

impl TieredMergePolicy {
    pub fn new(config: TieredMergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TieredMergeConfig {
        &self.config
    }

    fn size(&self, info: &SegmentCommitInfo) -> u64 {
        (info.size_in_bytes as f64 * (1.0 - info.delete_ratio())) as u64
    }

    fn floor_size(&self, bytes: u64) -> u64 {
        bytes.max(self.config.floor_segment_bytes)
    }

    /// Largest first, ties broken by name
    fn sorted_by_size<'a>(
        &self,
        segments: impl Iterator<Item = &'a SegmentCommitInfo>,
    ) -> Vec<&'a SegmentCommitInfo> {
        let mut sorted: Vec<&SegmentCommitInfo> = segments.collect();
        sorted.sort_by(|a, b| {
            self.size(b)
                .cmp(&self.size(a))
                .then_with(|| a.name().cmp(b.name()))
        });
        sorted
    }

    /// Segments the index may hold before natural merges start
    fn allowed_segment_count(&self, total_bytes: u64, min_segment_bytes: u64) -> usize {
        let per_tier = self.config.segments_per_tier.max(1) as f64;
        let tier_growth = self.config.max_merge_at_once.max(2) as f64;
        let mut level_size = min_segment_bytes.max(1) as f64;
        let mut bytes_left = total_bytes as f64;
        let mut allowed = 0.0;
        loop {
            let level_count = bytes_left / level_size;
            if level_count < per_tier {
                allowed += level_count.ceil();
                break;
            }
            allowed += per_tier;
            bytes_left -= per_tier * level_size;
            level_size *= tier_growth;
        }
        allowed as usize
    }

    /// Lower is better
    fn score(&self, candidate: &[&SegmentCommitInfo], hit_too_large: bool) -> f64 {
        let mut before = 0u64;
        let mut after = 0u64;
        let mut after_floored = 0u64;
        for info in candidate {
            let size = self.size(info);
            before += info.size_in_bytes;
            after += size;
            after_floored += self.floor_size(size);
        }

        // a candidate cut short by the size cap is as good as a perfectly
        // even merge
        let skew = if hit_too_large {
            1.0 / self.config.max_merge_at_once as f64
        } else {
            self.floor_size(self.size(candidate[0])) as f64 / after_floored.max(1) as f64
        };
        let mut score = skew * (after as f64).powf(0.05);
        if before > 0 {
            let non_deleted_ratio = after as f64 / before as f64;
            score *= non_deleted_ratio.powf(self.config.reclaim_deletes_weight);
        }
        score
    }

    /// Best-scoring window of up to `max_merge_at_once` segments
    fn best_candidate<'a>(
        &self,
        eligible: &[&'a SegmentCommitInfo],
        max_merge_is_running: bool,
    ) -> Option<(Vec<&'a SegmentCommitInfo>, f64)> {
        let at_once = self.config.max_merge_at_once;
        let mut best: Option<(Vec<&SegmentCommitInfo>, f64)> = None;
        if eligible.len() < at_once {
            return None;
        }
        for start in 0..=eligible.len() - at_once {
            let mut candidate = Vec::with_capacity(at_once);
            let mut total = 0u64;
            let mut hit_too_large = false;
            for &info in &eligible[start..] {
                if candidate.len() == at_once {
                    break;
                }
                let size = self.size(info);
                if total + size > self.config.max_merged_segment_bytes {
                    // keep packing smaller segments behind it
                    hit_too_large = true;
                    continue;
                }
                candidate.push(info);
                total += size;
            }
            if candidate.is_empty() || (hit_too_large && max_merge_is_running) {
                continue;
            }
            let score = self.score(&candidate, hit_too_large);
            if best.as_ref().map_or(true, |(_, s)| score < *s) {
                best = Some((candidate, score));
            }
        }
        best
    }

    /// Add `window` (largest first) as forced merges, packing from the
    /// small end so no merge grows past the size cap
    fn push_bounded(
        &self,
        spec: &mut MergeSpecification,
        window: &[&SegmentCommitInfo],
        max_num_segments: usize,
    ) {
        let mut end = window.len();
        while end > 0 {
            let mut start = end;
            let mut total = 0u64;
            while start > 0 {
                let size = self.size(window[start - 1]);
                if start < end && total + size > self.config.max_merged_segment_bytes {
                    break;
                }
                total += size;
                start -= 1;
            }
            let piece = &window[start..end];
            if piece.len() > 1 || !is_merged(piece[0]) {
                spec.add(OneMerge::new(piece, MergeReason::Forced).with_max_num_segments(max_num_segments));
            }
            end = start;
        }
    }
}

impl MergePolicy for TieredMergePolicy {
    fn name(&self) -> &'static str {
        "tiered"
    }

    fn find_merges(
        &self,
        trigger: MergeTrigger,
        segments: &[SegmentCommitInfo],
        merging: &HashSet<String>,
    ) -> MergeSpecification {
        let mut spec = MergeSpecification::new();
        if segments.is_empty() {
            return spec;
        }
        let sorted = self.sorted_by_size(segments.iter());
        let mut total_bytes: u64 = sorted.iter().map(|s| self.size(s)).sum();
        let min_segment_bytes = sorted.iter().map(|s| self.size(s)).min().unwrap_or(0);

        // segments already near the cap never merge again and do not count
        let half_cap = self.config.max_merged_segment_bytes / 2;
        let too_big = sorted
            .iter()
            .take_while(|s| self.size(s) >= half_cap)
            .count();
        total_bytes -= sorted[..too_big].iter().map(|s| self.size(s)).sum::<u64>();

        let allowed = self.allowed_segment_count(total_bytes, self.floor_size(min_segment_bytes));

        let mut to_be_merged: HashSet<&str> = HashSet::new();
        loop {
            let mut merging_bytes = 0u64;
            let mut eligible = Vec::new();
            for &info in &sorted[too_big..] {
                if merging.contains(info.name()) {
                    merging_bytes += info.size_in_bytes;
                } else if !to_be_merged.contains(info.name()) {
                    eligible.push(info);
                }
            }
            if eligible.is_empty() || eligible.len() < allowed {
                break;
            }

            let max_merge_is_running = merging_bytes >= self.config.max_merged_segment_bytes;
            let Some((best, score)) = self.best_candidate(&eligible, max_merge_is_running) else {
                break;
            };
            to_be_merged.extend(best.iter().copied().map(SegmentCommitInfo::name));
            let merge = OneMerge::new(&best, MergeReason::TierOverflow)
                .with_score(1.0 / score.max(f64::MIN_POSITIVE));
            debug!(
                ?trigger,
                merge = %merge,
                score,
                allowed,
                eligible = eligible.len(),
                "tiered policy proposes merge"
            );
            spec.add(merge);
        }
        spec
    }

    fn find_forced_merges(
        &self,
        segments: &[SegmentCommitInfo],
        max_num_segments: usize,
        segments_to_merge: &HashMap<String, bool>,
        merging: &HashSet<String>,
    ) -> MergeSpecification {
        let mut spec = MergeSpecification::new();
        if max_num_segments == 0 {
            return spec;
        }

        let mut eligible = Vec::new();
        let mut oversized = 0usize;
        let mut forced_merge_running = false;
        let mut original = false;
        for info in segments {
            let Some(&is_original) = segments_to_merge.get(info.name()) else {
                continue;
            };
            original = is_original;
            if merging.contains(info.name()) {
                forced_merge_running = true;
            } else if self.size(info) > self.config.max_merged_segment_bytes {
                oversized += 1;
            } else {
                eligible.push(info);
            }
        }
        if eligible.is_empty() {
            return spec;
        }

        // oversized segments stay as they are and use up part of the target
        let target = max_num_segments.saturating_sub(oversized).max(1);
        if (target > 1 && eligible.len() <= target)
            || (target == 1 && eligible.len() == 1 && (!original || is_merged(eligible[0])))
        {
            return spec;
        }

        let eligible = self.sorted_by_size(eligible.into_iter());
        let explicit = self.config.max_merge_at_once_explicit.max(2);
        let mut end = eligible.len();
        while end >= explicit + target - 1 {
            self.push_bounded(&mut spec, &eligible[end - explicit..end], max_num_segments);
            end -= explicit;
        }
        if spec.is_empty() && !forced_merge_running && end >= target {
            let num = end - target + 1;
            self.push_bounded(&mut spec, &eligible[end - num..end], max_num_segments);
        }
        debug!(
            max_num_segments,
            oversized,
            merges = spec.len(),
            "tiered policy forced merge selection"
        );
        spec
    }

    fn find_forced_deletes_merges(
        &self,
        segments: &[SegmentCommitInfo],
        merging: &HashSet<String>,
    ) -> MergeSpecification {
        let with_deletes = self.sorted_by_size(
            segments
                .iter()
                .filter(|s| !merging.contains(s.name()))
                .filter(|s| s.delete_ratio() * 100.0 > self.config.force_merge_deletes_pct_allowed),
        );

        let mut spec = MergeSpecification::new();
        for chunk in with_deletes.chunks(self.config.max_merge_at_once_explicit.max(1)) {
            spec.add(OneMerge::new(chunk, MergeReason::ForcedDeletes));
        }
        spec
    }
}

/// Never merges
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn name(&self) -> &'static str {
        "no_merge"
    }

    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        _segments: &[SegmentCommitInfo],
        _merging: &HashSet<String>,
    ) -> MergeSpecification {
        MergeSpecification::new()
    }

    fn find_forced_merges(
        &self,
        _segments: &[SegmentCommitInfo],
        _max_num_segments: usize,
        _segments_to_merge: &HashMap<String, bool>,
        _merging: &HashSet<String>,
    ) -> MergeSpecification {
        MergeSpecification::new()
    }

    fn find_forced_deletes_merges(
        &self,
        _segments: &[SegmentCommitInfo],
        _merging: &HashSet<String>,
    ) -> MergeSpecification {
        MergeSpecification::new()
    }
}
