use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};

/// Default RAM buffer before a flush is triggered (MB)
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// Default per-buffer hard limit (MB). Must stay below 2048.
pub const DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB: u64 = 1945;

/// Default number of concurrently active thread buffers
pub const DEFAULT_MAX_THREAD_STATES: usize = 8;

/// How the writer treats an existing index in its directory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Start a new index, dropping whatever the latest commit references
    Create,
    /// Open the existing index; fails when there is none
    Append,
    /// Append when an index exists, otherwise create
    CreateOrAppend,
}

/// Settings shared by the log-structured merge policies
///
/// Sizes are bytes for [`MergePolicyConfig::LogByteSize`] and document
/// counts for [`MergePolicyConfig::LogDocCount`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogMergeConfig {
    /// How many same-level segments get merged at once
    pub merge_factor: usize,
    /// Segments below this size are all treated as one level
    pub min_merge_size: u64,
    /// Segments above this size never take part in natural merges
    pub max_merge_size: u64,
    /// Segments above this size are left standalone by forced merges
    pub max_merge_size_for_forced_merge: u64,
    /// Segments with more documents than this are never merged
    pub max_merge_docs: u64,
    /// Discount deleted documents when computing segment size
    pub calibrate_size_by_deletes: bool,
}

impl LogMergeConfig {
    /// Defaults for byte-sized segments
    pub fn byte_size() -> Self {
        Self {
            merge_factor: 10,
            // 1.6MB
            min_merge_size: (1.6 * 1024.0 * 1024.0) as u64,
            // 2GB
            max_merge_size: 2048 * 1024 * 1024,
            max_merge_size_for_forced_merge: u64::MAX,
            max_merge_docs: u64::MAX,
            calibrate_size_by_deletes: true,
        }
    }

    /// Defaults for document-count-sized segments
    pub fn doc_count() -> Self {
        Self {
            merge_factor: 10,
            min_merge_size: 1000,
            max_merge_size: u64::MAX,
            max_merge_size_for_forced_merge: u64::MAX,
            max_merge_docs: u64::MAX,
            calibrate_size_by_deletes: true,
        }
    }

    pub fn with_merge_factor(mut self, merge_factor: usize) -> Self {
        self.merge_factor = merge_factor;
        self
    }

    pub fn with_max_merge_size_for_forced_merge(mut self, size: u64) -> Self {
        self.max_merge_size_for_forced_merge = size;
        self
    }

    pub fn with_max_merge_docs(mut self, docs: u64) -> Self {
        self.max_merge_docs = docs;
        self
    }

    pub fn with_min_merge_size(mut self, size: u64) -> Self {
        self.min_merge_size = size;
        self
    }
}

/// Settings for the tiered merge policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TieredMergeConfig {
    /// Segments allowed per tier before a merge is proposed
    pub segments_per_tier: usize,
    /// Maximum segments merged at once in natural merges
    pub max_merge_at_once: usize,
    /// Maximum segments merged at once in forced merges
    pub max_merge_at_once_explicit: usize,
    /// Merged segments should not grow beyond this (bytes)
    pub max_merged_segment_bytes: u64,
    /// Segments below this size are rounded up when tiering
    pub floor_segment_bytes: u64,
    /// Exponent on the live-bytes ratio when scoring merges; higher values
    /// favor reclaiming deletes
    pub reclaim_deletes_weight: f64,
    /// Delete ratio a forced-deletes merge tolerates
    pub force_merge_deletes_pct_allowed: f64,
}

impl Default for TieredMergeConfig {
    fn default() -> Self {
        Self {
            segments_per_tier: 10,
            max_merge_at_once: 10,
            max_merge_at_once_explicit: 30,
            // 5GB
            max_merged_segment_bytes: 5 * 1024 * 1024 * 1024,
            // 2MB
            floor_segment_bytes: 2 * 1024 * 1024,
            reclaim_deletes_weight: 2.0,
            force_merge_deletes_pct_allowed: 10.0,
        }
    }
}

/// Which merge policy the writer consults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MergePolicyConfig {
    LogByteSize(LogMergeConfig),
    LogDocCount(LogMergeConfig),
    Tiered(TieredMergeConfig),
    NoMerge,
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        MergePolicyConfig::LogByteSize(LogMergeConfig::byte_size())
    }
}

/// Where merges run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeSchedulerConfig {
    /// Merges run on the thread that triggered them, one at a time
    Serial,
    /// Merges run on background workers
    Concurrent { max_threads: usize },
}

impl Default for MergeSchedulerConfig {
    fn default() -> Self {
        MergeSchedulerConfig::Concurrent {
            max_threads: (num_cpus::get() / 2).clamp(1, 3),
        }
    }
}

/// Index writer configuration
///
/// `None` disables a flush trigger. RAM and document-count triggers cannot
/// both be disabled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriterConfig {
    pub ram_buffer_size_mb: Option<f64>,
    pub max_buffered_docs: Option<usize>,
    pub max_buffered_delete_terms: Option<usize>,
    pub ram_per_thread_hard_limit_mb: u64,
    pub max_thread_states: usize,
    pub open_mode: OpenMode,
    pub use_compound_file: bool,
    pub merge_policy: MergePolicyConfig,
    pub merge_scheduler: MergeSchedulerConfig,
    pub commit_on_close: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            ram_per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            max_thread_states: DEFAULT_MAX_THREAD_STATES,
            open_mode: OpenMode::CreateOrAppend,
            use_compound_file: true,
            merge_policy: MergePolicyConfig::default(),
            merge_scheduler: MergeSchedulerConfig::default(),
            commit_on_close: true,
        }
    }
}

impl WriterConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ram_buffer_size_mb(mut self, mb: Option<f64>) -> Self {
        self.ram_buffer_size_mb = mb;
        self
    }

    pub fn with_max_buffered_docs(mut self, docs: Option<usize>) -> Self {
        self.max_buffered_docs = docs;
        self
    }

    pub fn with_max_buffered_delete_terms(mut self, terms: Option<usize>) -> Self {
        self.max_buffered_delete_terms = terms;
        self
    }

    pub fn with_ram_per_thread_hard_limit_mb(mut self, mb: u64) -> Self {
        self.ram_per_thread_hard_limit_mb = mb;
        self
    }

    pub fn with_max_thread_states(mut self, states: usize) -> Self {
        self.max_thread_states = states;
        self
    }

    pub fn with_open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    pub fn with_compound_file(mut self, enabled: bool) -> Self {
        self.use_compound_file = enabled;
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicyConfig) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_merge_scheduler(mut self, scheduler: MergeSchedulerConfig) -> Self {
        self.merge_scheduler = scheduler;
        self
    }

    pub fn with_commit_on_close(mut self, commit: bool) -> Self {
        self.commit_on_close = commit;
        self
    }

    /// RAM buffer in bytes, if the RAM trigger is enabled
    pub fn ram_buffer_bytes(&self) -> Option<u64> {
        self.ram_buffer_size_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as u64)
    }

    pub fn ram_per_thread_hard_limit_bytes(&self) -> u64 {
        self.ram_per_thread_hard_limit_mb * 1024 * 1024
    }

    /// Reject combinations the writer cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.ram_buffer_size_mb.is_none() && self.max_buffered_docs.is_none() {
            return Err(IndexError::InvalidConfiguration(
                "at least one of ram_buffer_size_mb and max_buffered_docs must be enabled"
                    .to_string(),
            ));
        }
        if let Some(mb) = self.ram_buffer_size_mb {
            if !(mb > 0.0) {
                return Err(IndexError::InvalidConfiguration(format!(
                    "ram_buffer_size_mb must be > 0.0 (got {})",
                    mb
                )));
            }
        }
        if let Some(docs) = self.max_buffered_docs {
            if docs < 2 {
                return Err(IndexError::InvalidConfiguration(format!(
                    "max_buffered_docs must at least be 2 (got {})",
                    docs
                )));
            }
        }
        if let Some(terms) = self.max_buffered_delete_terms {
            if terms < 1 {
                return Err(IndexError::InvalidConfiguration(
                    "max_buffered_delete_terms must at least be 1".to_string(),
                ));
            }
        }
        if self.ram_per_thread_hard_limit_mb == 0 || self.ram_per_thread_hard_limit_mb >= 2048 {
            return Err(IndexError::InvalidConfiguration(format!(
                "ram_per_thread_hard_limit_mb must be greater than 0 and less than 2048 (got {})",
                self.ram_per_thread_hard_limit_mb
            )));
        }
        if self.max_thread_states == 0 {
            return Err(IndexError::InvalidConfiguration(
                "max_thread_states must be at least 1".to_string(),
            ));
        }
        if let MergeSchedulerConfig::Concurrent { max_threads: 0 } = self.merge_scheduler {
            return Err(IndexError::InvalidConfiguration(
                "concurrent merge scheduler needs at least one thread".to_string(),
            ));
        }
        match &self.merge_policy {
            MergePolicyConfig::LogByteSize(log) | MergePolicyConfig::LogDocCount(log) => {
                if log.merge_factor < 2 {
                    return Err(IndexError::InvalidConfiguration(
                        "merge_factor cannot be less than 2".to_string(),
                    ));
                }
            }
            MergePolicyConfig::Tiered(tiered) => {
                if tiered.max_merge_at_once < 2 || tiered.segments_per_tier < 2 {
                    return Err(IndexError::InvalidConfiguration(
                        "tiered policy needs segments_per_tier and max_merge_at_once >= 2"
                            .to_string(),
                    ));
                }
                if !(tiered.reclaim_deletes_weight >= 0.0) {
                    return Err(IndexError::InvalidConfiguration(format!(
                        "reclaim_deletes_weight must be >= 0.0 (got {})",
                        tiered.reclaim_deletes_weight
                    )));
                }
            }
            MergePolicyConfig::NoMerge => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WriterConfig::default();
        assert_eq!(config.ram_buffer_size_mb, Some(16.0));
        assert_eq!(config.max_buffered_docs, None);
        assert_eq!(config.ram_per_thread_hard_limit_mb, 1945);
        assert_eq!(config.max_thread_states, 8);
        assert_eq!(config.open_mode, OpenMode::CreateOrAppend);
        assert!(config.commit_on_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_both_triggers_disabled_is_rejected() {
        let config = WriterConfig::new()
            .with_ram_buffer_size_mb(None)
            .with_max_buffered_docs(None);
        assert!(matches!(
            config.validate(),
            Err(IndexError::InvalidConfiguration(_))
        ));

        let config = WriterConfig::new()
            .with_ram_buffer_size_mb(None)
            .with_max_buffered_docs(Some(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        assert!(WriterConfig::new()
            .with_max_buffered_docs(Some(1))
            .validate()
            .is_err());
        assert!(WriterConfig::new()
            .with_ram_per_thread_hard_limit_mb(2048)
            .validate()
            .is_err());
        assert!(WriterConfig::new()
            .with_max_thread_states(0)
            .validate()
            .is_err());
        assert!(WriterConfig::new()
            .with_merge_policy(MergePolicyConfig::LogDocCount(
                LogMergeConfig::doc_count().with_merge_factor(1)
            ))
            .validate()
            .is_err());
        assert!(WriterConfig::new()
            .with_merge_policy(MergePolicyConfig::Tiered(TieredMergeConfig {
                reclaim_deletes_weight: -1.0,
                ..Default::default()
            }))
            .validate()
            .is_err());
    }

    #[test]
    fn test_byte_conversions() {
        let config = WriterConfig::new().with_ram_buffer_size_mb(Some(1.0));
        assert_eq!(config.ram_buffer_bytes(), Some(1024 * 1024));
        assert_eq!(
            WriterConfig::default().ram_per_thread_hard_limit_bytes(),
            1945 * 1024 * 1024
        );
    }
}
