//! Decides when buffered state must be flushed
//!
//! The policy only inspects accounting snapshots and returns a decision.
//! The flush controller acts on it.

use super::thread_buffer::BufferId;
use crate::config::WriterConfig;
use crate::error::Result;

/// Accounting view of one active buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferStats {
    pub id: BufferId,
    pub bytes: u64,
    pub num_docs: usize,
    pub flush_pending: bool,
}

/// Global counters the policy looks at
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub active_bytes: u64,
    pub delete_bytes: u64,
    pub num_delete_terms: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushDecision {
    None,
    /// Mark this buffer flush-pending
    Flush(BufferId),
    /// Resolve buffered deletes against flushed segments
    ApplyDeletes,
}

/// Flush triggers built from the writer configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushPolicy {
    ram_buffer_bytes: Option<u64>,
    max_buffered_docs: Option<usize>,
    max_buffered_delete_terms: Option<usize>,
}

impl FlushPolicy {
    pub fn from_config(config: &WriterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ram_buffer_bytes: config.ram_buffer_bytes(),
            max_buffered_docs: config.max_buffered_docs,
            max_buffered_delete_terms: config.max_buffered_delete_terms,
        })
    }

    pub fn ram_buffer_bytes(&self) -> Option<u64> {
        self.ram_buffer_bytes
    }

    /// Called after a document landed in `current`
    pub fn on_insert(
        &self,
        current: &BufferStats,
        buffers: &[BufferStats],
        stats: &FlushStats,
    ) -> FlushDecision {
        if current.flush_pending {
            return FlushDecision::None;
        }
        if let Some(max_docs) = self.max_buffered_docs {
            if current.num_docs >= max_docs {
                return FlushDecision::Flush(current.id);
            }
        }
        self.check_ram(buffers, stats)
    }

    /// Called after a delete was buffered
    pub fn on_delete(&self, buffers: &[BufferStats], stats: &FlushStats) -> FlushDecision {
        if let Some(max_terms) = self.max_buffered_delete_terms {
            if stats.num_delete_terms >= max_terms {
                return FlushDecision::ApplyDeletes;
            }
        }
        if let Some(ram) = self.ram_buffer_bytes {
            if stats.delete_bytes > ram / 2 {
                return FlushDecision::ApplyDeletes;
            }
        }
        self.check_ram(buffers, stats)
    }

    fn check_ram(&self, buffers: &[BufferStats], stats: &FlushStats) -> FlushDecision {
        match self.ram_buffer_bytes {
            Some(ram) if stats.active_bytes + stats.delete_bytes >= ram => {
                match Self::largest_non_pending(buffers) {
                    Some(id) => FlushDecision::Flush(id),
                    None => FlushDecision::None,
                }
            }
            _ => FlushDecision::None,
        }
    }

    /// Largest buffer not already pending; ties go to the lowest id
    pub fn largest_non_pending(buffers: &[BufferStats]) -> Option<BufferId> {
        buffers
            .iter()
            .filter(|b| !b.flush_pending && b.num_docs > 0)
            .max_by(|a, b| a.bytes.cmp(&b.bytes).then(b.id.cmp(&a.id)))
            .map(|b| b.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(id: BufferId, bytes: u64, num_docs: usize) -> BufferStats {
        BufferStats {
            id,
            bytes,
            num_docs,
            flush_pending: false,
        }
    }

    fn policy(ram: Option<u64>, docs: Option<usize>, terms: Option<usize>) -> FlushPolicy {
        FlushPolicy {
            ram_buffer_bytes: ram,
            max_buffered_docs: docs,
            max_buffered_delete_terms: terms,
        }
    }

    #[test]
    fn test_doc_count_trigger() {
        let policy = policy(None, Some(2), None);
        let one = buffer(1, 10, 1);
        let two = buffer(1, 20, 2);
        let stats = FlushStats::default();

        assert_eq!(policy.on_insert(&one, &[one], &stats), FlushDecision::None);
        assert_eq!(policy.on_insert(&two, &[two], &stats), FlushDecision::Flush(1));
    }

    #[test]
    fn test_ram_trigger_picks_largest() {
        let policy = policy(Some(100), None, None);
        let buffers = [buffer(1, 30, 3), buffer(2, 50, 1), buffer(3, 20, 2)];
        let below = FlushStats {
            active_bytes: 99,
            ..Default::default()
        };
        let at = FlushStats {
            active_bytes: 100,
            ..Default::default()
        };

        assert_eq!(policy.on_insert(&buffers[0], &buffers, &below), FlushDecision::None);
        assert_eq!(
            policy.on_insert(&buffers[0], &buffers, &at),
            FlushDecision::Flush(2)
        );
    }

    #[test]
    fn test_ram_trigger_tie_breaks_on_lowest_id() {
        let buffers = [buffer(4, 50, 1), buffer(2, 50, 1), buffer(7, 50, 1)];
        assert_eq!(FlushPolicy::largest_non_pending(&buffers), Some(2));

        let mut pending = buffers;
        pending[1].flush_pending = true;
        assert_eq!(FlushPolicy::largest_non_pending(&pending), Some(4));
    }

    #[test]
    fn test_delete_triggers() {
        let terms = policy(Some(1000), None, Some(3));
        let stats = FlushStats {
            num_delete_terms: 3,
            ..Default::default()
        };
        assert_eq!(terms.on_delete(&[], &stats), FlushDecision::ApplyDeletes);

        let ram = policy(Some(1000), None, None);
        let stats = FlushStats {
            delete_bytes: 501,
            ..Default::default()
        };
        assert_eq!(ram.on_delete(&[], &stats), FlushDecision::ApplyDeletes);

        let stats = FlushStats {
            delete_bytes: 400,
            active_bytes: 600,
            ..Default::default()
        };
        let buffers = [buffer(1, 600, 4)];
        assert_eq!(ram.on_delete(&buffers, &stats), FlushDecision::Flush(1));
    }

    #[test]
    fn test_pending_buffer_not_reselected() {
        let policy = policy(None, Some(2), None);
        let mut current = buffer(1, 10, 5);
        current.flush_pending = true;
        assert_eq!(
            policy.on_insert(&current, &[current], &FlushStats::default()),
            FlushDecision::None
        );
    }
}
