//! RAM accounting for thread buffers
//!
//! Every registered buffer is either active (collecting documents),
//! flush-pending (selected, still owned by its slot) or flushing (checked
//! out and being written). `active_bytes` covers the first group,
//! `flush_bytes` the other two. Both are recomputed from the per-buffer
//! accounts in debug builds after every change.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

use super::events::{EventSink, IndexEvent};
use super::flush_policy::{BufferStats, FlushDecision, FlushPolicy, FlushStats};
use super::stall_control::StallControl;
use super::thread_buffer::BufferId;

#[derive(Debug, Clone, Copy)]
struct Account {
    bytes: u64,
    num_docs: usize,
    pending: bool,
    delete_start: u64,
}

#[derive(Debug, Clone, Copy)]
struct Flushing {
    bytes: u64,
    num_docs: usize,
    delete_start: u64,
}

#[derive(Debug, Default)]
struct FlushState {
    accounts: BTreeMap<BufferId, Account>,
    flushing: BTreeMap<BufferId, Flushing>,
    active_bytes: u64,
    flush_bytes: u64,
    num_pending: usize,
    /// Buffers a running full flush still waits for
    full_flush: Option<BTreeSet<BufferId>>,
    closed: bool,
    peak_active_bytes: u64,
    peak_flush_bytes: u64,
    peak_net_bytes: u64,
    flushes_completed: u64,
}

impl FlushState {
    fn stats(&self, id: BufferId, account: &Account) -> BufferStats {
        BufferStats {
            id,
            bytes: account.bytes,
            num_docs: account.num_docs,
            flush_pending: account.pending,
        }
    }

    fn all_stats(&self) -> Vec<BufferStats> {
        self.accounts
            .iter()
            .map(|(id, account)| self.stats(*id, account))
            .collect()
    }

    fn set_pending(&mut self, id: BufferId) -> bool {
        match self.accounts.get_mut(&id) {
            Some(account) if !account.pending && account.num_docs > 0 => {
                account.pending = true;
                self.active_bytes -= account.bytes;
                self.flush_bytes += account.bytes;
                self.num_pending += 1;
                true
            }
            _ => false,
        }
    }

    fn checkout(&mut self, id: BufferId) -> bool {
        let Some(account) = self.accounts.remove(&id) else {
            return false;
        };
        if account.pending {
            self.num_pending -= 1;
        } else {
            self.active_bytes -= account.bytes;
            self.flush_bytes += account.bytes;
        }
        self.flushing.insert(
            id,
            Flushing {
                bytes: account.bytes,
                num_docs: account.num_docs,
                delete_start: account.delete_start,
            },
        );
        true
    }

    fn update_peaks(&mut self) {
        self.peak_active_bytes = self.peak_active_bytes.max(self.active_bytes);
        self.peak_flush_bytes = self.peak_flush_bytes.max(self.flush_bytes);
        self.peak_net_bytes = self
            .peak_net_bytes
            .max(self.active_bytes + self.flush_bytes);
    }

    fn check(&self) -> std::result::Result<(), String> {
        let active: u64 = self
            .accounts
            .values()
            .filter(|a| !a.pending)
            .map(|a| a.bytes)
            .sum();
        let pending: u64 = self
            .accounts
            .values()
            .filter(|a| a.pending)
            .map(|a| a.bytes)
            .sum();
        let flushing: u64 = self.flushing.values().map(|f| f.bytes).sum();
        let num_pending = self.accounts.values().filter(|a| a.pending).count();
        if active != self.active_bytes {
            return Err(format!(
                "active_bytes {} != sum of active buffers {}",
                self.active_bytes, active
            ));
        }
        if pending + flushing != self.flush_bytes {
            return Err(format!(
                "flush_bytes {} != pending {} + flushing {}",
                self.flush_bytes, pending, flushing
            ));
        }
        if num_pending != self.num_pending {
            return Err(format!(
                "num_pending {} != counted {}",
                self.num_pending, num_pending
            ));
        }
        Ok(())
    }
}

/// What the caller has to do after an accounting update
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushAction {
    /// The caller's buffer was checked out and must be flushed now
    pub(crate) checkout: bool,
    /// Buffered deletes should be applied to flushed segments
    pub(crate) apply_deletes: bool,
}

/// Tracks buffer RAM, applies the flush policy and drives stalling
#[derive(Debug)]
pub struct FlushController {
    state: Mutex<FlushState>,
    flushed: Condvar,
    stall: StallControl,
    policy: FlushPolicy,
    hard_limit_bytes: u64,
    stall_limit_bytes: u64,
    events: EventSink,
}

impl FlushController {
    pub(crate) fn new(policy: FlushPolicy, hard_limit_bytes: u64, events: EventSink) -> Self {
        let stall_limit_bytes = policy
            .ram_buffer_bytes()
            .map_or(u64::MAX, |ram| ram.saturating_mul(2));
        Self {
            state: Mutex::new(FlushState::default()),
            flushed: Condvar::new(),
            stall: StallControl::new(),
            policy,
            hard_limit_bytes,
            stall_limit_bytes,
            events,
        }
    }

    pub(crate) fn register(&self, id: BufferId, delete_start: u64) {
        let mut state = self.state.lock();
        state.accounts.insert(
            id,
            Account {
                bytes: 0,
                num_docs: 0,
                pending: false,
                delete_start,
            },
        );
    }

    /// Account for a document just added to buffer `id`
    pub(crate) fn do_after_document(
        &self,
        id: BufferId,
        bytes: u64,
        num_docs: usize,
        deletes: FlushStats,
    ) -> FlushAction {
        let mut state = self.state.lock();
        let Some(account) = state.accounts.get_mut(&id) else {
            debug_assert!(false, "document added to unregistered buffer {}", id);
            return FlushAction::default();
        };
        let previous = account.bytes;
        let pending = account.pending;
        account.bytes = bytes;
        account.num_docs = num_docs;
        let current = *account;
        if pending {
            state.flush_bytes = state.flush_bytes + bytes - previous;
        } else {
            state.active_bytes = state.active_bytes + bytes - previous;
        }

        if !pending {
            let stats = FlushStats {
                active_bytes: state.active_bytes,
                ..deletes
            };
            let decision = self
                .policy
                .on_insert(&state.stats(id, &current), &state.all_stats(), &stats);
            if let FlushDecision::Flush(target) = decision {
                if state.set_pending(target) {
                    debug!(buffer = target, active_bytes = state.active_bytes, "buffer marked flush-pending");
                }
            }
            let still_active = state.accounts.get(&id).map_or(false, |a| !a.pending);
            if still_active && bytes > self.hard_limit_bytes {
                warn!(buffer = id, bytes, limit = self.hard_limit_bytes, "buffer exceeded per-thread hard limit");
                state.set_pending(id);
            }
        }

        let checkout = state.accounts.get(&id).map_or(false, |a| a.pending) && state.checkout(id);
        state.update_peaks();
        self.after_change(&mut state);
        FlushAction {
            checkout,
            apply_deletes: false,
        }
    }

    /// Account for a newly buffered delete
    pub(crate) fn do_after_delete(&self, deletes: FlushStats) -> FlushAction {
        let mut state = self.state.lock();
        let stats = FlushStats {
            active_bytes: state.active_bytes,
            ..deletes
        };
        let mut action = FlushAction::default();
        match self.policy.on_delete(&state.all_stats(), &stats) {
            FlushDecision::ApplyDeletes => action.apply_deletes = true,
            FlushDecision::Flush(target) => {
                state.set_pending(target);
            }
            FlushDecision::None => {}
        }
        self.after_change(&mut state);
        action
    }

    #[cfg(test)]
    pub(crate) fn set_flush_pending(&self, id: BufferId) -> bool {
        let mut state = self.state.lock();
        let marked = state.set_pending(id);
        self.after_change(&mut state);
        marked
    }

    /// Check out a pending buffer that is not in use by its slot
    pub(crate) fn checkout_pending(&self, id: BufferId) -> bool {
        let mut state = self.state.lock();
        let pending = state.accounts.get(&id).map_or(false, |a| a.pending);
        let out = pending && state.checkout(id);
        self.after_change(&mut state);
        out
    }

    /// Buffers currently flush-pending
    pub(crate) fn pending_ids(&self) -> Vec<BufferId> {
        self.state
            .lock()
            .accounts
            .iter()
            .filter(|(_, a)| a.pending)
            .map(|(id, _)| *id)
            .collect()
    }

    /// A flushed buffer's segment is published
    pub(crate) fn do_after_flush(&self, id: BufferId) {
        let mut state = self.state.lock();
        if let Some(flushing) = state.flushing.remove(&id) {
            state.flush_bytes -= flushing.bytes;
            state.flushes_completed += 1;
        }
        if let Some(waiting) = state.full_flush.as_mut() {
            waiting.remove(&id);
        }
        self.after_change(&mut state);
        self.flushed.notify_all();
    }

    /// A buffer was discarded, flushing or not
    pub(crate) fn do_on_abort(&self, id: BufferId) {
        let mut state = self.state.lock();
        if let Some(flushing) = state.flushing.remove(&id) {
            state.flush_bytes -= flushing.bytes;
        }
        if let Some(account) = state.accounts.remove(&id) {
            if account.pending {
                state.flush_bytes -= account.bytes;
                state.num_pending -= 1;
            } else {
                state.active_bytes -= account.bytes;
            }
        }
        if let Some(waiting) = state.full_flush.as_mut() {
            waiting.remove(&id);
        }
        self.after_change(&mut state);
        self.flushed.notify_all();
    }

    /// Mark every non-empty buffer pending; returns the buffers a full flush
    /// must wait for
    pub(crate) fn mark_for_full_flush(&self) -> Vec<BufferId> {
        let mut state = self.state.lock();
        let ids: Vec<BufferId> = state
            .accounts
            .iter()
            .filter(|(_, a)| a.num_docs > 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            state.set_pending(*id);
        }
        let mut waiting: BTreeSet<BufferId> = ids.iter().copied().collect();
        waiting.extend(state.flushing.keys().copied());
        let previous = state.full_flush.take().unwrap_or_default();
        waiting.extend(previous);
        state.full_flush = Some(waiting);
        self.after_change(&mut state);
        ids
    }

    /// True once every buffer the full flush captured is flushed or
    /// aborted; otherwise waits up to `timeout` for progress
    pub(crate) fn full_flush_done(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let done = |state: &FlushState| state.full_flush.as_ref().map_or(true, |w| w.is_empty());
        if done(&state) {
            return true;
        }
        self.flushed.wait_for(&mut state, timeout);
        done(&state)
    }

    pub(crate) fn finish_full_flush(&self) {
        self.state.lock().full_flush = None;
    }

    #[cfg(test)]
    pub(crate) fn is_full_flush(&self) -> bool {
        self.state.lock().full_flush.is_some()
    }

    /// Block until no buffer is being flushed
    pub(crate) fn wait_for_flushes(&self) {
        let mut state = self.state.lock();
        while !state.flushing.is_empty() {
            self.flushed.wait_for(&mut state, Duration::from_millis(100));
        }
    }

    pub(crate) fn wait_if_stalled(&self) {
        self.stall.wait_if_stalled();
    }

    /// Lowest delete-log position any live buffer still needs
    pub(crate) fn min_delete_start(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .accounts
            .values()
            .map(|a| a.delete_start)
            .chain(state.flushing.values().map(|f| f.delete_start))
            .min()
    }

    pub(crate) fn set_closed(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.after_change(&mut state);
    }

    fn after_change(&self, state: &mut FlushState) {
        debug_assert_eq!(state.check(), Ok(()));
        let total = state.active_bytes + state.flush_bytes;
        let stalled = !state.closed
            && total > self.stall_limit_bytes
            && state.active_bytes < self.stall_limit_bytes;
        if self.stall.update_stalled(stalled) {
            if stalled {
                debug!(
                    active_bytes = state.active_bytes,
                    flush_bytes = state.flush_bytes,
                    "indexing stalled"
                );
                self.events.emit(IndexEvent::Stalled {
                    active_bytes: state.active_bytes,
                    flush_bytes: state.flush_bytes,
                });
            } else {
                self.events.emit(IndexEvent::Unstalled);
            }
        }
    }

    pub fn active_bytes(&self) -> u64 {
        self.state.lock().active_bytes
    }

    pub fn flush_bytes(&self) -> u64 {
        self.state.lock().flush_bytes
    }

    pub fn net_bytes(&self) -> u64 {
        let state = self.state.lock();
        state.active_bytes + state.flush_bytes
    }

    pub fn num_pending(&self) -> usize {
        self.state.lock().num_pending
    }

    pub fn num_flushing(&self) -> usize {
        self.state.lock().flushing.len()
    }

    /// Documents held by active, pending and flushing buffers
    pub fn num_buffered_docs(&self) -> usize {
        let state = self.state.lock();
        state.accounts.values().map(|a| a.num_docs).sum::<usize>()
            + state.flushing.values().map(|f| f.num_docs).sum::<usize>()
    }

    pub fn is_stalled(&self) -> bool {
        self.stall.is_stalled()
    }

    pub fn stall_count(&self) -> u64 {
        self.stall.stall_count()
    }

    pub fn peak_active_bytes(&self) -> u64 {
        self.state.lock().peak_active_bytes
    }

    pub fn peak_flush_bytes(&self) -> u64 {
        self.state.lock().peak_flush_bytes
    }

    pub fn peak_net_bytes(&self) -> u64 {
        self.state.lock().peak_net_bytes
    }

    pub fn flushes_completed(&self) -> u64 {
        self.state.lock().flushes_completed
    }

    pub fn stall_limit_bytes(&self) -> u64 {
        self.stall_limit_bytes
    }

    /// Recompute the counters from per-buffer accounts
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.state.lock().check()
    }
}
