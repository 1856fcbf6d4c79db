//! Blocks indexing threads while flushing falls behind

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct StallState {
    stalled: bool,
    num_waiting: usize,
    /// Times any thread actually blocked
    stall_count: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StallControl {
    state: Mutex<StallState>,
    cond: Condvar,
}

impl StallControl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns true when the stall flag flipped
    pub(crate) fn update_stalled(&self, stalled: bool) -> bool {
        let mut state = self.state.lock();
        let changed = state.stalled != stalled;
        state.stalled = stalled;
        if !stalled {
            self.cond.notify_all();
        }
        changed
    }

    /// Block while stalled
    pub(crate) fn wait_if_stalled(&self) {
        let mut state = self.state.lock();
        if !state.stalled {
            return;
        }
        state.num_waiting += 1;
        state.stall_count += 1;
        while state.stalled {
            // Timed wait so a missed notify never wedges a thread
            self.cond.wait_for(&mut state, Duration::from_secs(1));
        }
        state.num_waiting -= 1;
    }

    pub(crate) fn is_stalled(&self) -> bool {
        self.state.lock().stalled
    }

    #[cfg(test)]
    pub(crate) fn has_blocked_threads(&self) -> bool {
        self.state.lock().num_waiting > 0
    }

    pub(crate) fn stall_count(&self) -> u64 {
        self.state.lock().stall_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_not_stalled_returns_immediately() {
        let control = StallControl::new();
        control.wait_if_stalled();
        assert_eq!(control.stall_count(), 0);
    }

    #[test]
    fn test_waiter_released_on_unstall() {
        let control = Arc::new(StallControl::new());
        assert!(control.update_stalled(true));
        assert!(!control.update_stalled(true));

        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.wait_if_stalled())
        };
        while !control.has_blocked_threads() {
            thread::yield_now();
        }
        assert!(control.update_stalled(false));
        waiter.join().unwrap();

        assert!(!control.is_stalled());
        assert_eq!(control.stall_count(), 1);
    }
}
