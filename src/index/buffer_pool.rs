//! Bounded pool of thread buffers
//!
//! A thread checks a buffer out for the duration of one operation and
//! checks it back in afterwards. At most `max_slots` buffers are out at
//! once; further callers wait. A buffer checked out for flushing is not
//! returned, which frees its slot for a fresh buffer.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

use super::thread_buffer::{BufferId, ThreadBuffer};

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<ThreadBuffer>,
    checked_out: usize,
    next_id: BufferId,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct BufferPool {
    state: Mutex<PoolState>,
    available: Condvar,
    max_slots: usize,
}

impl BufferPool {
    pub(crate) fn new(max_slots: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                next_id: 1,
                ..Default::default()
            }),
            available: Condvar::new(),
            max_slots: max_slots.max(1),
        }
    }

    /// Take an idle buffer or create one with `create`
    ///
    /// Returns `None` once the pool is closed.
    pub(crate) fn checkout<F>(&self, create: F) -> Option<ThreadBuffer>
    where
        F: FnOnce(BufferId) -> ThreadBuffer,
    {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(buffer) = state.idle.pop() {
                state.checked_out += 1;
                return Some(buffer);
            }
            if state.checked_out + state.idle.len() < self.max_slots {
                let id = state.next_id;
                state.next_id += 1;
                state.checked_out += 1;
                return Some(create(id));
            }
            self.available
                .wait_for(&mut state, Duration::from_millis(100));
        }
    }

    /// Return a slot, with its buffer unless it went to flush
    ///
    /// When the pool has been closed the buffer is handed back so the caller
    /// can discard it.
    pub(crate) fn checkin(&self, buffer: Option<ThreadBuffer>) -> Option<ThreadBuffer> {
        let mut state = self.state.lock();
        state.checked_out -= 1;
        let rejected = match buffer {
            Some(buffer) if !state.closed => {
                state.idle.push(buffer);
                None
            }
            other => other,
        };
        self.available.notify_one();
        rejected
    }

    /// Take the idle buffer `id`, occupying its slot
    pub(crate) fn take_idle(&self, id: BufferId) -> Option<ThreadBuffer> {
        let mut state = self.state.lock();
        let pos = state.idle.iter().position(|b| b.id() == id)?;
        state.checked_out += 1;
        Some(state.idle.swap_remove(pos))
    }

    /// Refuse further checkouts and return the idle buffers
    pub(crate) fn close(&self) -> Vec<ThreadBuffer> {
        let mut state = self.state.lock();
        state.closed = true;
        let drained = std::mem::take(&mut state.idle);
        self.available.notify_all();
        drained
    }

    /// Allow checkouts again after `close`
    pub(crate) fn reopen(&self) {
        self.state.lock().closed = false;
    }

    #[cfg(test)]
    pub(crate) fn num_checked_out(&self) -> usize {
        self.state.lock().checked_out
    }

    #[cfg(test)]
    pub(crate) fn num_idle(&self) -> usize {
        self.state.lock().idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reuse_idle_buffer() {
        let pool = BufferPool::new(2);
        let buffer = pool.checkout(|id| ThreadBuffer::new(id, 0)).unwrap();
        let id = buffer.id();
        assert!(pool.checkin(Some(buffer)).is_none());

        let again = pool.checkout(|id| ThreadBuffer::new(id, 0)).unwrap();
        assert_eq!(again.id(), id);
        pool.checkin(Some(again));
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.num_checked_out(), 0);
    }

    #[test]
    fn test_slots_are_bounded() {
        let pool = Arc::new(BufferPool::new(1));
        let held = pool.checkout(|id| ThreadBuffer::new(id, 0)).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let buffer = pool.checkout(|id| ThreadBuffer::new(id, 0)).unwrap();
                let id = buffer.id();
                pool.checkin(Some(buffer));
                id
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.num_checked_out(), 1);

        // flushed buffers free the slot without returning
        pool.checkin(None);
        let new_id = waiter.join().unwrap();
        assert_ne!(new_id, held.id());
    }

    #[test]
    fn test_take_idle_and_close() {
        let pool = BufferPool::new(4);
        let a = pool.checkout(|id| ThreadBuffer::new(id, 0)).unwrap();
        let b = pool.checkout(|id| ThreadBuffer::new(id, 0)).unwrap();
        let a_id = a.id();
        pool.checkin(Some(a));
        pool.checkin(Some(b));

        let taken = pool.take_idle(a_id).unwrap();
        assert_eq!(taken.id(), a_id);
        assert!(pool.take_idle(a_id).is_none());
        pool.checkin(None);

        assert_eq!(pool.close().len(), 1);
        assert!(pool.checkout(|id| ThreadBuffer::new(id, 0)).is_none());
        pool.reopen();
        assert!(pool.checkout(|id| ThreadBuffer::new(id, 0)).is_some());
    }
}
