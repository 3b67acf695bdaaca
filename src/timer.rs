//! One-shot timer support for the reactor.
//!
//! mio has no timer facility of its own, so deadlines are kept in a min-heap
//! consulted by the reactor when it computes the poll timeout. Expired
//! callbacks fire serially on the event-loop thread, after fd dispatch, with
//! no queue lock held.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
    sync::Mutex,
    time::{Duration, Instant},
};

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type TimerCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimerInner {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    // Cancelled ids are simply removed here; their heap entries are skipped
    // lazily when popped.
    callbacks: HashMap<u64, TimerCallback>,
}

#[derive(Default)]
pub struct TimerQueue {
    inner: Mutex<TimerInner>,
    next_id: AtomicU64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to run once, `delay` from now, on the event-loop
    /// thread.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let mut inner = self.inner.lock().unwrap();
        inner.deadlines.push(Reverse((deadline, id)));
        inner.callbacks.insert(id, Box::new(callback));
        TimerId(id)
    }

    /// Cancels a pending timer. Returns false if it already fired or was
    /// cancelled before.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.lock().unwrap().callbacks.remove(&id.0).is_some()
    }

    /// Deadline of the nearest pending timer, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let &Reverse((deadline, id)) = inner.deadlines.peek()?;
            if inner.callbacks.contains_key(&id) {
                return Some(deadline);
            }
            // stale entry for a cancelled timer
            inner.deadlines.pop();
        }
    }

    /// Collects every timer due at `now` and runs its callback with the queue
    /// unlocked, so callbacks may schedule or cancel timers.
    pub(crate) fn fire_expired(&self, now: Instant) {
        let due: Vec<TimerCallback> = {
            let mut inner = self.inner.lock().unwrap();
            let mut due = Vec::new();
            while let Some(&Reverse((deadline, id))) = inner.deadlines.peek() {
                if deadline > now {
                    break;
                }
                inner.deadlines.pop();
                if let Some(cb) = inner.callbacks.remove(&id) {
                    due.push(cb);
                }
            }
            due
        };
        for cb in due {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn fires_in_deadline_order() {
        let queue = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay_ms, tag) in [(30u64, 3), (10, 1), (20, 2)] {
            let order = order.clone();
            queue.schedule(Duration::from_millis(delay_ms), move || {
                order.lock().unwrap().push(tag);
            });
        }
        queue.fire_expired(Instant::now() + Duration::from_millis(100));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = queue.schedule(Duration::from_millis(1), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        queue.fire_expired(Instant::now() + Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(queue.next_deadline().is_none());
    }

    #[test]
    fn not_yet_due_timers_stay_pending() {
        let queue = TimerQueue::new();
        queue.schedule(Duration::from_secs(60), || {});
        queue.fire_expired(Instant::now());
        assert!(queue.next_deadline().is_some());
    }
}
