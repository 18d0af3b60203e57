//! Per-thread min-heap of delayed tasks.
//!
//! Owned exclusively by one worker; tasks produced elsewhere arrive through
//! a routed MPSC inbox and are folded into the heap by the owning worker's
//! tick. Ties on the due-time fire in insertion order, which preserves
//! per-thread publication order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::clock::Ticks;
use crate::task::TaskRef;

struct TimerEntry {
    due: Ticks,
    seq: u64,
    task: TaskRef,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // inverted so the BinaryHeap surfaces the earliest entry
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerHeap {
    pub fn new() -> TimerHeap {
        TimerHeap::default()
    }

    pub fn push(&mut self, task: TaskRef) {
        let due = task.due();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry { due, seq, task });
    }

    /// Remove and return the earliest task whose due-time has passed.
    pub fn pop_due(&mut self, now: Ticks) -> Option<TaskRef> {
        if self.heap.peek().is_some_and(|e| e.due <= now) {
            return self.heap.pop().map(|e| e.task);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.heap.reserve(additional);
    }

    /// Drop every queued task without dispatching it. Shutdown path.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::make_task;

    fn task_due(due: Ticks) -> TaskRef {
        let task = make_task(|_| {});
        task.set_due(due);
        task
    }

    #[test]
    fn fires_in_due_order() {
        let mut heap = TimerHeap::new();
        for due in [30u64, 10, 20] {
            heap.push(task_due(due));
        }

        assert_eq!(heap.pop_due(100).unwrap().due(), 10);
        assert_eq!(heap.pop_due(100).unwrap().due(), 20);
        assert_eq!(heap.pop_due(100).unwrap().due(), 30);
        assert!(heap.pop_due(100).is_none());
    }

    #[test]
    fn not_due_stays_queued() {
        let mut heap = TimerHeap::new();
        heap.push(task_due(50));

        assert!(heap.pop_due(49).is_none());
        assert_eq!(heap.len(), 1);
        assert!(heap.pop_due(50).is_some());
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        use std::sync::{Arc, Mutex};

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut heap = TimerHeap::new();

        for id in 0..4 {
            let log = log.clone();
            let task = make_task(move |_| log.lock().unwrap().push(id));
            task.set_due(10);
            heap.push(task);
        }

        while let Some(task) = heap.pop_due(10) {
            task.dispatch();
        }

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn clear_releases_without_dispatch() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let task = make_task(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let mut heap = TimerHeap::new();
        heap.push(task);
        heap.clear();

        assert!(heap.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
