//! Intrusive multi-producer single-consumer task queue.
//!
//! Vyukov-style: producers swap themselves into `head` and link the
//! previous head to the new node; the single consumer walks `tail` along
//! the `next` chain. A stub node keeps the chain non-empty, so neither side
//! ever allocates. A producer that has swapped `head` but not yet stored
//! the link leaves the queue observably empty for one pass; the consumer
//! treats that as transient and retries on its next tick.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use super::{RawTask, TaskRef};

pub(crate) struct TaskQueue {
    head: AtomicPtr<RawTask>,
    /// Consumer-only; exactly one thread may pop at a time.
    tail: UnsafeCell<*mut RawTask>,
    stub: Box<RawTask>,
    len: AtomicUsize,
    #[cfg(debug_assertions)]
    guard: std::sync::atomic::AtomicI32,
}

// Producers only touch `head` (atomic); `tail` is owned by the single
// consumer, which callers must enforce.
unsafe impl Send for TaskQueue {}
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        let stub = RawTask::stub();
        let stub_ptr = &*stub as *const RawTask as *mut RawTask;
        TaskQueue {
            head: AtomicPtr::new(stub_ptr),
            tail: UnsafeCell::new(stub_ptr),
            stub,
            len: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            guard: std::sync::atomic::AtomicI32::new(0),
        }
    }

    fn stub_ptr(&self) -> *mut RawTask {
        &*self.stub as *const RawTask as *mut RawTask
    }

    /// Multi-producer push. Takes over the caller's reference.
    pub fn push(&self, task: TaskRef) {
        let node = task.into_raw();
        unsafe {
            (*node).next.store(null_mut(), Relaxed);
            let prev = self.head.swap(node, AcqRel);
            self.len.fetch_add(1, Relaxed);
            // visible to the consumer through the acquire load of `next`;
            // ordered after the swap by its release half
            (*prev).next.store(node, Release);
        }
    }

    /// Single-consumer pop. Returns `None` both when empty and when a
    /// producer is mid-push; the distinction does not matter to the tick
    /// loop, which re-enters anyway.
    pub fn pop(&self) -> Option<TaskRef> {
        #[cfg(debug_assertions)]
        assert_eq!(
            self.guard.fetch_add(1, AcqRel),
            0,
            "second consumer entered single-consumer queue"
        );

        let result = unsafe { self.pop_inner() };

        #[cfg(debug_assertions)]
        assert_eq!(self.guard.fetch_sub(1, AcqRel), 1);

        result
    }

    unsafe fn pop_inner(&self) -> Option<TaskRef> {
        let stub = self.stub_ptr();
        let tail_slot = self.tail.get();

        unsafe {
            let mut tail = *tail_slot;
            let mut next = (*tail).next.load(Acquire);

            if tail == stub {
                if next.is_null() {
                    return None;
                }
                // step past the stub
                *tail_slot = next;
                tail = next;
                next = (*tail).next.load(Acquire);
            }

            if !next.is_null() {
                *tail_slot = next;
                self.len.fetch_sub(1, Relaxed);
                return Some(TaskRef::from_raw(tail));
            }

            let head = self.head.load(SeqCst);
            if tail != head {
                // producer raced between the head swap and the link store
                return None;
            }

            // one element left: park the stub behind it so the chain stays
            // non-empty, then take it
            (*stub).next.store(null_mut(), Relaxed);
            let prev = self.head.swap(stub, AcqRel);
            (*prev).next.store(stub, Release);

            next = (*tail).next.load(Acquire);
            if !next.is_null() {
                *tail_slot = next;
                self.len.fetch_sub(1, Relaxed);
                return Some(TaskRef::from_raw(tail));
            }

            None
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // no producers remain at drop time, so transient-empty is final
        while let Some(task) = self.pop() {
            drop(task);
        }
        debug_assert!(self.is_empty());
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::task::make_task;

    fn marker_task(log: &Arc<Mutex<Vec<usize>>>, id: usize) -> TaskRef {
        let log = log.clone();
        make_task(move |_| log.lock().unwrap().push(id))
    }

    #[test]
    fn empty_pop_returns_none() {
        let q = TaskQueue::new();
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_single_producer() {
        let q = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 0..16 {
            q.push(marker_task(&log, id));
        }
        assert_eq!(q.len(), 16);

        while let Some(task) = q.pop() {
            task.dispatch();
        }

        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn stub_cycles_cleanly() {
        // push-one-pop-one repeatedly exercises the stub re-park branch
        let q = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 0..100 {
            q.push(marker_task(&log, id));
            let task = q.pop().expect("queue had one element");
            task.dispatch();
        }

        assert_eq!(log.lock().unwrap().len(), 100);
        assert!(q.pop().is_none());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let q = Arc::new(TaskQueue::new());
        let popped = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        q.push(make_task(|_| {}));
                    }
                })
            })
            .collect();

        let consumer = {
            let q = q.clone();
            let popped = popped.clone();
            std::thread::spawn(move || {
                while popped.load(SeqCst) < PRODUCERS * PER_PRODUCER {
                    match q.pop() {
                        Some(task) => {
                            drop(task);
                            popped.fetch_add(1, SeqCst);
                        }
                        None => std::hint::spin_loop(),
                    }
                }
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        consumer.join().unwrap();

        assert_eq!(popped.load(SeqCst), PRODUCERS * PER_PRODUCER);
        assert!(q.pop().is_none());
    }

    #[test]
    fn per_producer_order_is_preserved() {
        const PER_PRODUCER: usize = 2_000;

        let q = Arc::new(TaskQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let producers: Vec<_> = (0..2usize)
            .map(|p| {
                let q = q.clone();
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.push(marker_task(&log, p * PER_PRODUCER + i));
                    }
                })
            })
            .collect();

        let mut seen = 0;
        while seen < 2 * PER_PRODUCER {
            if let Some(task) = q.pop() {
                task.dispatch();
                seen += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        for p in producers {
            p.join().unwrap();
        }

        let log = log.lock().unwrap();
        for p in 0..2 {
            let ids: Vec<_> = log
                .iter()
                .copied()
                .filter(|id| id / PER_PRODUCER == p)
                .collect();
            let expected: Vec<_> = (p * PER_PRODUCER..(p + 1) * PER_PRODUCER).collect();
            assert_eq!(ids, expected, "producer {p} order broken");
        }
    }
}
