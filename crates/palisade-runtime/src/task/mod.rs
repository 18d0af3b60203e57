//! Reference-counted task nodes and the free-task entry points.
//!
//! A task is a heap node carrying an intrusive `next` pointer (so it can sit
//! in the lock-free inbox queues without allocation), an absolute due-time
//! (0 = immediate), an optional parent handle for object-bound tasks, and a
//! type-erased body. [`TaskRef`] is the owning smart pointer; the node is
//! freed when the last reference drops.
//!
//! Free tasks are created with [`make_task`] and scheduled with
//! [`defer_task`] / [`defer_task_after`]. A running timer task re-arms
//! itself through its [`TaskCtx`], which lands it in the thread's *pending*
//! buffer so it cannot fire twice in the same tick.

pub(crate) mod queue;

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, fence};
use std::time::Duration;

use tracing::error;

use crate::aod::Parent;
use crate::clock::{Ticks, due_after};
use crate::context::with_server_tls;
use crate::router;
use crate::tuning::ASSUME_ALL_GROUPS_HANDLE_TIMERS;

pub(crate) type TaskBody = Box<dyn FnMut(&TaskRef) + Send + 'static>;

pub(crate) struct RawTask {
    /// Intrusive link used by the MPSC queues. Null except while enqueued.
    next: AtomicPtr<RawTask>,
    refs: AtomicUsize,
    due: AtomicU64,
    parent: Parent,
    /// Executed by at most one thread at a time; the queue and dispatcher
    /// contracts provide the exclusion, not a lock.
    body: UnsafeCell<Option<TaskBody>>,
}

impl RawTask {
    fn alloc(parent: Parent, body: Option<TaskBody>, due: Ticks) -> *mut RawTask {
        Box::into_raw(Box::new(RawTask {
            next: AtomicPtr::new(std::ptr::null_mut()),
            refs: AtomicUsize::new(1),
            due: AtomicU64::new(due),
            parent,
            body: UnsafeCell::new(body),
        }))
    }

    /// Bodyless node used as the queue stub. Never dispatched, never
    /// reference-counted; owned by its queue.
    pub(crate) fn stub() -> Box<RawTask> {
        Box::new(RawTask {
            next: AtomicPtr::new(std::ptr::null_mut()),
            refs: AtomicUsize::new(1),
            due: AtomicU64::new(0),
            parent: Parent::Free,
            body: UnsafeCell::new(None),
        })
    }
}

/// Owning handle to a task node. Cloning bumps the reference count; the
/// node is freed when the last handle (or queue slot) releases it.
pub struct TaskRef {
    raw: NonNull<RawTask>,
}

// The body is `Send`, parent handles are `Send + Sync`, and the count is
// atomic. Body execution is single-threaded by protocol.
unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

impl TaskRef {
    pub(crate) fn new(parent: Parent, body: TaskBody, due: Ticks) -> TaskRef {
        let raw = RawTask::alloc(parent, Some(body), due);
        TaskRef {
            // just allocated, non-null by construction
            raw: unsafe { NonNull::new_unchecked(raw) },
        }
    }

    fn raw(&self) -> &RawTask {
        unsafe { self.raw.as_ref() }
    }

    /// Transfer this reference into a raw pointer (no count change).
    pub(crate) fn into_raw(self) -> *mut RawTask {
        let ptr = self.raw.as_ptr();
        std::mem::forget(self);
        ptr
    }

    /// Reconstruct ownership from a pointer produced by [`into_raw`].
    pub(crate) unsafe fn from_raw(ptr: *mut RawTask) -> TaskRef {
        TaskRef {
            raw: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    pub fn due(&self) -> Ticks {
        self.raw().due.load(Relaxed)
    }

    pub fn is_due(&self, now: Ticks) -> bool {
        self.due() <= now
    }

    pub(crate) fn set_due(&self, due: Ticks) {
        self.raw().due.store(due, Relaxed);
    }

    pub(crate) fn parent(&self) -> &Parent {
        &self.raw().parent
    }

    /// Run the stored body. Caller must be the node's sole executor.
    pub(crate) fn dispatch(&self) {
        let body = unsafe { &mut *self.raw().body.get() };
        if let Some(f) = body.as_mut() {
            f(self);
        }
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        self.raw().refs.fetch_add(1, Relaxed);
        TaskRef { raw: self.raw }
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        if self.raw().refs.fetch_sub(1, Release) == 1 {
            fence(Acquire);
            drop(unsafe { Box::from_raw(self.raw.as_ptr()) });
        }
    }
}

impl std::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRef")
            .field("due", &self.due())
            .field("refs", &self.raw().refs.load(Relaxed))
            .finish()
    }
}

/// Handed to a free task's body while it runs.
pub struct TaskCtx<'a> {
    task: &'a TaskRef,
}

impl TaskCtx<'_> {
    /// Re-arm this task to fire on the next tick. Only meaningful from
    /// within a running timer task.
    pub fn defer_again(&self) {
        defer_task_again(self.task.clone());
    }

    /// Re-arm this task to fire `after` from now.
    pub fn defer_again_after(&self, after: Duration) {
        self.task.set_due(due_after(after));
        defer_task_again(self.task.clone());
    }
}

/// Create a free task with one strong reference. The body may run more than
/// once if the task re-arms itself.
pub fn make_task(mut f: impl FnMut(TaskCtx<'_>) + Send + 'static) -> TaskRef {
    TaskRef::new(
        Parent::Free,
        Box::new(move |task: &TaskRef| f(TaskCtx { task })),
        0,
    )
}

/// Schedule a free task. Lands in the calling worker's own timer heap when
/// its group handles timer tasks, otherwise it is routed to a worker of a
/// timer-capable group.
pub fn defer_task(task: TaskRef) {
    with_server_tls(|tls| {
        if !tls.bound {
            error!("defer_task called outside a worker thread, task dropped");
            return;
        }
        if !tls.flags.supports_delayed_tasks {
            error!("no timer-capable worker group configured, task dropped");
            return;
        }

        if ASSUME_ALL_GROUPS_HANDLE_TIMERS || tls.handles_timer_tasks() {
            tls.delayed.push(task);
        } else {
            router::route_free(tls, task);
        }
    });
}

/// Schedule a free task to fire `after` from now.
pub fn defer_task_after(after: Duration, task: TaskRef) {
    task.set_due(due_after(after));
    defer_task(task);
}

fn defer_task_again(task: TaskRef) {
    with_server_tls(|tls| {
        debug_assert!(tls.bound && tls.handles_timer_tasks());
        tls.pending.push_back(task);
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;

    use super::*;

    #[test]
    fn dispatch_runs_body() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = make_task(move |_| {
            h.fetch_add(1, SeqCst);
        });

        task.dispatch();
        task.dispatch();
        assert_eq!(hits.load(SeqCst), 2);
    }

    #[test]
    fn clone_extends_lifetime() {
        struct DropProbe(Arc<AtomicUsize>);
        impl Drop for DropProbe {
            fn drop(&mut self) {
                self.0.fetch_add(1, SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let probe = DropProbe(drops.clone());
        let task = make_task(move |_| {
            let _keep = &probe;
        });

        let extra = task.clone();
        drop(task);
        assert_eq!(drops.load(SeqCst), 0);

        drop(extra);
        assert_eq!(drops.load(SeqCst), 1);
    }

    #[test]
    fn raw_round_trip_preserves_count() {
        let task = make_task(|_| {});
        let ptr = task.into_raw();
        let task = unsafe { TaskRef::from_raw(ptr) };
        assert_eq!(task.raw().refs.load(Relaxed), 1);
    }

    #[test]
    fn due_times() {
        let task = make_task(|_| {});
        assert!(task.is_due(0));

        task.set_due(100);
        assert!(!task.is_due(99));
        assert!(task.is_due(100));
        assert!(task.is_due(101));
    }
}
