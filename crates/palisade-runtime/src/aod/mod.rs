//! Object-bound dispatch.
//!
//! Any number of threads may post work against one logical object; at most
//! one thread at a time executes that object's tasks, and same-thread
//! publication order is preserved. The protocol is lock-free: a producer
//! increments the object's outstanding-task count *before* pushing, and the
//! producer that observes a zero count becomes the object's flushing
//! consumer. Everyone else just leaves.
//!
//! Because execution is exclusive, handlers receive `&mut` access to the
//! object's state without any locking.
//!
//! Three ownership variants exist. [`SharedObject`] is `Arc`-owned and its
//! queued tasks keep it alive. [`StaticObject`] lives in a `static`; tasks
//! borrow it for `'static`. [`CustomObject`] is embedded in a caller-owned
//! allocation and reached through a projecting [`CustomRef`].

pub(crate) mod tls;

use std::any::Any;
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::AcqRel;
use std::time::Duration;

use tracing::error;

use crate::clock::due_after;
use crate::router;
use crate::task::queue::TaskQueue;
use crate::task::{TaskBody, TaskRef};
use crate::tuning::ASSUME_ALL_GROUPS_HANDLE_AOD;

use self::tls::with_aod_tls;

/// The per-object protocol core: the task queue plus the outstanding-task
/// count that serializes consumer hand-off.
pub(crate) struct Dispatcher {
    queue: TaskQueue,
    remaining: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            queue: TaskQueue::new(),
            remaining: AtomicU64::new(0),
        }
    }

    /// Publish a task. Returns true when the caller became the object's
    /// consumer and must flush. The count increment must precede the push:
    /// a producer that sees a non-zero previous count is guaranteed its
    /// task is covered by the active consumer's flush.
    pub fn enqueue(&self, task: TaskRef) -> bool {
        let first = self.remaining.fetch_add(1, AcqRel) == 0;
        self.queue.push(task);
        first
    }

    /// Run queued tasks until the outstanding count reaches zero. Only the
    /// thread that won `enqueue` may call this.
    pub fn flush(&self) {
        loop {
            match self.queue.pop() {
                Some(task) => {
                    task.dispatch();
                    drop(task);
                    if self.remaining.fetch_sub(1, AcqRel) == 1 {
                        return;
                    }
                }
                // a producer has incremented the count but not yet linked
                // its node; the store is imminent
                None => std::hint::spin_loop(),
            }
        }
    }
}

pub(crate) trait AodTarget: Send + Sync + 'static {
    fn dispatcher(&self) -> &Dispatcher;
}

/// Dispatcher plus state, shared by the three object variants. Handlers
/// get `&mut T`; exclusivity comes from the dispatcher protocol.
pub(crate) struct AodCore<T> {
    dispatcher: Dispatcher,
    state: UnsafeCell<T>,
}

// At most one thread executes this object's tasks at a time, and only task
// bodies touch `state`.
unsafe impl<T: Send> Sync for AodCore<T> {}
unsafe impl<T: Send> Send for AodCore<T> {}

impl<T: Send + 'static> AodTarget for AodCore<T> {
    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl<T> AodCore<T> {
    fn new(state: T) -> AodCore<T> {
        AodCore {
            dispatcher: Dispatcher::new(),
            state: UnsafeCell::new(state),
        }
    }
}

/// Ownership lane an object-bound task belongs to. Each lane has its own
/// delayed-task heap and re-entrancy bookkeeping in the AOD TLS context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AodLane {
    Shared = 0,
    Static = 1,
    Custom = 2,
}

pub(crate) const AOD_LANES: [AodLane; 3] = [AodLane::Shared, AodLane::Static, AodLane::Custom];

/// Erased handle from a task back to its owning object.
#[derive(Clone)]
pub(crate) enum Parent {
    /// Not object-bound.
    Free,
    Shared(Arc<dyn AodTarget>),
    Static(&'static dyn AodTarget),
    Custom(CustomParent),
}

impl Parent {
    pub fn target(&self) -> Option<&dyn AodTarget> {
        match self {
            Parent::Free => None,
            Parent::Shared(t) => Some(t.as_ref()),
            Parent::Static(t) => Some(*t),
            Parent::Custom(c) => Some(c.target()),
        }
    }

    pub fn lane(&self) -> Option<AodLane> {
        match self {
            Parent::Free => None,
            Parent::Shared(_) => Some(AodLane::Shared),
            Parent::Static(_) => Some(AodLane::Static),
            Parent::Custom(_) => Some(AodLane::Custom),
        }
    }
}

/// Type-erased projection into a caller-owned allocation. The owner `Arc`
/// keeps the allocation alive; `target` points at the dispatcher embedded
/// in it.
pub(crate) struct CustomParent {
    _owner: Arc<dyn Any + Send + Sync>,
    target: NonNull<dyn AodTarget>,
}

// `target` stays valid while `_owner` is held, and `dyn AodTarget` is
// `Send + Sync`.
unsafe impl Send for CustomParent {}
unsafe impl Sync for CustomParent {}

impl Clone for CustomParent {
    fn clone(&self) -> Self {
        CustomParent {
            _owner: self._owner.clone(),
            target: self.target,
        }
    }
}

impl CustomParent {
    fn target(&self) -> &dyn AodTarget {
        unsafe { self.target.as_ref() }
    }
}

/// Publish `task` against its parent object. Returns true when the calling
/// thread became the object's flushing consumer.
pub(crate) fn dispatch(parent: Parent, task: TaskRef) -> bool {
    let lane = parent.lane().expect("free task dispatched through AOD");
    let target = parent.target().expect("free task dispatched through AOD");

    if !target.dispatcher().enqueue(task) {
        // a consumer is already flushing this object
        return false;
    }

    // This thread now owns the object's queue. `parent` doubles as the
    // extra owner reference held until the flush is done. A dispatch from
    // inside another flush on this thread parks the object instead of
    // flushing, which keeps task bodies off the stack of other bodies.
    let parked = with_aod_tls(|tls| {
        let lane = tls.lane_mut(lane);
        if lane.in_progress {
            lane.pending.push_back(parent.clone());
            true
        } else {
            lane.in_progress = true;
            false
        }
    });
    if parked {
        return true;
    }

    target.dispatcher().flush();

    // objects parked by nested dispatches during the flush above
    loop {
        let next = with_aod_tls(|tls| tls.lane_mut(lane).pending.pop_front());
        match next {
            Some(parked) => {
                parked
                    .target()
                    .expect("parked parent is object-bound")
                    .dispatcher()
                    .flush();
            }
            None => break,
        }
    }

    with_aod_tls(|tls| tls.lane_mut(lane).in_progress = false);
    true
}

/// Queue a delayed object-bound task: the calling worker's own lane heap
/// when its group hosts AOD timers, otherwise routed to a capable group.
pub(crate) fn delay(task: TaskRef) {
    let lane = task.parent().lane().expect("free task delayed through AOD");

    with_aod_tls(|tls| {
        if ASSUME_ALL_GROUPS_HANDLE_AOD || !tls.schedule_remote {
            if !tls.bound {
                error!("AOD delay called outside a worker thread, task dropped");
                return;
            }
            tls.lane_mut(lane).delayed.push(task);
        } else {
            router::route_aod(tls, lane, task);
        }
    });
}

fn one_shot_body<T: Send + 'static>(
    core: impl Fn() -> *mut T + Send + 'static,
    f: impl FnOnce(&mut T) + Send + 'static,
) -> TaskBody {
    let mut f = Some(f);
    Box::new(move |_task: &TaskRef| {
        if let Some(f) = f.take() {
            // exclusive by the dispatcher's single-consumer guarantee
            f(unsafe { &mut *core() });
        }
    })
}

/// `Arc`-owned dispatch object. Clones are cheap handles to the same
/// object; queued tasks extend its lifetime.
pub struct SharedObject<T: Send + 'static> {
    core: Arc<AodCore<T>>,
}

impl<T: Send + 'static> Clone for SharedObject<T> {
    fn clone(&self) -> Self {
        SharedObject {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> SharedObject<T> {
    pub fn new(state: T) -> SharedObject<T> {
        SharedObject {
            core: Arc::new(AodCore::new(state)),
        }
    }

    /// Run `f` against the object's state, serialized with every other
    /// post. Returns true when the calling thread did the flushing.
    pub fn post(&self, f: impl FnOnce(&mut T) + Send + 'static) -> bool {
        dispatch(Parent::Shared(self.core.clone()), self.task(f, 0))
    }

    /// Run `f` no earlier than `after` from now.
    pub fn post_delayed(&self, after: Duration, f: impl FnOnce(&mut T) + Send + 'static) {
        delay(self.task(f, due_after(after)));
    }

    fn task(&self, f: impl FnOnce(&mut T) + Send + 'static, due: u64) -> TaskRef {
        let core = self.core.clone();
        TaskRef::new(
            Parent::Shared(self.core.clone()),
            one_shot_body(move || core.state.get(), f),
            due,
        )
    }
}

/// Dispatch object intended for `static` storage. Posts borrow the object
/// for `'static`; the caller guarantees it outlives all tasks.
pub struct StaticObject<T: Send + 'static> {
    core: AodCore<T>,
}

impl<T: Send + 'static> StaticObject<T> {
    pub fn new(state: T) -> StaticObject<T> {
        StaticObject {
            core: AodCore::new(state),
        }
    }

    pub fn post(&'static self, f: impl FnOnce(&mut T) + Send + 'static) -> bool {
        dispatch(Parent::Static(&self.core), self.task(f, 0))
    }

    pub fn post_delayed(&'static self, after: Duration, f: impl FnOnce(&mut T) + Send + 'static) {
        delay(self.task(f, due_after(after)));
    }

    fn task(&'static self, f: impl FnOnce(&mut T) + Send + 'static, due: u64) -> TaskRef {
        let core: &'static AodCore<T> = &self.core;
        TaskRef::new(
            Parent::Static(core),
            one_shot_body(move || core.state.get(), f),
            due,
        )
    }
}

/// Dispatch object embedded in a larger caller-owned structure. Reached
/// through [`CustomRef`], which pairs the owner's `Arc` with a projection
/// to the embedded object.
pub struct CustomObject<T: Send + 'static> {
    core: AodCore<T>,
}

impl<T: Send + 'static> CustomObject<T> {
    pub fn new(state: T) -> CustomObject<T> {
        CustomObject {
            core: AodCore::new(state),
        }
    }
}

/// Shared handle to a [`CustomObject`] inside an owner allocation.
pub struct CustomRef<T: Send + 'static> {
    owner: Arc<dyn Any + Send + Sync>,
    object: NonNull<AodCore<T>>,
}

// the pointee lives inside `owner`'s allocation
unsafe impl<T: Send + 'static> Send for CustomRef<T> {}
unsafe impl<T: Send + 'static> Sync for CustomRef<T> {}

impl<T: Send + 'static> Clone for CustomRef<T> {
    fn clone(&self) -> Self {
        CustomRef {
            owner: self.owner.clone(),
            object: self.object,
        }
    }
}

impl<T: Send + 'static> CustomRef<T> {
    /// Build a handle from the owning `Arc` and a projection to the
    /// embedded object. The projection must return a reference into
    /// address-stable storage owned by `owner` (a plain field qualifies).
    pub fn new<O: Send + Sync + 'static>(
        owner: Arc<O>,
        project: impl for<'a> FnOnce(&'a O) -> &'a CustomObject<T>,
    ) -> CustomRef<T> {
        let object = NonNull::from(&project(&owner).core);
        CustomRef { owner, object }
    }

    pub fn post(&self, f: impl FnOnce(&mut T) + Send + 'static) -> bool {
        dispatch(Parent::Custom(self.erased()), self.task(f, 0))
    }

    pub fn post_delayed(&self, after: Duration, f: impl FnOnce(&mut T) + Send + 'static) {
        delay(self.task(f, due_after(after)));
    }

    fn erased(&self) -> CustomParent {
        let target: &dyn AodTarget = unsafe { self.object.as_ref() };
        CustomParent {
            _owner: self.owner.clone(),
            target: NonNull::from(target),
        }
    }

    fn task(&self, f: impl FnOnce(&mut T) + Send + 'static, due: u64) -> TaskRef {
        let this = self.clone();
        TaskRef::new(
            Parent::Custom(self.erased()),
            one_shot_body(
                move || {
                    let this = &this;
                    unsafe { this.object.as_ref() }.state.get()
                },
                f,
            ),
            due,
        )
    }
}
