//! AOD thread-local context: per-lane re-entrancy bookkeeping, delayed
//! heaps, and the router caches for AOD tasks.
//!
//! Worker threads bind the context at startup. Any other thread gets a lazy
//! unbound default, which is enough for immediate dispatch (the protocol is
//! thread-agnostic) but not for delayed posts.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::WorkerGroupTag;
use crate::group::WorkerGroup;
use crate::server::ServerInstance;
use crate::timer::TimerHeap;

use super::{AOD_LANES, AodLane, Parent};

pub(crate) struct LaneState {
    /// A flush for this lane is running on this thread; nested dispatches
    /// park their object in `pending` instead of flushing inline.
    pub in_progress: bool,
    pub pending: VecDeque<Parent>,
    pub delayed: TimerHeap,
}

impl LaneState {
    fn new() -> LaneState {
        LaneState {
            in_progress: false,
            pending: VecDeque::new(),
            delayed: TimerHeap::new(),
        }
    }
}

pub(crate) struct AodTls {
    pub bound: bool,
    /// Set when this worker's group cannot host AOD timers itself, so
    /// delayed posts must be routed to a capable group.
    pub schedule_remote: bool,
    lanes: [LaneState; 3],
    /// Groups able to run AOD work, cached for the router.
    pub aod_groups: Vec<Arc<WorkerGroup>>,
    pub rr_group: u32,
    pub rr_worker: u32,
}

impl AodTls {
    fn unbound() -> AodTls {
        AodTls {
            bound: false,
            schedule_remote: false,
            lanes: [LaneState::new(), LaneState::new(), LaneState::new()],
            aod_groups: Vec::new(),
            rr_group: 0,
            rr_worker: 0,
        }
    }

    pub fn lane_mut(&mut self, lane: AodLane) -> &mut LaneState {
        &mut self.lanes[lane as usize]
    }
}

thread_local! {
    static AOD_TLS: RefCell<AodTls> = RefCell::new(AodTls::unbound());
}

/// Run `f` with this thread's AOD context. Task bodies never run under
/// this borrow; the dispatch protocol takes care to drop it first.
pub(crate) fn with_aod_tls<R>(f: impl FnOnce(&mut AodTls) -> R) -> R {
    AOD_TLS.with(|tls| f(&mut tls.borrow_mut()))
}

pub(crate) fn bind_aod_tls(server: &Arc<ServerInstance>, tag: &WorkerGroupTag) {
    with_aod_tls(|tls| {
        tls.bound = true;
        tls.schedule_remote = !(tag.supports_aod && tag.is_active);
        tls.aod_groups = server.aod_groups().to_vec();
        tls.rr_group = 0;
        tls.rr_worker = 0;

        if tag.preallocate_thread_local_state {
            for lane in AOD_LANES {
                tls.lane_mut(lane).delayed.reserve(256);
            }
        }
    });
}

/// Tear down the thread's AOD context, releasing queued delayed tasks
/// without dispatching them.
pub(crate) fn unbind_aod_tls() {
    with_aod_tls(|tls| {
        for lane in AOD_LANES {
            let lane = tls.lane_mut(lane);
            lane.delayed.clear();
            lane.pending.clear();
            lane.in_progress = false;
        }
        tls.aod_groups.clear();
        tls.bound = false;
    });
}
