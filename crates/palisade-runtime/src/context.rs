//! Server-instance thread-local context.
//!
//! Each worker thread binds one of these at startup: a copy of the derived
//! server flags, the cached list of timer-capable groups, its own delayed
//! task heap, the pending buffer fed by `defer_again`, and the round-robin
//! cursors used by the cross-group router. Non-worker threads see an
//! unbound default, which supports immediate AOD dispatch but not task
//! scheduling.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::{ServerFlags, WorkerGroupTag};
use crate::group::WorkerGroup;
use crate::server::ServerInstance;
use crate::task::TaskRef;
use crate::timer::TimerHeap;

pub(crate) struct ServerTls {
    pub bound: bool,
    pub flags: ServerFlags,
    pub tag: WorkerGroupTag,
    /// Delayed free tasks owned by this thread.
    pub delayed: TimerHeap,
    /// Tasks re-armed from inside a running timer handler; folded into the
    /// heap at the start of the next timer pass.
    pub pending: VecDeque<TaskRef>,
    /// Groups able to host timer tasks, cached for the router.
    pub timer_groups: Vec<Arc<WorkerGroup>>,
    pub rr_group: u32,
    pub rr_worker: u32,
}

impl ServerTls {
    fn unbound() -> ServerTls {
        ServerTls {
            bound: false,
            flags: ServerFlags::default(),
            tag: WorkerGroupTag::default(),
            delayed: TimerHeap::new(),
            pending: VecDeque::new(),
            timer_groups: Vec::new(),
            rr_group: 0,
            rr_worker: 0,
        }
    }

    pub fn handles_timer_tasks(&self) -> bool {
        self.tag.handles_timer_tasks
    }
}

thread_local! {
    static SERVER_TLS: RefCell<ServerTls> = RefCell::new(ServerTls::unbound());
}

/// Run `f` with the current thread's context. Callers must not re-enter
/// from inside `f`; task bodies therefore never run under this borrow.
pub(crate) fn with_server_tls<R>(f: impl FnOnce(&mut ServerTls) -> R) -> R {
    SERVER_TLS.with(|tls| f(&mut tls.borrow_mut()))
}

pub(crate) fn bind_server_tls(server: &Arc<ServerInstance>, tag: &WorkerGroupTag) {
    with_server_tls(|tls| {
        tls.bound = true;
        tls.flags = server.flags();
        tls.tag = tag.clone();
        tls.timer_groups = server.timer_groups().to_vec();
        tls.rr_group = 0;
        tls.rr_worker = 0;

        if tag.preallocate_thread_local_state {
            tls.delayed.reserve(256);
            tls.pending.reserve(64);
        }
    });
}

/// Tear down the thread's context, releasing every queued task without
/// dispatching it.
pub(crate) fn unbind_server_tls() {
    with_server_tls(|tls| {
        tls.delayed.clear();
        tls.pending.clear();
        tls.timer_groups.clear();
        tls.bound = false;
    });
}
