//! One OS thread of a worker group.
//!
//! A worker owns the MPSC inboxes routed work arrives through, and runs the
//! tick loop shaped by its group's tag. The loop body interleaves async IO
//! draining, general tasks, timer firing, AOD firing, worker-service ticks,
//! TLS-sync, and the user tick, with each step compiled in or out by the
//! immutable tag copy loaded at loop entry.

use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::aod::tls::{bind_aod_tls, unbind_aod_tls, with_aod_tls};
use crate::aod::{self, AodLane};
use crate::clock::{precise_sleep, uptime_millis};
use crate::context::{bind_server_tls, unbind_server_tls, with_server_tls};
use crate::error::RuntimeError;
use crate::group::WorkerGroup;
use crate::io::port::{Completion, DequeueError};
use crate::metrics::{WorkerCounters, WorkerMetrics};
use crate::server::ServerInstance;
use crate::task::TaskRef;
use crate::task::queue::TaskQueue;
use crate::tuning::{
    DEQUEUE_COMPLETIONS_IN_BATCHES, MAX_COMPLETIONS_PER_TICK, MAX_GENERAL_TASKS_PER_TICK,
    THROTTLE_GENERAL_TASKS,
};

static WORKER_INDEX_POOL: AtomicU32 = AtomicU32::new(1);

pub struct Worker {
    index: u32,
    is_master: bool,
    running: AtomicBool,
    started_at: AtomicU64,
    counters: WorkerCounters,
    /// Inboxes for work routed here from other threads; this worker is the
    /// sole consumer of each.
    general_tasks: TaskQueue,
    delayed_tasks: TaskQueue,
    aod_delayed: [TaskQueue; 3],
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new(is_master: bool) -> Worker {
        Worker {
            index: WORKER_INDEX_POOL.fetch_add(1, Relaxed),
            is_master,
            running: AtomicBool::new(false),
            started_at: AtomicU64::new(0),
            counters: WorkerCounters::default(),
            general_tasks: TaskQueue::new(),
            delayed_tasks: TaskQueue::new(),
            aod_delayed: [TaskQueue::new(), TaskQueue::new(), TaskQueue::new()],
            join: Mutex::new(None),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Acquire)
    }

    /// Uptime tick at which this worker entered its loop.
    pub fn started_at(&self) -> u64 {
        self.started_at.load(Relaxed)
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.counters.snapshot()
    }

    /// Queue a general task into this worker's inbox.
    pub(crate) fn defer_general(&self, task: TaskRef) {
        self.general_tasks.push(task);
    }

    /// Queue a routed delayed free task.
    pub(crate) fn defer_delayed(&self, task: TaskRef) {
        self.delayed_tasks.push(task);
    }

    /// Queue a routed delayed object-bound task.
    pub(crate) fn defer_aod(&self, lane: AodLane, task: TaskRef) {
        self.aod_delayed[lane as usize].push(task);
    }

    pub(crate) fn start(
        self: &Arc<Worker>,
        group: &Arc<WorkerGroup>,
        server: &Arc<ServerInstance>,
    ) -> Result<(), RuntimeError> {
        let worker = self.clone();
        let group_arc = group.clone();
        let server_arc = server.clone();

        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", group.tag().name, self.index))
            .spawn(move || run_worker(&worker, &group_arc, &server_arc))
            .map_err(|e| RuntimeError::WorkerSpawn {
                group: group.tag().name.clone(),
                source: e,
            })?;

        *self.join.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    pub(crate) fn join(&self) {
        let handle = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(worker = self.index, "worker thread panicked");
            }
        }
    }

    /// Release every queued inbox task without dispatching it.
    pub(crate) fn clear(&self) {
        let queued = self.general_tasks.len()
            + self.delayed_tasks.len()
            + self.aod_delayed.iter().map(|q| q.len()).sum::<usize>();
        if queued > 0 {
            debug!(worker = self.index, queued, "releasing undispatched tasks");
        }

        while self.general_tasks.pop().is_some() {}
        while self.delayed_tasks.pop().is_some() {}
        for queue in &self.aod_delayed {
            while queue.pop().is_some() {}
        }
    }
}

/// Whole worker lifetime: TLS up, start hooks, startup barrier, the loop,
/// stop hooks, shutdown barrier, TLS down.
pub(crate) fn run_worker(
    worker: &Arc<Worker>,
    group: &Arc<WorkerGroup>,
    server: &Arc<ServerInstance>,
) {
    bind_server_tls(server, group.tag());
    bind_aod_tls(server, group.tag());

    worker.running.store(true, Release);

    let started_ok = group.on_worker_started(worker, server);

    // every worker of the server reaches this point before any loop begins
    server.startup_latch().arrive_and_wait();

    if started_ok {
        worker.started_at.store(uptime_millis(), Relaxed);

        if group.tag().is_active {
            run_active(worker, group, server);
        } else {
            run_reactive(worker, group, server);
        }
    } else {
        warn!(group = %group.tag().name, "worker start failed, stopping server");
        server.signal_to_stop();
    }

    worker.running.store(false, Release);

    let last_in_group = group.on_worker_stopped(worker, server);

    // all workers reach here before any TLS teardown begins
    server.shutdown_latch().arrive_and_wait();

    if last_in_group {
        group.on_all_workers_stopped(server);
    }

    debug!(
        worker = worker.index,
        group = %group.tag().name,
        metrics = ?worker.metrics(),
        "worker exiting"
    );

    worker.clear();
    unbind_aod_tls();
    unbind_server_tls();
}

fn run_active(worker: &Arc<Worker>, group: &Arc<WorkerGroup>, server: &Arc<ServerInstance>) {
    let tag = group.tag().clone();
    let tick_rate = tag.effective_tick_rate().max(1);
    let tick = Duration::from_millis((1000 / tick_rate as u64).max(1));

    let flags = server.flags();
    let server_sync = server.tls_sync();
    let group_sync = group.tls_sync();
    let worker_services = server.worker_services();
    let on_tick = group.on_worker_tick();

    let mut server_sync_seen = 0u64;
    let mut group_sync_seen = 0u64;

    if tag.supports_tls_sync {
        if let Some(sync) = server_sync {
            sync.tls_initialize(&mut server_sync_seen, worker, group);
        }
    }
    if tag.has_group_specific_tls_sync {
        if let Some(sync) = group_sync {
            sync.tls_initialize(&mut group_sync_seen, worker, group);
        }
    }

    let mut completions = Vec::with_capacity(MAX_COMPLETIONS_PER_TICK);

    // spread the tick phases of sleeping workers so a group does not hit
    // its shared queues in lockstep
    if !tag.enable_async_io && tag.workers_count > 1 {
        let tick_ms = (tick.as_millis() as u64).max(1);
        precise_sleep(Duration::from_millis(fastrand::u64(0..tick_ms)));
    }

    while group.is_running() {
        worker.counters.add_ticks(1);

        if tag.enable_async_io && drain_async(worker, group, &mut completions, Some(tick)) {
            break;
        }

        if tag.enable_task_queue {
            run_general_tasks(worker);
        }

        if tag.handles_timer_tasks {
            if flags.all_groups_handle_timers {
                run_timer_local(worker);
            } else {
                run_timer_global(worker);
            }
        }

        if tag.supports_aod {
            if flags.all_groups_support_aod {
                run_aod_local(worker);
            } else {
                run_aod_global(worker);
            }
        }

        if tag.tick_worker_services {
            for service in worker_services {
                service.on_tick_worker(worker, group);
            }
        }

        if tag.supports_tls_sync {
            if let Some(sync) = server_sync {
                sync.tls_tick(&mut server_sync_seen, worker, group);
            }
        }
        if tag.has_group_specific_tls_sync {
            if let Some(sync) = group_sync {
                sync.tls_tick(&mut group_sync_seen, worker, group);
            }
        }

        if tag.call_tick_handler {
            if let Some(handler) = on_tick {
                handler(worker, group);
            }
        }

        if !tag.enable_async_io {
            precise_sleep(tick);
        }
    }
}

fn run_reactive(worker: &Arc<Worker>, group: &Arc<WorkerGroup>, server: &Arc<ServerInstance>) {
    let tag = group.tag().clone();
    let wants_sync = tag.supports_tls_sync || tag.has_group_specific_tls_sync;
    let sync_tick = Duration::from_millis((1000 / tag.sync_tls_tick_rate.max(1) as u64).max(1));

    let server_sync = server.tls_sync();
    let group_sync = group.tls_sync();
    let mut server_sync_seen = 0u64;
    let mut group_sync_seen = 0u64;

    if tag.supports_tls_sync {
        if let Some(sync) = server_sync {
            sync.tls_initialize(&mut server_sync_seen, worker, group);
        }
    }
    if tag.has_group_specific_tls_sync {
        if let Some(sync) = group_sync {
            sync.tls_initialize(&mut group_sync_seen, worker, group);
        }
    }

    let mut completions = Vec::with_capacity(MAX_COMPLETIONS_PER_TICK);
    // without a TLS-sync cadence the kernel wait is unbounded
    let timeout = wants_sync.then_some(sync_tick);

    while group.is_running() {
        worker.counters.add_ticks(1);

        if drain_async(worker, group, &mut completions, timeout) {
            break;
        }

        if tag.supports_tls_sync {
            if let Some(sync) = server_sync {
                sync.tls_tick(&mut server_sync_seen, worker, group);
            }
        }
        if tag.has_group_specific_tls_sync {
            if let Some(sync) = group_sync {
                sync.tls_tick(&mut group_sync_seen, worker, group);
            }
        }
    }
}

/// Dispatch one finished unit of port work on this worker.
pub(crate) fn dispatch_completion(completion: Completion) {
    match completion {
        Completion::Io { handler, result } => handler(result),
        Completion::Accept {
            acceptor,
            accepted,
            status,
        } => acceptor.complete_accept(accepted, status),
        Completion::Task(task) => task.dispatch(),
        Completion::Shutdown => debug_assert!(false, "shutdown sentinel escaped dequeue"),
    }
}

/// Step A: drain the group's port. Returns true when the worker must leave
/// its loop (port shut down or kernel failure).
fn drain_async(
    worker: &Arc<Worker>,
    group: &Arc<WorkerGroup>,
    completions: &mut Vec<Completion>,
    timeout: Option<Duration>,
) -> bool {
    let Some(port) = group.port() else {
        return false;
    };

    let result = if DEQUEUE_COMPLETIONS_IN_BATCHES {
        completions.clear();
        port.dequeue_batch(completions, MAX_COMPLETIONS_PER_TICK, timeout)
    } else {
        completions.clear();
        match port.dequeue(timeout) {
            Ok(completion) => {
                completions.push(completion);
                Ok(())
            }
            Err(e) => Err(e),
        }
    };

    match result {
        Ok(()) => {
            let count = completions.len() as u64;
            for completion in completions.drain(..) {
                dispatch_completion(completion);
            }
            worker.counters.add_completions(count);
            false
        }
        Err(DequeueError::Timeout) => false,
        Err(DequeueError::Shutdown) => true,
        Err(DequeueError::SystemFailure(e)) => {
            warn!(group = %group.tag().name, "async IO system failure: {e}");
            group.signal_to_stop();
            true
        }
    }
}

/// Step B: run general inbox tasks, throttled per tick.
fn run_general_tasks(worker: &Arc<Worker>) {
    let limit = if THROTTLE_GENERAL_TASKS {
        MAX_GENERAL_TASKS_PER_TICK
    } else {
        usize::MAX
    };

    let mut count = 0u64;
    while let Some(task) = worker.general_tasks.pop() {
        task.dispatch();
        drop(task);
        count += 1;
        if count as usize >= limit {
            break;
        }
    }
    worker.counters.add_general_tasks(count);
}

/// Step C, local half: fold the pending buffer into the heap, then fire
/// everything due. `now` is fixed at entry, so a task that re-arms itself
/// during this pass cannot fire again within it.
fn run_timer_local(worker: &Arc<Worker>) {
    let now = uptime_millis();

    with_server_tls(|tls| {
        while let Some(task) = tls.pending.pop_front() {
            tls.delayed.push(task);
        }
    });

    let mut fired = 0u64;
    loop {
        let due = with_server_tls(|tls| tls.delayed.pop_due(now));
        match due {
            Some(task) => {
                task.dispatch();
                drop(task);
                fired += 1;
            }
            None => break,
        }
    }
    worker.counters.add_timer_fired(fired);
}

/// Step C, routed half: drain the delayed inbox, firing what is due and
/// heaping the rest, then run the local pass.
fn run_timer_global(worker: &Arc<Worker>) {
    let now = uptime_millis();

    let mut fired = 0u64;
    while let Some(task) = worker.delayed_tasks.pop() {
        if task.is_due(now) {
            task.dispatch();
            drop(task);
            fired += 1;
        } else {
            with_server_tls(|tls| tls.delayed.push(task));
        }
    }
    worker.counters.add_timer_fired(fired);

    run_timer_local(worker);
}

/// Step D, local half: fire due object-bound tasks from the lane heaps.
fn run_aod_local(worker: &Arc<Worker>) {
    let mut fired = 0u64;

    for lane in [AodLane::Shared, AodLane::Custom, AodLane::Static] {
        let now = uptime_millis();
        loop {
            let due = with_aod_tls(|tls| tls.lane_mut(lane).delayed.pop_due(now));
            match due {
                Some(task) => {
                    let parent = task.parent().clone();
                    aod::dispatch(parent, task);
                    fired += 1;
                }
                None => break,
            }
        }
    }

    worker.counters.add_aod_fired(fired);
}

/// Step D, routed half: drain the three AOD inboxes, then the local pass.
fn run_aod_global(worker: &Arc<Worker>) {
    let mut fired = 0u64;

    for lane in [AodLane::Custom, AodLane::Shared, AodLane::Static] {
        let now = uptime_millis();
        while let Some(task) = worker.aod_delayed[lane as usize].pop() {
            if task.is_due(now) {
                let parent = task.parent().clone();
                aod::dispatch(parent, task);
                fired += 1;
            } else {
                with_aod_tls(|tls| tls.lane_mut(lane).delayed.push(task));
            }
        }
    }
    worker.counters.add_aod_fired(fired);

    run_aod_local(worker);
}
