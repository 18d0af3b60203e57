//! A fixed pool of workers sharing one tag.
//!
//! The group owns its workers, the completion port when async IO is on,
//! the TCP acceptors, and an optional group-local TLS-sync system. Start
//! and stop cascade through atomic counters: the last worker to start
//! brings the acceptors up, the last to stop reports the group stopped.

use std::sync::Arc;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicBool, AtomicU32};

use tracing::{debug, error, info, warn};

use crate::config::{WorkerGroupConfig, WorkerGroupTag, WorkerHook};
use crate::error::RuntimeError;
use crate::io::acceptor::TcpAcceptor;
use crate::io::port::CompletionPort;
use crate::server::ServerInstance;
use crate::task::TaskRef;
use crate::tls_sync::TlsSyncSystem;
use crate::worker::Worker;

pub struct WorkerGroup {
    tag: WorkerGroupTag,
    workers: Vec<Arc<Worker>>,
    port: Option<CompletionPort>,
    acceptors: Vec<Arc<TcpAcceptor>>,
    tls_sync: Option<Arc<TlsSyncSystem>>,
    running: AtomicBool,
    running_workers: AtomicU32,
    master: Option<Arc<Worker>>,
    general_rr: AtomicU32,
    on_worker_start: Option<WorkerHook>,
    on_worker_tick: Option<WorkerHook>,
    on_worker_stop: Option<WorkerHook>,
}

impl WorkerGroup {
    /// Construct workers, port, and acceptors from a validated config.
    /// When `include_master` is set the last worker is reserved for the
    /// thread that starts the server.
    pub(crate) fn build(
        config: WorkerGroupConfig,
        include_master: bool,
    ) -> Result<Arc<WorkerGroup>, RuntimeError> {
        config.validate()?;
        let tag = config.tag;

        let port = if tag.enable_async_io {
            Some(CompletionPort::start(tag.workers_count as u32)?)
        } else {
            None
        };

        let tls_sync = tag
            .has_group_specific_tls_sync
            .then(|| Arc::new(TlsSyncSystem::new()));

        let workers: Vec<Arc<Worker>> = (0..tag.workers_count)
            .map(|i| {
                let is_master = include_master && i == tag.workers_count - 1;
                Arc::new(Worker::new(is_master))
            })
            .collect();
        let master = include_master.then(|| workers.last().expect("workers_count > 0").clone());

        let acceptors = config
            .acceptors
            .into_iter()
            .map(|acceptor_config| {
                let port = port.clone().expect("validated: acceptors imply async IO");
                TcpAcceptor::new(acceptor_config, port)
            })
            .collect();

        Ok(Arc::new(WorkerGroup {
            tag,
            workers,
            port,
            acceptors,
            tls_sync,
            running: AtomicBool::new(false),
            running_workers: AtomicU32::new(0),
            master,
            general_rr: AtomicU32::new(0),
            on_worker_start: config.on_worker_start,
            on_worker_tick: config.on_worker_tick,
            on_worker_stop: config.on_worker_stop,
        }))
    }

    pub fn tag(&self) -> &WorkerGroupTag {
        &self.tag
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Worker by 1-based id within this group.
    pub fn worker(&self, id: u16) -> Option<&Arc<Worker>> {
        id.checked_sub(1).and_then(|i| self.workers.get(i as usize))
    }

    pub fn port(&self) -> Option<&CompletionPort> {
        self.port.as_ref()
    }

    pub fn acceptors(&self) -> &[Arc<TcpAcceptor>] {
        &self.acceptors
    }

    pub fn acceptor_by_id(&self, id: u32) -> Option<&Arc<TcpAcceptor>> {
        self.acceptors.iter().find(|a| a.config().id == id)
    }

    pub(crate) fn tls_sync(&self) -> Option<&TlsSyncSystem> {
        self.tls_sync.as_deref()
    }

    pub(crate) fn master(&self) -> Option<&Arc<Worker>> {
        self.master.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Acquire)
    }

    pub fn running_workers(&self) -> u32 {
        self.running_workers.load(Acquire)
    }

    pub(crate) fn on_worker_tick(&self) -> Option<&WorkerHook> {
        self.on_worker_tick.as_ref()
    }

    /// Hand a task to one of this group's workers. Task-queue groups use
    /// the general inbox; async-IO groups go through the port's user lane.
    pub fn post_task(&self, task: TaskRef) {
        if self.tag.enable_task_queue {
            let index = self.general_rr.fetch_add(1, Relaxed) as usize % self.workers.len();
            self.workers[index].defer_general(task);
        } else if let Some(port) = &self.port {
            port.post(task);
        } else {
            warn!(group = %self.tag.name, "group accepts no tasks, task dropped");
        }
    }

    /// Spawn every non-master worker. Already-started groups are left
    /// alone.
    pub(crate) fn start(
        self: &Arc<WorkerGroup>,
        server: &Arc<ServerInstance>,
    ) -> Result<(), RuntimeError> {
        if self.running.swap(true, AcqRel) {
            info!(group = %self.tag.name, "group already started");
            return Ok(());
        }

        for worker in &self.workers {
            if worker.is_master() {
                continue;
            }
            worker.start(self, server)?;
        }

        Ok(())
    }

    /// Flip the running flag, stop acceptors, and shut the port down,
    /// cancelling in-flight IO. Idempotent.
    pub fn signal_to_stop(&self) {
        if !self.running.swap(false, AcqRel) {
            debug!(group = %self.tag.name, "group already signaled to stop");
            return;
        }

        for acceptor in &self.acceptors {
            acceptor.stop_accepting_async();
        }

        if let Some(port) = &self.port {
            port.stop();
        }
    }

    pub(crate) fn join(&self) {
        for worker in &self.workers {
            if worker.is_master() {
                continue;
            }
            worker.join();
        }
    }

    pub fn stop(&self) {
        self.signal_to_stop();
        self.join();
    }

    /// Worker-start cascade. Returns false when the worker must not enter
    /// its loop.
    pub(crate) fn on_worker_started(
        self: &Arc<WorkerGroup>,
        worker: &Arc<Worker>,
        server: &Arc<ServerInstance>,
    ) -> bool {
        let started = self.running_workers.fetch_add(1, AcqRel) + 1;

        if !server.handle_worker_started(worker, self) {
            return false;
        }

        if let Some(hook) = &self.on_worker_start {
            hook(worker, self);
        }

        if started == self.workers.len() as u32 {
            self.on_all_workers_started(server);
            return server.handle_group_started(self);
        }

        true
    }

    fn on_all_workers_started(self: &Arc<WorkerGroup>, server: &Arc<ServerInstance>) {
        for acceptor in &self.acceptors {
            if let Err(e) = acceptor.start_accepting_async() {
                error!(
                    group = %self.tag.name,
                    id = acceptor.config().id,
                    "failed to start acceptor: {e}"
                );
                server.signal_to_stop();
            }
        }

        debug!(group = %self.tag.name, "all workers started");
    }

    /// Worker-stop cascade. Returns true for the last worker out, which
    /// then reports the group stopped after the shutdown barrier.
    pub(crate) fn on_worker_stopped(
        self: &Arc<WorkerGroup>,
        worker: &Arc<Worker>,
        server: &Arc<ServerInstance>,
    ) -> bool {
        let remaining = self.running_workers.fetch_sub(1, AcqRel) - 1;

        server.handle_worker_stopped(worker, self);

        if let Some(hook) = &self.on_worker_stop {
            hook(worker, self);
        }

        remaining == 0
    }

    pub(crate) fn on_all_workers_stopped(self: &Arc<WorkerGroup>, server: &Arc<ServerInstance>) {
        debug!(group = %self.tag.name, "all workers stopped");
        server.handle_group_stopped(self);
    }
}
