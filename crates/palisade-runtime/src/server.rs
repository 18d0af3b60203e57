//! The server instance: the composition root of the runtime.
//!
//! Built from a validated [`ServerConfig`], it owns the worker groups, the
//! service registries, the derived flag aggregates, and the two barriers
//! that align worker startup and shutdown. Optionally the calling thread is
//! captured as the master worker, in which case `start` only returns once
//! the whole server has wound down.

use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, ServerFlags};
use crate::error::RuntimeError;
use crate::group::WorkerGroup;
use crate::service::{
    ActiveService, AodService, Service, SimpleService, StopSignalResult, WorkerService,
};
use crate::task::make_task;
use crate::tls_sync::TlsSyncSystem;
use crate::worker::{Worker, run_worker};

/// How `start` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// No master worker; the server keeps running on its own threads.
    Detached,
    /// The captured calling thread ran the master worker and the server
    /// has fully stopped.
    Finalized,
}

/// Count-down barrier that can be forced open when startup aborts.
pub(crate) struct Latch {
    state: Mutex<LatchState>,
    cv: Condvar,
}

struct LatchState {
    remaining: usize,
    open: bool,
}

impl Latch {
    fn new(count: usize) -> Latch {
        Latch {
            state: Mutex::new(LatchState {
                remaining: count,
                open: count == 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn arrive_and_wait(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.open {
            return;
        }

        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            state.open = true;
            self.cv.notify_all();
            return;
        }

        while !state.open {
            state = self
                .cv
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn force_open(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.open = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct ServiceRegistry {
    simple: Vec<Arc<dyn SimpleService>>,
    aod: Vec<Arc<dyn AodService>>,
    active: Vec<Arc<dyn ActiveService>>,
    worker: Vec<Arc<dyn WorkerService>>,
    /// Every registered service, upcast, in registration order, with its
    /// per-kind 1-based uid.
    all: Vec<(u32, Arc<dyn Service>)>,
}

struct FrozenServices {
    all: Vec<(u32, Arc<dyn Service>)>,
    active: Vec<Arc<dyn ActiveService>>,
    worker: Vec<Arc<dyn WorkerService>>,
}

pub struct ServerInstance {
    name: String,
    flags: ServerFlags,
    groups: Vec<Arc<WorkerGroup>>,
    /// Groups able to host timer tasks; router target set.
    timer_groups: Vec<Arc<WorkerGroup>>,
    /// Groups able to run AOD delayed work; router target set.
    aod_groups: Vec<Arc<WorkerGroup>>,
    tls_sync: Option<Arc<TlsSyncSystem>>,
    master: Option<(Arc<Worker>, Arc<WorkerGroup>)>,
    startup_latch: Latch,
    shutdown_latch: Latch,
    running: AtomicBool,
    running_groups: AtomicU32,
    running_workers: AtomicU32,
    registry: Mutex<ServiceRegistry>,
    frozen: OnceLock<FrozenServices>,
    services_remaining: AtomicU32,
}

impl ServerInstance {
    /// Validate the configuration and build every group. No threads are
    /// created until `start`.
    pub fn initialize(config: ServerConfig) -> Result<Arc<ServerInstance>, RuntimeError> {
        config.validate()?;

        let flags = ServerFlags::derive(&config.groups);
        if !flags.supports_delayed_tasks {
            warn!(
                server = %config.name,
                "no worker group handles timer tasks; deferred tasks will be dropped"
            );
        }

        let group_count = config.groups.len();
        let needs_tls_sync = config.groups.iter().any(|g| g.tag.supports_tls_sync);

        let mut groups = Vec::with_capacity(group_count);
        for (i, group_config) in config.groups.into_iter().enumerate() {
            let include_master = config.capture_calling_thread && i == group_count - 1;
            groups.push(WorkerGroup::build(group_config, include_master)?);
        }

        let master = groups
            .last()
            .and_then(|g| g.master().cloned().map(|m| (m, g.clone())));

        let timer_groups: Vec<_> = groups
            .iter()
            .filter(|g| g.tag().handles_timer_tasks)
            .cloned()
            .collect();
        let aod_groups: Vec<_> = groups
            .iter()
            .filter(|g| g.tag().supports_aod && g.tag().is_active)
            .cloned()
            .collect();

        let total_workers: usize = groups.iter().map(|g| g.workers().len()).sum();

        info!(
            server = %config.name,
            groups = group_count,
            workers = total_workers,
            "server instance initialized"
        );

        Ok(Arc::new(ServerInstance {
            name: config.name,
            flags,
            groups,
            timer_groups,
            aod_groups,
            tls_sync: needs_tls_sync.then(|| Arc::new(TlsSyncSystem::new())),
            master,
            startup_latch: Latch::new(total_workers),
            shutdown_latch: Latch::new(total_workers),
            running: AtomicBool::new(false),
            running_groups: AtomicU32::new(0),
            running_workers: AtomicU32::new(0),
            registry: Mutex::new(ServiceRegistry::default()),
            frozen: OnceLock::new(),
            services_remaining: AtomicU32::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> ServerFlags {
        self.flags
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Acquire)
    }

    pub fn groups(&self) -> &[Arc<WorkerGroup>] {
        &self.groups
    }

    pub fn group_by_id(&self, id: u16) -> Option<&Arc<WorkerGroup>> {
        self.groups.iter().find(|g| g.tag().id == id)
    }

    pub(crate) fn timer_groups(&self) -> &[Arc<WorkerGroup>] {
        &self.timer_groups
    }

    pub(crate) fn aod_groups(&self) -> &[Arc<WorkerGroup>] {
        &self.aod_groups
    }

    /// The server-wide TLS-sync system, present when any group opted in.
    pub fn tls_sync(&self) -> Option<&TlsSyncSystem> {
        self.tls_sync.as_deref()
    }

    pub(crate) fn startup_latch(&self) -> &Latch {
        &self.startup_latch
    }

    pub(crate) fn shutdown_latch(&self) -> &Latch {
        &self.shutdown_latch
    }

    pub(crate) fn worker_services(&self) -> &[Arc<dyn WorkerService>] {
        self.frozen.get().map_or(&[], |f| f.worker.as_slice())
    }

    fn registry_open(&self) -> Result<std::sync::MutexGuard<'_, ServiceRegistry>, RuntimeError> {
        if self.is_running() || self.frozen.get().is_some() {
            return Err(RuntimeError::RegistryFrozen);
        }
        Ok(self.registry.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Register a service; uids are 1-based per kind in registration
    /// order. Registration closes when the server starts.
    pub fn add_simple_service(&self, service: Arc<dyn SimpleService>) -> Result<u32, RuntimeError> {
        let mut registry = self.registry_open()?;
        registry.simple.push(service.clone());
        let uid = registry.simple.len() as u32;
        let upcast: Arc<dyn Service> = service;
        registry.all.push((uid, upcast));
        Ok(uid)
    }

    pub fn add_aod_service(&self, service: Arc<dyn AodService>) -> Result<u32, RuntimeError> {
        let mut registry = self.registry_open()?;
        registry.aod.push(service.clone());
        let uid = registry.aod.len() as u32;
        let upcast: Arc<dyn Service> = service;
        registry.all.push((uid, upcast));
        Ok(uid)
    }

    pub fn add_active_service(&self, service: Arc<dyn ActiveService>) -> Result<u32, RuntimeError> {
        let mut registry = self.registry_open()?;
        registry.active.push(service.clone());
        let uid = registry.active.len() as u32;
        let upcast: Arc<dyn Service> = service;
        registry.all.push((uid, upcast));
        Ok(uid)
    }

    pub fn add_worker_service(&self, service: Arc<dyn WorkerService>) -> Result<u32, RuntimeError> {
        let mut registry = self.registry_open()?;
        registry.worker.push(service.clone());
        let uid = registry.worker.len() as u32;
        let upcast: Arc<dyn Service> = service;
        registry.all.push((uid, upcast));
        Ok(uid)
    }

    /// Start every group. With a captured calling thread this runs the
    /// master worker in place and returns [`ServerExit::Finalized`] only
    /// after the whole server stopped; otherwise it returns immediately
    /// with [`ServerExit::Detached`].
    pub fn start(self: &Arc<ServerInstance>) -> Result<ServerExit, RuntimeError> {
        if self.running.swap(true, AcqRel) {
            return Err(RuntimeError::AlreadyRunning);
        }

        self.freeze_services()?;

        for group in &self.groups {
            if let Err(e) = group.start(self) {
                error!(server = %self.name, "failed to start group '{}': {e}", group.tag().name);
                self.abort_start();
                return Err(e);
            }
        }

        if let Some((master, master_group)) = self.master.clone() {
            info!(server = %self.name, "running master worker on calling thread");
            run_worker(&master, &master_group, self);
            self.join();
            info!(server = %self.name, "server finalized");
            return Ok(ServerExit::Finalized);
        }

        Ok(ServerExit::Detached)
    }

    fn freeze_services(self: &Arc<ServerInstance>) -> Result<(), RuntimeError> {
        let snapshot = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            FrozenServices {
                all: registry.all.clone(),
                active: registry.active.clone(),
                worker: registry.worker.clone(),
            }
        };

        let _ = self.frozen.set(snapshot);
        let frozen = self.frozen.get().expect("frozen just set");

        for (uid, service) in &frozen.all {
            if let Err(e) = service.initialize(self) {
                error!(server = %self.name, uid, "service failed to initialize: {e}");
                self.running.store(false, Release);
                return Err(RuntimeError::ServiceInitFailure {
                    uid: *uid,
                    reason: e.to_string(),
                });
            }
            self.services_remaining.fetch_add(1, AcqRel);
        }

        debug!(
            server = %self.name,
            services = frozen.all.len(),
            "services initialized"
        );
        Ok(())
    }

    fn abort_start(&self) {
        for group in &self.groups {
            group.signal_to_stop();
        }
        self.startup_latch.force_open();
        self.shutdown_latch.force_open();
        self.join();
        self.running.store(false, Release);
    }

    /// Begin the orderly shutdown: notify services, and once the last one
    /// reports stopped, stop every group. Idempotent.
    pub fn signal_to_stop(self: &Arc<ServerInstance>) {
        if !self.running.swap(false, AcqRel) {
            debug!(server = %self.name, "already signaled to stop");
            return;
        }

        info!(server = %self.name, "stop signaled");

        match self.frozen.get() {
            Some(frozen) if !frozen.all.is_empty() => {
                for (uid, service) in &frozen.all {
                    match service.on_server_stop_signaled() {
                        StopSignalResult::Stopped => self.notify_service_stopped(*uid, Ok(())),
                        StopSignalResult::Pending => {
                            debug!(uid, "service stop pending");
                        }
                    }
                }
            }
            _ => self.stop_all_groups(),
        }
    }

    /// Report an asynchronously stopping service as stopped. Once every
    /// initialized service has reported, the groups shut down.
    pub fn notify_service_stopped(&self, uid: u32, result: Result<(), RuntimeError>) {
        if let Err(e) = result {
            // logged and counted; a failing stop must not wedge shutdown
            warn!(uid, "service failed to stop: {e}");
        }

        if self.services_remaining.fetch_sub(1, AcqRel) == 1 {
            debug!(server = %self.name, "all services stopped");
            self.stop_all_groups();
        }
    }

    fn stop_all_groups(&self) {
        for group in &self.groups {
            group.signal_to_stop();
        }
    }

    /// Block until every worker thread has exited.
    pub fn join(&self) {
        for group in &self.groups {
            group.join();
        }
    }

    pub(crate) fn handle_worker_started(
        self: &Arc<ServerInstance>,
        worker: &Arc<Worker>,
        group: &Arc<WorkerGroup>,
    ) -> bool {
        if let Some(frozen) = self.frozen.get() {
            for service in &frozen.worker {
                service.on_worker_started(worker, group);
            }
        }

        let total = self.running_workers.fetch_add(1, AcqRel) + 1;
        info!(
            group = %group.tag().name,
            worker = worker.index(),
            running = total,
            "worker started"
        );
        true
    }

    pub(crate) fn handle_worker_stopped(
        self: &Arc<ServerInstance>,
        worker: &Arc<Worker>,
        group: &Arc<WorkerGroup>,
    ) {
        if let Some(frozen) = self.frozen.get() {
            for service in &frozen.worker {
                service.on_worker_stopped(worker, group);
            }
        }

        let total = self.running_workers.fetch_sub(1, AcqRel) - 1;
        debug!(
            group = %group.tag().name,
            worker = worker.index(),
            running = total,
            "worker stopped"
        );
    }

    pub(crate) fn handle_group_started(self: &Arc<ServerInstance>, group: &Arc<WorkerGroup>) -> bool {
        debug!(group = %group.tag().name, "group started");

        let started = self.running_groups.fetch_add(1, AcqRel) + 1;
        if started == self.groups.len() as u32 {
            self.on_all_groups_started();
        }
        true
    }

    fn on_all_groups_started(self: &Arc<ServerInstance>) {
        info!(server = %self.name, "all worker groups started");

        let frozen = self.frozen.get().expect("frozen at start");
        for (_, service) in &frozen.all {
            service.on_server_started(self);
        }

        if frozen.active.is_empty() {
            return;
        }

        if !self.flags.supports_delayed_tasks {
            warn!(
                server = %self.name,
                "active services registered but no group handles timer tasks; they will not tick"
            );
            return;
        }

        // self-re-arming task that ticks the active services every loop
        // iteration of whichever worker it lands on
        let server = self.clone();
        crate::task::defer_task(make_task(move |ctx| {
            let frozen = server.frozen.get().expect("frozen at start");
            for service in &frozen.active {
                service.on_tick();
            }

            if server.is_running() {
                ctx.defer_again();
            } else {
                debug!("active service tick task retired");
            }
        }));
    }

    pub(crate) fn handle_group_stopped(self: &Arc<ServerInstance>, group: &Arc<WorkerGroup>) {
        debug!(group = %group.tag().name, "group stopped");

        // a group aborted before fully starting never incremented the count
        let previous = self
            .running_groups
            .fetch_update(AcqRel, Acquire, |count| count.checked_sub(1));
        if previous == Ok(1) {
            self.on_all_groups_stopped();
        }
    }

    fn on_all_groups_stopped(self: &Arc<ServerInstance>) {
        info!(server = %self.name, "all worker groups stopped");

        // stop may have been initiated by a worker rather than a signal
        self.running.store(false, Release);

        if let Some(frozen) = self.frozen.get() {
            for (_, service) in &frozen.all {
                service.on_server_stopped();
            }
        }
    }
}
