//! Service lifecycle: registration rules, uid numbering, worker-service
//! hooks, active-service ticking, and exactly-once stop notification.

use std::sync::Arc;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::thread;
use std::time::{Duration, Instant};

use palisade_runtime::{
    ActiveService, RuntimeError, ServerConfig, ServerExit, ServerInstance, Service, SimpleService,
    WorkerGroup, WorkerGroupConfig, WorkerGroupTag, WorkerService,
};

#[derive(Default)]
struct Probe {
    initialized: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
    worker_starts: AtomicUsize,
    worker_stops: AtomicUsize,
    worker_ticks: AtomicUsize,
    ticks: AtomicUsize,
    saw_start_before_stop: AtomicBool,
}

impl Service for Probe {
    fn initialize(&self, _server: &Arc<ServerInstance>) -> Result<(), RuntimeError> {
        self.initialized.fetch_add(1, SeqCst);
        Ok(())
    }

    fn on_server_started(&self, _server: &Arc<ServerInstance>) {
        self.started.fetch_add(1, SeqCst);
    }

    fn on_server_stopped(&self) {
        if self.started.load(SeqCst) > 0 {
            self.saw_start_before_stop.store(true, SeqCst);
        }
        self.stopped.fetch_add(1, SeqCst);
    }
}

impl SimpleService for Probe {}

impl ActiveService for Probe {
    fn on_tick(&self) {
        self.ticks.fetch_add(1, SeqCst);
    }
}

impl WorkerService for Probe {
    fn on_worker_started(&self, _worker: &palisade_runtime::Worker, _group: &WorkerGroup) {
        self.worker_starts.fetch_add(1, SeqCst);
    }

    fn on_worker_stopped(&self, _worker: &palisade_runtime::Worker, _group: &WorkerGroup) {
        self.worker_stops.fetch_add(1, SeqCst);
    }

    fn on_tick_worker(&self, _worker: &palisade_runtime::Worker, _group: &WorkerGroup) {
        self.worker_ticks.fetch_add(1, SeqCst);
    }
}

fn two_group_config() -> ServerConfig {
    let ticking = WorkerGroupConfig::new(WorkerGroupTag {
        id: 1,
        name: "ticking".into(),
        workers_count: 2,
        tick_rate: 200,
        is_active: true,
        handles_timer_tasks: true,
        supports_aod: true,
        tick_worker_services: true,
        ..Default::default()
    });

    let plain = WorkerGroupConfig::new(WorkerGroupTag {
        id: 2,
        name: "plain".into(),
        workers_count: 1,
        tick_rate: 200,
        is_active: true,
        ..Default::default()
    });

    let mut config = ServerConfig::new("services-test");
    config.groups.push(ticking);
    config.groups.push(plain);
    config
}

#[test]
fn full_lifecycle_reaches_every_hook() {
    let probe = Arc::new(Probe::default());

    let server = ServerInstance::initialize(two_group_config()).unwrap();
    server.add_simple_service(probe.clone()).unwrap();
    server.add_active_service(probe.clone()).unwrap();
    server.add_worker_service(probe.clone()).unwrap();

    assert_eq!(server.start().unwrap(), ServerExit::Detached);

    // the active service is ticked by a self-re-arming task; the worker
    // service by the ticking group's three loop slots
    let deadline = Instant::now() + Duration::from_secs(5);
    while probe.ticks.load(SeqCst) < 5 || probe.worker_ticks.load(SeqCst) < 5 {
        assert!(Instant::now() < deadline, "services never ticked");
        thread::sleep(Duration::from_millis(10));
    }

    server.signal_to_stop();
    server.join();

    // registered three times, so three lifecycle passes
    assert_eq!(probe.initialized.load(SeqCst), 3);
    assert_eq!(probe.started.load(SeqCst), 3);
    assert_eq!(probe.stopped.load(SeqCst), 3);
    assert!(probe.saw_start_before_stop.load(SeqCst));

    // worker hooks fire once per worker across all groups
    assert_eq!(probe.worker_starts.load(SeqCst), 3);
    assert_eq!(probe.worker_stops.load(SeqCst), 3);
}

#[test]
fn uids_are_one_based_per_kind() {
    let server = ServerInstance::initialize(two_group_config()).unwrap();

    let a = Arc::new(Probe::default());
    let b = Arc::new(Probe::default());

    assert_eq!(server.add_simple_service(a.clone()).unwrap(), 1);
    assert_eq!(server.add_simple_service(b.clone()).unwrap(), 2);
    // a different kind starts its own numbering
    assert_eq!(server.add_worker_service(a).unwrap(), 1);
}

#[test]
fn registration_closes_at_start() {
    let server = ServerInstance::initialize(two_group_config()).unwrap();
    assert_eq!(server.start().unwrap(), ServerExit::Detached);

    let late = Arc::new(Probe::default());
    assert!(matches!(
        server.add_simple_service(late),
        Err(RuntimeError::RegistryFrozen)
    ));

    server.signal_to_stop();
    server.join();
}
