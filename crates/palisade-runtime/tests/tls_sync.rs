//! TLS-sync broadcast: an update published once is applied from every
//! participating worker's own tick.

use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use palisade_runtime::{ServerConfig, ServerExit, ServerInstance, WorkerGroupConfig, WorkerGroupTag};

#[test]
fn published_update_reaches_every_worker() {
    let group = WorkerGroupConfig::new(WorkerGroupTag {
        id: 1,
        name: "synced".into(),
        workers_count: 3,
        tick_rate: 100,
        sync_tls_tick_rate: 200,
        is_active: true,
        supports_tls_sync: true,
        ..Default::default()
    });

    let mut config = ServerConfig::new("tls-sync-test");
    config.groups.push(group);

    let server = ServerInstance::initialize(config).unwrap();
    assert_eq!(server.start().unwrap(), ServerExit::Detached);

    let applied = Arc::new(AtomicUsize::new(0));
    let applied_on = Arc::new(Mutex::new(HashSet::new()));

    let sync = server.tls_sync().expect("group opted into TLS sync");
    let counter = applied.clone();
    let seen = applied_on.clone();
    sync.publish(Arc::new(move |worker, _group| {
        seen.lock().unwrap().insert(worker.index());
        counter.fetch_add(1, SeqCst);
    }));

    let deadline = Instant::now() + Duration::from_secs(5);
    while applied.load(SeqCst) < 3 {
        assert!(Instant::now() < deadline, "TLS-sync update never applied");
        thread::sleep(Duration::from_millis(10));
    }

    server.signal_to_stop();
    server.join();

    // applied exactly once per worker, on three distinct workers
    assert_eq!(applied.load(SeqCst), 3);
    assert_eq!(applied_on.lock().unwrap().len(), 3);
}
