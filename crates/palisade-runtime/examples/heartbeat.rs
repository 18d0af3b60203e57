//! Minimal runtime usage: one active group, a repeating heartbeat task,
//! and per-worker metrics printed at shutdown.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

use palisade_runtime::{
    ServerConfig, ServerInstance, WorkerGroupConfig, WorkerGroupTag, defer_task_after, make_task,
};

fn main() {
    let beats = Arc::new(AtomicUsize::new(0));
    let beats_in_task = beats.clone();

    let mut group = WorkerGroupConfig::new(WorkerGroupTag {
        id: 1,
        name: "heartbeat".into(),
        workers_count: 2,
        tick_rate: 60,
        is_active: true,
        handles_timer_tasks: true,
        supports_aod: true,
        ..Default::default()
    });
    group.on_worker_start = Some(Arc::new(move |worker, _group| {
        // seed one repeating beat from the first worker up
        if worker.index() % 2 == 1 {
            let beats = beats_in_task.clone();
            defer_task_after(
                Duration::from_millis(250),
                make_task(move |ctx| {
                    let n = beats.fetch_add(1, Relaxed) + 1;
                    println!("beat {n}");
                    ctx.defer_again_after(Duration::from_millis(250));
                }),
            );
        }
    }));

    let mut config = ServerConfig::new("heartbeat");
    config.groups.push(group);

    let server = ServerInstance::initialize(config).expect("config is valid");
    server.start().expect("server starts");

    std::thread::sleep(Duration::from_secs(3));
    server.signal_to_stop();
    server.join();

    for group in server.groups() {
        for worker in group.workers() {
            println!("worker {}: {:?}", worker.index(), worker.metrics());
        }
    }
    println!("total beats: {}", beats.load(Relaxed));
}
