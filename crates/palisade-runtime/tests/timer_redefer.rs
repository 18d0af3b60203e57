//! A task that re-arms itself keeps a steady cadence and never fires twice
//! in the tick that re-armed it.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use palisade_runtime::{
    ServerConfig, ServerExit, ServerInstance, WorkerGroupConfig, WorkerGroupTag, defer_task_after,
    make_task, uptime_millis,
};

const INTERVAL: Duration = Duration::from_millis(100);
const CYCLES: usize = 10;

#[test]
fn redefer_cadence_holds() {
    let fire_times: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let fired = Arc::new(AtomicUsize::new(0));

    let hook_times = fire_times.clone();
    let hook_fired = fired.clone();

    let mut group = WorkerGroupConfig::new(WorkerGroupTag {
        id: 1,
        name: "timers".into(),
        workers_count: 1,
        // fine-grained ticks so quantization stays within the tolerance
        tick_rate: 250,
        is_active: true,
        handles_timer_tasks: true,
        supports_aod: true,
        ..Default::default()
    });
    group.on_worker_start = Some(Arc::new(move |_, _| {
        let times = hook_times.clone();
        let fired = hook_fired.clone();
        let task = make_task(move |ctx| {
            times.lock().unwrap().push(uptime_millis());
            if fired.fetch_add(1, SeqCst) + 1 < CYCLES {
                ctx.defer_again_after(INTERVAL);
            }
        });
        defer_task_after(INTERVAL, task);
    }));

    let mut config = ServerConfig::new("redefer-test");
    config.groups.push(group);

    let server = ServerInstance::initialize(config).unwrap();
    assert_eq!(server.start().unwrap(), ServerExit::Detached);

    let deadline = Instant::now() + Duration::from_secs(10);
    while fired.load(SeqCst) < CYCLES {
        assert!(Instant::now() < deadline, "timer task stalled");
        thread::sleep(Duration::from_millis(10));
    }

    server.signal_to_stop();
    server.join();

    let times = fire_times.lock().unwrap();
    assert_eq!(times.len(), CYCLES);

    let intervals: Vec<u64> = times.windows(2).map(|w| w[1] - w[0]).collect();
    for (i, interval) in intervals.iter().enumerate() {
        // a re-armed task must not fire within the arming tick
        assert!(*interval >= INTERVAL.as_millis() as u64, "cycle {i} fired early: {interval}ms");
    }

    let mean = intervals.iter().sum::<u64>() as f64 / intervals.len() as f64;
    let target = INTERVAL.as_millis() as f64;
    assert!(
        (mean - target).abs() <= 10.0,
        "mean interval {mean:.1}ms drifted from {target}ms"
    );
}
