//! Orderly shutdown under load, and the asynchronous service-stop path.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use palisade_runtime::{
    Accepted, CompletionPort, IoBuffer, IoStatus, RuntimeError, ServerConfig, ServerExit,
    ServerInstance, Service, SimpleService, SocketId, StopSignalResult, TcpAcceptorConfig,
    WorkerGroupConfig, WorkerGroupTag,
};

const CLIENTS: usize = 16;

fn on_accept(accepted: Accepted) {
    arm_receive(&accepted.port, accepted.socket, IoBuffer::zeroed(1024));
}

fn arm_receive(port: &CompletionPort, socket: SocketId, buffer: IoBuffer) {
    let reply_port = port.clone();
    let _ = port.begin_receive(socket, buffer, move |result| {
        if result.status != IoStatus::Success || result.bytes == 0 {
            reply_port.close(result.socket);
            return;
        }
        let reply = IoBuffer::from_vec(result.buffer.as_slice()[..result.bytes].to_vec());
        let recv_buffer = result.buffer;
        let rearm_port = reply_port.clone();
        let _ = reply_port.begin_send(result.socket, reply, move |sent| {
            if sent.status != IoStatus::Success {
                rearm_port.close(sent.socket);
                return;
            }
            arm_receive(&rearm_port, sent.socket, recv_buffer);
        });
    });
}

/// Reports `Pending` on the stop signal and finishes from a background
/// thread, holding the worker groups up until then.
#[derive(Default)]
struct SlowStopService {
    server: Mutex<Weak<ServerInstance>>,
    uid: AtomicU32,
    stop_signaled: AtomicBool,
    stopped: AtomicBool,
}

impl Service for SlowStopService {
    fn initialize(&self, server: &Arc<ServerInstance>) -> Result<(), RuntimeError> {
        *self.server.lock().unwrap() = Arc::downgrade(server);
        Ok(())
    }

    fn on_server_stop_signaled(&self) -> StopSignalResult {
        self.stop_signaled.store(true, SeqCst);

        let server = self.server.lock().unwrap().upgrade().expect("server alive");
        let uid = self.uid.load(SeqCst);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            server.notify_service_stopped(uid, Ok(()));
        });

        StopSignalResult::Pending
    }

    fn on_server_stopped(&self) {
        assert!(
            self.stop_signaled.load(SeqCst),
            "stopped before stop was signaled"
        );
        self.stopped.store(true, SeqCst);
    }
}

impl SimpleService for SlowStopService {}

fn build_server(service: Arc<SlowStopService>) -> Arc<ServerInstance> {
    let mut io_group = WorkerGroupConfig::new(WorkerGroupTag {
        id: 1,
        name: "io".into(),
        workers_count: 2,
        tick_rate: 100,
        is_active: true,
        enable_async_io: true,
        supports_tcp_async_acceptors: true,
        ..Default::default()
    });
    io_group.acceptors.push(TcpAcceptorConfig {
        id: 1,
        addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        backlog: 128,
        on_accept: Arc::new(on_accept),
    });

    let logic_group = WorkerGroupConfig::new(WorkerGroupTag {
        id: 2,
        name: "logic".into(),
        workers_count: 1,
        tick_rate: 100,
        is_active: true,
        handles_timer_tasks: true,
        supports_aod: true,
        ..Default::default()
    });

    let mut config = ServerConfig::new("shutdown-test");
    config.groups.push(io_group);
    config.groups.push(logic_group);

    let server = ServerInstance::initialize(config).unwrap();
    let uid = server.add_simple_service(service.clone()).unwrap();
    service.uid.store(uid, SeqCst);

    assert_eq!(server.start().unwrap(), ServerExit::Detached);
    server
}

fn listener_addr(server: &Arc<ServerInstance>) -> SocketAddr {
    let acceptor = server
        .group_by_id(1)
        .and_then(|g| g.acceptor_by_id(1).cloned())
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(addr) = acceptor.local_addr() {
            return addr;
        }
        assert!(Instant::now() < deadline, "acceptor never started");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn shutdown_under_load_finishes_promptly() {
    let service = Arc::new(SlowStopService::default());
    let server = build_server(service.clone());
    let addr = listener_addr(&server);

    let keep_sending = Arc::new(AtomicBool::new(true));
    let round_trips = Arc::new(AtomicUsize::new(0));

    let clients: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let keep_sending = keep_sending.clone();
            let round_trips = round_trips.clone();
            thread::spawn(move || {
                let Ok(mut stream) = TcpStream::connect(addr) else {
                    return;
                };
                stream
                    .set_read_timeout(Some(Duration::from_secs(2)))
                    .unwrap();

                let payload = [42u8; 64];
                let mut reply = [0u8; 64];
                while keep_sending.load(SeqCst) {
                    if stream.write_all(&payload).is_err() {
                        break;
                    }
                    if stream.read_exact(&mut reply).is_err() {
                        break;
                    }
                    round_trips.fetch_add(1, SeqCst);
                }
            })
        })
        .collect();

    // let the load build up
    let warmup = Instant::now() + Duration::from_millis(300);
    while Instant::now() < warmup {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(round_trips.load(SeqCst) > 0, "no echo traffic before stop");

    let signal_started = Instant::now();
    server.signal_to_stop();
    assert!(
        signal_started.elapsed() < Duration::from_secs(1),
        "signal_to_stop blocked"
    );

    server.join();

    keep_sending.store(false, SeqCst);
    for client in clients {
        client.join().unwrap();
    }

    assert!(service.stop_signaled.load(SeqCst));
    assert!(service.stopped.load(SeqCst), "service never saw stop");
}
