//! Accept + echo through the completion port, and clean cancellation of
//! outstanding receives on shutdown.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use palisade_runtime::{
    Accepted, CompletionPort, IoBuffer, IoStatus, ServerConfig, ServerExit, ServerInstance,
    SocketId, TcpAcceptorConfig, WorkerGroupConfig, WorkerGroupTag,
};

const FRAME: usize = 64;
const FRAMES: usize = 100;

fn echo_server() -> Arc<ServerInstance> {
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

    let mut config = ServerConfig::new("echo-test");
    config.groups.push(io_group);
    config.groups.push(logic_group);

    let server = ServerInstance::initialize(config).unwrap();
    assert_eq!(server.start().unwrap(), ServerExit::Detached);
    server
}

fn on_accept(accepted: Accepted) {
    arm_receive(&accepted.port, accepted.socket, IoBuffer::zeroed(4096));
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

fn wait_for_listener(server: &Arc<ServerInstance>) -> SocketAddr {
    let acceptor = server
        .group_by_id(1)
        .and_then(|g| g.acceptor_by_id(1).cloned())
        .expect("io group has acceptor 1");

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
fn echoes_every_frame() {
    let server = echo_server();
    let addr = wait_for_listener(&server);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut echoed = 0usize;
    for frame in 0..FRAMES {
        let payload = [frame as u8; FRAME];
        stream.write_all(&payload).unwrap();

        let mut reply = [0u8; FRAME];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, payload, "frame {frame} corrupted");
        echoed += reply.len();
    }
    assert_eq!(echoed, FRAME * FRAMES);

    server.signal_to_stop();
    server.join();
}

#[test]
fn shutdown_cancels_outstanding_receives() {
    let server = echo_server();
    let addr = wait_for_listener(&server);

    // connect and say nothing: the server parks a receive on the socket
    let mut idle = TcpStream::connect(addr).unwrap();
    idle.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // one echo round-trip proves the connection is armed
    idle.write_all(&[7u8; 8]).unwrap();
    let mut reply = [0u8; 8];
    idle.read_exact(&mut reply).unwrap();

    server.signal_to_stop();
    server.join();

    // cancelled receive closed the connection; the client observes EOF
    let mut buf = [0u8; 8];
    match idle.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected EOF, read {n} bytes"),
        // a reset is acceptable too, the socket is gone either way
        Err(_) => {}
    }
}
