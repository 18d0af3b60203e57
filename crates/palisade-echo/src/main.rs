//!
//! # Echo Server Operating Model
//!
//! Two worker groups: an IO group that owns the completion port and the
//! TCP acceptor, and a logic group that hosts timer tasks and AOD. Each
//! accepted connection keeps one receive armed; its completion posts the
//! bytes back and re-arms. The calling thread is captured as the master
//! worker, so `start` returns only after Ctrl-C has wound the server down.
//!
mod args;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

use clap::Parser;
use palisade_runtime::{
    Accepted, CompletionPort, IoBuffer, IoStatus, ServerConfig, ServerInstance, Service,
    SimpleService, SocketId, TcpAcceptorConfig, WorkerGroupConfig, WorkerGroupTag,
};
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter};

use args::Args;

const ACCEPTOR_ID: u32 = 1;
const RECV_BUFFER_SIZE: usize = 64 * 1024;

fn main() {
    let args = Args::parse();
    enable_logging(&args);
    debug!("{args:?}");

    let stats = Arc::new(EchoStats::default());

    let server = ServerInstance::initialize(server_config(&args, stats.clone()))
        .unwrap_or_else(|e| panic!("initializing server: {e}"));
    server
        .add_simple_service(stats)
        .expect("registering echo stats service");

    set_ctrlc_handler(&server);

    let exit = server.start().unwrap_or_else(|e| panic!("starting server: {e}"));
    info!("server finished: {exit:?}");
}

fn server_config(args: &Args, stats: Arc<EchoStats>) -> ServerConfig {
    let ip: Ipv4Addr = args
        .interface
        .parse()
        .unwrap_or_else(|e| panic!("parsing interface address: {e}"));

    let mut io_group = WorkerGroupConfig::new(WorkerGroupTag {
        id: 1,
        name: "echo-io".into(),
        workers_count: args.io_workers,
        tick_rate: args.tick_rate,
        is_active: true,
        enable_async_io: true,
        supports_tcp_async_acceptors: true,
        ..Default::default()
    });
    io_group.acceptors.push(TcpAcceptorConfig {
        id: ACCEPTOR_ID,
        addr: SocketAddrV4::new(ip, args.port),
        backlog: args.backlog,
        on_accept: Arc::new(move |accepted| on_accept(accepted, &stats)),
    });

    let logic_group = WorkerGroupConfig::new(WorkerGroupTag {
        id: 2,
        name: "echo-logic".into(),
        workers_count: args.logic_workers,
        tick_rate: args.tick_rate,
        is_active: true,
        supports_aod: true,
        handles_timer_tasks: true,
        ..Default::default()
    });

    let mut config = ServerConfig::new("palisade-echo");
    config.groups.push(io_group);
    config.groups.push(logic_group);
    config.capture_calling_thread = true;
    config
}

fn on_accept(accepted: Accepted, stats: &Arc<EchoStats>) {
    stats.connections.fetch_add(1, Relaxed);
    debug!(peer = %accepted.peer, "connection accepted");
    arm_receive(&accepted.port, accepted.socket, IoBuffer::zeroed(RECV_BUFFER_SIZE));
}

/// Keep exactly one receive in flight per connection; each completion
/// sends the bytes back and re-arms with the same buffer.
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

#[derive(Default)]
struct EchoStats {
    connections: AtomicU64,
}

impl Service for EchoStats {
    fn on_server_stopped(&self) {
        info!(
            connections = self.connections.load(Relaxed),
            "echo server stopped"
        );
    }
}

impl SimpleService for EchoStats {}

fn set_ctrlc_handler(server: &Arc<ServerInstance>) {
    let server = server.clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl-C, exiting...");
        server.signal_to_stop();
    })
    .expect("Error setting Ctrl-C handler");
}

fn enable_logging(args: &Args) {
    let verbosity = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        2.. => tracing::Level::TRACE,
    };

    let filters = filter::Targets::new().with_default(verbosity);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(filters);

    tracing_subscriber::registry().with(fmt_layer).init();
}
